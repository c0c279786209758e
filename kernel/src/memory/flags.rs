//! Page permission bits.
//!
//! Wraps the x86_64 crate's `PageTableFlags` the same way the arch layer
//! wraps hardware flags, and adds the two software markers kept in the
//! OS-available bits of a PTE:
//!
//! - `BIT_9`  copy-on-write
//! - `BIT_10` shared (fork maps the frame verbatim instead of COW)
//!
//! Two whitelists gate what callers may write:
//!
//! - [`PagePermissions::SYSCALL_MASK`] for kernel primitives (`page_alloc`,
//!   `page_map`) and therefore for fork.
//! - [`PagePermissions::EDITABLE_MASK`] for the monitor's permission commands.

use core::fmt;
use core::ops::{BitOr, BitOrAssign};
use x86_64::structures::paging::PageTableFlags;

/// Typed permission set stored in the low bits of a PTE.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PagePermissions(PageTableFlags);

impl PagePermissions {
    pub const PRESENT: Self = Self(PageTableFlags::PRESENT);
    pub const WRITABLE: Self = Self(PageTableFlags::WRITABLE);
    pub const USER_ACCESSIBLE: Self = Self(PageTableFlags::USER_ACCESSIBLE);
    pub const LARGE_PAGE: Self = Self(PageTableFlags::HUGE_PAGE);
    pub const COPY_ON_WRITE: Self = Self(PageTableFlags::BIT_9);
    pub const SHARED: Self = Self(PageTableFlags::BIT_10);

    /// Bits 9-11, reserved for the OS by the hardware.
    pub const AVAILABLE: Self = Self(
        PageTableFlags::BIT_9
            .union(PageTableFlags::BIT_10)
            .union(PageTableFlags::BIT_11),
    );

    /// Bits a kernel primitive accepts from its caller.
    pub const SYSCALL_MASK: Self = Self(
        PageTableFlags::PRESENT
            .union(PageTableFlags::WRITABLE)
            .union(PageTableFlags::USER_ACCESSIBLE)
            .union(Self::AVAILABLE.0),
    );

    /// Bits the monitor's setperm/addperm/rmperm may touch.
    pub const EDITABLE_MASK: Self = Self(
        PageTableFlags::HUGE_PAGE
            .union(PageTableFlags::WRITABLE)
            .union(PageTableFlags::USER_ACCESSIBLE),
    );

    /// The low twelve bits of an entry; everything a `Set` edit replaces.
    pub const LOW_BITS: Self = Self(PageTableFlags::from_bits_truncate(0xfff));

    /// Present + Writable + UserAccessible: a private, writable user page.
    pub const USER_RW: Self = Self(
        PageTableFlags::PRESENT
            .union(PageTableFlags::WRITABLE)
            .union(PageTableFlags::USER_ACCESSIBLE),
    );

    /// Present + UserAccessible: a read-only user page.
    pub const USER_RO: Self =
        Self(PageTableFlags::PRESENT.union(PageTableFlags::USER_ACCESSIBLE));

    #[inline]
    pub const fn empty() -> Self {
        Self(PageTableFlags::empty())
    }

    /// Decode the permission bits of a raw PTE value. Address bits are dropped.
    #[inline]
    pub const fn decode(raw: u64) -> Self {
        Self(PageTableFlags::from_bits_truncate(raw))
    }

    /// Encode back into raw PTE bits.
    #[inline]
    pub const fn encode(self) -> u64 {
        self.0.bits()
    }

    /// Create from raw x86_64 crate flags.
    #[inline]
    pub const fn from_raw(flags: PageTableFlags) -> Self {
        Self(flags)
    }

    /// Get the underlying x86_64 crate flags.
    #[inline]
    pub const fn as_raw(self) -> PageTableFlags {
        self.0
    }

    /// True if every bit lies inside the syscall whitelist.
    ///
    /// This is what keeps a caller from forging kernel-only bits (global,
    /// cache control, dirty/accessed, NX) through fork or `page_map`.
    #[inline]
    pub const fn is_syscall_legal(self) -> bool {
        self.0.difference(Self::SYSCALL_MASK.0).is_empty()
    }

    /// Drop every bit outside the syscall whitelist.
    #[inline]
    pub const fn masked_to_syscall(self) -> Self {
        Self(self.0.intersection(Self::SYSCALL_MASK.0))
    }

    /// Drop every bit the monitor is not allowed to edit.
    #[inline]
    pub const fn masked_to_editable(self) -> Self {
        Self(self.0.intersection(Self::EDITABLE_MASK.0))
    }

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0.contains(other.0)
    }

    #[inline]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0.union(other.0))
    }

    #[inline]
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0.difference(other.0))
    }

    #[inline]
    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0.intersection(other.0))
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn insert(&mut self, other: Self) {
        self.0.insert(other.0);
    }

    #[inline]
    pub fn remove(&mut self, other: Self) {
        self.0.remove(other.0);
    }

    #[inline]
    pub const fn is_present(self) -> bool {
        self.contains(Self::PRESENT)
    }

    #[inline]
    pub const fn is_writable(self) -> bool {
        self.contains(Self::WRITABLE)
    }

    #[inline]
    pub const fn is_user(self) -> bool {
        self.contains(Self::USER_ACCESSIBLE)
    }

    #[inline]
    pub const fn is_cow(self) -> bool {
        self.contains(Self::COPY_ON_WRITE)
    }

    #[inline]
    pub const fn is_shared(self) -> bool {
        self.contains(Self::SHARED)
    }

    #[inline]
    pub const fn is_large_page(self) -> bool {
        self.contains(Self::LARGE_PAGE)
    }

    /// A mapping is never natively writable and copy-on-write at once.
    #[inline]
    pub const fn is_consistent(self) -> bool {
        !(self.is_writable() && self.is_cow())
    }

    /// Permissions a private page gets once fork has duplicated it:
    /// writable or already-COW pages become read-only COW, read-only pages
    /// stay as they are.
    pub const fn to_copy_on_write(self) -> Self {
        if self.is_writable() || self.is_cow() {
            self.difference(Self::WRITABLE).union(Self::COPY_ON_WRITE)
        } else {
            self
        }
    }

    /// Fixed-width display summary (see [`PermissionSummary`]).
    #[inline]
    pub const fn summary(self) -> PermissionSummary {
        PermissionSummary(self)
    }
}

impl BitOr for PagePermissions {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

impl BitOrAssign for PagePermissions {
    #[inline]
    fn bitor_assign(&mut self, rhs: Self) {
        self.insert(rhs);
    }
}

/// Nine-character view of bits 8..0: `S` large page, `U` user, `W` writable,
/// `P` present, `-` for every other position.
#[derive(Copy, Clone, Debug)]
pub struct PermissionSummary(PagePermissions);

impl fmt::Display for PermissionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = self.0;
        let pick = |set: bool, c: char| if set { c } else { '-' };
        write!(
            f,
            "-{}----{}{}{}",
            pick(p.is_large_page(), 'S'),
            pick(p.is_user(), 'U'),
            pick(p.is_writable(), 'W'),
            pick(p.is_present(), 'P'),
        )
    }
}
