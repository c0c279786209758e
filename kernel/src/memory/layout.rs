//! User address-space layout constants
//!
//! Every process sees the same lower-half layout. From high to low:
//!
//! ```text
//!   USER_SPACE_END  ---------------------------  0x0000_8000_0000_0000
//!                     (unused, non-canonical above)
//!   UXSTACKTOP      ---------------------------  0x0000_7fff_ffff_f000
//!                     user exception stack (1 page, never COW)
//!   UXSTACK         ---------------------------
//!                     empty guard page
//!   USTACKTOP       ---------------------------
//!                     normal user stack, heap, data, text
//!   UTEXT           ---------------------------  0x0000_0000_0080_0000
//!   PFTEMP                                        UTEXT - PAGE_SIZE
//! ```
//!
//! Fork duplicates `[UTEXT, USTACKTOP)`. The exception stack and the COW
//! scratch slot lie outside that range on purpose.

use x86_64::VirtAddr;

/// Size of a page in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// Lowest address user text is loaded at.
pub const UTEXT: u64 = 0x0000_0000_0080_0000;

/// First address past the user half (exclusive).
pub const USER_SPACE_END: u64 = 0x0000_8000_0000_0000;

/// Top of the user exception stack (exclusive).
pub const UXSTACKTOP: u64 = 0x0000_7fff_ffff_f000;

/// The single page backing the user exception stack.
pub const UXSTACK: u64 = UXSTACKTOP - PAGE_SIZE;

/// Top of the normal user stack. One guard page separates it from UXSTACK.
pub const USTACKTOP: u64 = UXSTACKTOP - 2 * PAGE_SIZE;

/// Scratch page used while resolving a COW fault. One slot per process.
pub const PFTEMP: u64 = UTEXT - PAGE_SIZE;

/// Round `addr` down to a page boundary.
#[inline]
pub const fn page_align_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

/// Round `addr` up to a page boundary, or `None` past the top of the address space.
#[inline]
pub const fn page_align_up(addr: u64) -> Option<u64> {
    match addr.checked_add(PAGE_SIZE - 1) {
        Some(sum) => Some(page_align_down(sum)),
        None => None,
    }
}

/// Check if an address is page aligned.
#[inline]
pub const fn is_page_aligned(addr: u64) -> bool {
    addr & (PAGE_SIZE - 1) == 0
}

/// True if `addr` is a page-aligned address that user mappings may occupy.
pub fn is_user_page(addr: VirtAddr) -> bool {
    is_page_aligned(addr.as_u64()) && addr.as_u64() < USER_SPACE_END
}

/// Log the user layout (used by `kerninfo` and at startup).
pub fn log_layout() {
    log::info!("LAYOUT: user address space:");
    log::info!("  UTEXT       {:#018x}", UTEXT);
    log::info!("  USTACKTOP   {:#018x}", USTACKTOP);
    log::info!("  UXSTACK     {:#018x}", UXSTACK);
    log::info!("  UXSTACKTOP  {:#018x}", UXSTACKTOP);
    log::info!("  PFTEMP      {:#018x}", PFTEMP);
}
