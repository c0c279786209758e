//! Permission edits on existing mappings.
//!
//! An edit never creates a mapping and never removes one: the frame binding
//! is kept and Present is forced back on for every mode.

use core::fmt;
use x86_64::structures::paging::{Page, Size4KiB};
use x86_64::VirtAddr;

use super::flags::PagePermissions;
use super::frame_allocator::PhysicalMemory;
use super::layout::page_align_down;
use super::paging::AddressSpace;
use super::MemoryError;

/// How the requested bits combine with the current ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditMode {
    /// Replace the low twelve bits.
    Set,
    /// Bitwise OR.
    Add,
    /// Bitwise AND-NOT.
    Remove,
}

impl fmt::Display for EditMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EditMode::Set => "set",
            EditMode::Add => "add",
            EditMode::Remove => "remove",
        };
        f.write_str(name)
    }
}

/// Before and after of a successful edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionChange {
    pub va: u64,
    pub before: PagePermissions,
    pub after: PagePermissions,
}

/// Pure edit rule, applied to already-masked `requested` bits.
pub fn apply_edit(
    current: PagePermissions,
    requested: PagePermissions,
    mode: EditMode,
) -> PagePermissions {
    let edited = match mode {
        EditMode::Set => current.difference(PagePermissions::LOW_BITS).union(requested),
        EditMode::Add => current.union(requested),
        EditMode::Remove => current.difference(requested),
    };
    edited.union(PagePermissions::PRESENT)
}

/// Edit the permissions of the page containing `va`.
///
/// `requested` is masked to the editable whitelist first. Fails with
/// `NotMapped`, leaving the tables untouched, if there is no present mapping.
pub fn change_permission(
    space: &AddressSpace,
    mem: &mut PhysicalMemory,
    va: u64,
    requested: PagePermissions,
    mode: EditMode,
) -> Result<PermissionChange, MemoryError> {
    let va = page_align_down(va);
    let addr = VirtAddr::try_new(va).map_err(|_| MemoryError::NotMapped)?;
    let page = Page::<Size4KiB>::containing_address(addr);
    let requested = requested.masked_to_editable();

    let entry = space
        .entry_mut(mem, page, false)?
        .ok_or(MemoryError::NotMapped)?;
    let before = PagePermissions::from_raw(entry.flags());
    if !before.is_present() {
        return Err(MemoryError::NotMapped);
    }

    let after = apply_edit(before, requested, mode);
    entry.set_flags(after.as_raw());

    if !after.is_consistent() {
        log::warn!(
            "permission {} at {:#x} left the page both writable and copy-on-write",
            mode,
            va
        );
    }
    log::debug!(
        "permission {} at {:#x}: {} -> {}",
        mode,
        va,
        before.summary(),
        after.summary()
    );
    Ok(PermissionChange { va, before, after })
}
