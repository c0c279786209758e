//! Per-process four-level page tables.
//!
//! An `AddressSpace` is just the frame of its level-4 table. Every operation
//! takes the `PhysicalMemory` the tables live in, so a replicator can edit a
//! second address space while acting for the first one.

use alloc::vec::Vec;
use x86_64::structures::paging::page_table::PageTableEntry;
use x86_64::structures::paging::{
    Page, PageTable, PageTableFlags, PageTableIndex, PhysFrame, Size4KiB,
};
use x86_64::VirtAddr;

use super::flags::PagePermissions;
use super::frame_allocator::PhysicalMemory;
use super::layout::USER_SPACE_END;
use super::MemoryError;

/// Flags for entries that point at a lower-level table.
const TABLE_FLAGS: PageTableFlags = PageTableFlags::PRESENT
    .union(PageTableFlags::WRITABLE)
    .union(PageTableFlags::USER_ACCESSIBLE);

/// Levels above the leaf table (L4, L3, L2).
const UPPER_LEVELS: usize = 3;

/// A present leaf mapping as reported by [`AddressSpace::present_pages`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub page: Page<Size4KiB>,
    pub frame: PhysFrame,
    pub perms: PagePermissions,
}

/// Result of walking the upper levels for one page.
enum Walk {
    /// The level-1 table holding the page's entry.
    Complete(PhysFrame),
    /// `table` (at `depth`, 0 = level 4) has no entry for the next level.
    Missing { table: PhysFrame, depth: usize },
}

fn table_indices(page: Page<Size4KiB>) -> [PageTableIndex; 4] {
    [
        page.p4_index(),
        page.p3_index(),
        page.p2_index(),
        page.p1_index(),
    ]
}

fn present_frame(entry: &PageTableEntry) -> Option<PhysFrame> {
    if entry.flags().contains(PageTableFlags::PRESENT) {
        Some(PhysFrame::containing_address(entry.addr()))
    } else {
        None
    }
}

/// A process address space, identified by its level-4 table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpace {
    level_4_frame: PhysFrame,
}

impl AddressSpace {
    /// Allocate an empty level-4 table.
    pub fn new(mem: &mut PhysicalMemory) -> Result<Self, MemoryError> {
        let level_4_frame = mem.allocate_zeroed()?;
        log::debug!(
            "AddressSpace: new L4 table at {:#x}",
            level_4_frame.start_address().as_u64()
        );
        Ok(Self { level_4_frame })
    }

    pub fn level_4_frame(&self) -> PhysFrame {
        self.level_4_frame
    }

    fn walk(&self, mem: &PhysicalMemory, page: Page<Size4KiB>) -> Result<Walk, MemoryError> {
        let indices = table_indices(page);
        let mut table = self.level_4_frame;
        for (depth, &index) in indices[..UPPER_LEVELS].iter().enumerate() {
            match present_frame(&mem.table(table)?[index]) {
                Some(next) => table = next,
                None => return Ok(Walk::Missing { table, depth }),
            }
        }
        Ok(Walk::Complete(table))
    }

    /// Look up the leaf entry slot for `page` without allocating.
    ///
    /// `None` means an intermediate level is missing. A returned entry may
    /// still be non-present.
    pub fn entry<'m>(
        &self,
        mem: &'m PhysicalMemory,
        page: Page<Size4KiB>,
    ) -> Option<&'m PageTableEntry> {
        match self.walk(mem, page).ok()? {
            Walk::Complete(leaf) => mem.table(leaf).ok().map(|t| &t[page.p1_index()]),
            Walk::Missing { .. } => None,
        }
    }

    /// Look up the leaf entry slot for `page`, optionally creating missing
    /// intermediate tables.
    ///
    /// With `create`, every missing level is allocated before any of them is
    /// installed, so an `OutOfMemory` failure leaves the tables untouched.
    pub fn entry_mut<'m>(
        &self,
        mem: &'m mut PhysicalMemory,
        page: Page<Size4KiB>,
        create: bool,
    ) -> Result<Option<&'m mut PageTableEntry>, MemoryError> {
        let leaf = match self.walk(mem, page)? {
            Walk::Complete(leaf) => leaf,
            Walk::Missing { .. } if !create => return Ok(None),
            Walk::Missing { table, depth } => Self::install_levels(mem, page, table, depth)?,
        };
        Ok(Some(&mut mem.table_mut(leaf)?[page.p1_index()]))
    }

    fn install_levels(
        mem: &mut PhysicalMemory,
        page: Page<Size4KiB>,
        mut table: PhysFrame,
        depth: usize,
    ) -> Result<PhysFrame, MemoryError> {
        let needed = UPPER_LEVELS - depth;
        let mut fresh: [Option<PhysFrame>; UPPER_LEVELS] = [None; UPPER_LEVELS];
        for slot in 0..needed {
            match mem.allocate_zeroed() {
                Ok(frame) => fresh[slot] = Some(frame),
                Err(err) => {
                    log::warn!(
                        "page walk for {:#x}: cannot allocate {} table levels",
                        page.start_address().as_u64(),
                        needed
                    );
                    for frame in fresh[..slot].iter().flatten() {
                        mem.free(*frame);
                    }
                    return Err(err);
                }
            }
        }

        let indices = table_indices(page);
        for (&index, frame) in indices[depth..UPPER_LEVELS].iter().zip(fresh.iter().flatten()) {
            mem.table_mut(table)?[index].set_addr(frame.start_address(), TABLE_FLAGS);
            table = *frame;
        }
        log::trace!(
            "page walk for {:#x}: installed {} table levels",
            page.start_address().as_u64(),
            needed
        );
        Ok(table)
    }

    /// Frame and permissions of a present leaf mapping.
    pub fn translate(
        &self,
        mem: &PhysicalMemory,
        page: Page<Size4KiB>,
    ) -> Option<(PhysFrame, PagePermissions)> {
        let entry = self.entry(mem, page)?;
        let perms = PagePermissions::from_raw(entry.flags());
        if perms.is_present() {
            Some((PhysFrame::containing_address(entry.addr()), perms))
        } else {
            None
        }
    }

    /// Install `frame` at `page`, consuming one reference to `frame`.
    ///
    /// A previous mapping at `page` is replaced and its frame released.
    pub fn map_page(
        &self,
        mem: &mut PhysicalMemory,
        page: Page<Size4KiB>,
        frame: PhysFrame,
        perms: PagePermissions,
    ) -> Result<(), MemoryError> {
        let previous = {
            let entry = self
                .entry_mut(mem, page, true)?
                .ok_or(MemoryError::NotMapped)?;
            let previous = present_frame(entry);
            entry.set_addr(frame.start_address(), perms.as_raw());
            previous
        };
        log::trace!(
            "map {:#x} -> {:#x} [{}]",
            page.start_address().as_u64(),
            frame.start_address().as_u64(),
            perms.summary()
        );
        if let Some(old) = previous {
            mem.release(old);
        }
        Ok(())
    }

    /// Remove the mapping at `page`, if any, and release its frame.
    pub fn unmap_page(
        &self,
        mem: &mut PhysicalMemory,
        page: Page<Size4KiB>,
    ) -> Result<Option<PhysFrame>, MemoryError> {
        let frame = match self.entry_mut(mem, page, false)? {
            Some(entry) => {
                let frame = present_frame(entry);
                entry.set_unused();
                frame
            }
            None => None,
        };
        if let Some(frame) = frame {
            log::trace!("unmap {:#x}", page.start_address().as_u64());
            mem.release(frame);
        }
        Ok(frame)
    }

    /// Present leaf mappings with `start <= address < end`, in ascending order.
    ///
    /// Absent upper-level entries are skipped whole, so sparse address
    /// spaces are cheap to scan.
    pub fn present_pages(
        &self,
        mem: &PhysicalMemory,
        start: u64,
        end: u64,
    ) -> Result<Vec<Mapping>, MemoryError> {
        let mut out = Vec::new();
        let end = end.min(USER_SPACE_END);
        if start < end {
            collect(mem, self.level_4_frame, 4, 0, start, end, &mut out)?;
        }
        Ok(out)
    }

    /// Free every table frame and drop one reference from every mapped frame.
    pub fn destroy(self, mem: &mut PhysicalMemory) -> Result<(), MemoryError> {
        release_table(mem, self.level_4_frame, 4)?;
        log::debug!(
            "AddressSpace: destroyed L4 table at {:#x}",
            self.level_4_frame.start_address().as_u64()
        );
        Ok(())
    }
}

/// Bytes covered by one entry of a table at `level` (1 = leaf table).
const fn entry_span(level: u8) -> u64 {
    1 << (12 + 9 * (level as u64 - 1))
}

fn collect(
    mem: &PhysicalMemory,
    table: PhysFrame,
    level: u8,
    base: u64,
    start: u64,
    end: u64,
    out: &mut Vec<Mapping>,
) -> Result<(), MemoryError> {
    let span = entry_span(level);
    for (i, entry) in mem.table(table)?.iter().enumerate() {
        let entry_start = base + i as u64 * span;
        if entry_start >= end {
            break;
        }
        if entry_start + span <= start {
            continue;
        }
        let Some(next) = present_frame(entry) else {
            continue;
        };
        if level == 1 {
            out.push(Mapping {
                page: Page::containing_address(VirtAddr::new_truncate(entry_start)),
                frame: next,
                perms: PagePermissions::from_raw(entry.flags()),
            });
        } else {
            collect(mem, next, level - 1, entry_start, start, end, out)?;
        }
    }
    Ok(())
}

fn release_table(mem: &mut PhysicalMemory, table: PhysFrame, level: u8) -> Result<(), MemoryError> {
    let entries: PageTable = mem.table(table)?.clone();
    for entry in entries.iter() {
        if let Some(next) = present_frame(entry) {
            if level == 1 {
                mem.release(next);
            } else {
                release_table(mem, next, level - 1)?;
            }
        }
    }
    mem.free(table);
    Ok(())
}
