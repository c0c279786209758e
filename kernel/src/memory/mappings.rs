//! Read-only enumeration of the pages in an address range.

use core::fmt;
use core::iter::FusedIterator;
use x86_64::structures::paging::{Page, PhysFrame, Size4KiB};
use x86_64::VirtAddr;

use super::flags::PagePermissions;
use super::frame_allocator::PhysicalMemory;
use super::layout::{page_align_down, PAGE_SIZE};
use super::paging::AddressSpace;

/// What one page of a range maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageReport {
    /// Page-aligned virtual address.
    pub va: u64,
    /// Frame and permissions, or `None` when not mapped.
    pub mapping: Option<(PhysFrame, PagePermissions)>,
}

impl PageReport {
    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }
}

impl fmt::Display for PageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mapping {
            Some((frame, perms)) => write!(
                f,
                "Virtual address [{:016x}] - mapped to [{:016x}], permission: {}",
                self.va,
                frame.start_address().as_u64(),
                perms.summary()
            ),
            None => write!(f, "Virtual address [{:016x}] - not mapped", self.va),
        }
    }
}

/// Look up a single page. Non-canonical addresses are never mapped.
pub fn inspect(space: &AddressSpace, mem: &PhysicalMemory, va: u64) -> PageReport {
    let va = page_align_down(va);
    let mapping = VirtAddr::try_new(va)
        .ok()
        .and_then(|addr| space.translate(mem, Page::<Size4KiB>::containing_address(addr)));
    PageReport { va, mapping }
}

/// Lazy walk over every page touched by `[start, end]`.
///
/// The first page is the one containing `start`; the last is the one
/// containing `end`. Cloning the iterator restarts from the same point.
#[derive(Clone)]
pub struct PageReports<'a> {
    space: &'a AddressSpace,
    mem: &'a PhysicalMemory,
    next: Option<u64>,
    end: u64,
}

/// Report every page from the one containing `start` to the one containing `end`.
pub fn for_each_page<'a>(
    space: &'a AddressSpace,
    mem: &'a PhysicalMemory,
    start: u64,
    end: u64,
) -> PageReports<'a> {
    let first = page_align_down(start);
    PageReports {
        space,
        mem,
        next: (start <= end).then_some(first),
        end,
    }
}

impl Iterator for PageReports<'_> {
    type Item = PageReport;

    fn next(&mut self) -> Option<PageReport> {
        let va = self.next?;
        // explicit bound: the last page of the address space has no successor
        self.next = va
            .checked_add(PAGE_SIZE)
            .filter(|&next| next <= self.end);
        Some(inspect(self.space, self.mem, va))
    }
}

impl FusedIterator for PageReports<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::layout::UTEXT;
    use alloc::string::ToString;
    use alloc::vec::Vec;

    fn setup() -> (PhysicalMemory, AddressSpace) {
        let mut mem = PhysicalMemory::new(16);
        let space = AddressSpace::new(&mut mem).unwrap();
        (mem, space)
    }

    #[test]
    fn test_range_spanning_one_boundary_reports_two_pages() {
        let (mem, space) = setup();
        let reports: Vec<_> = for_each_page(&space, &mem, PAGE_SIZE - 4, PAGE_SIZE + 4).collect();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].va, 0);
        assert_eq!(reports[1].va, PAGE_SIZE);
        assert!(reports.iter().all(|r| !r.is_mapped()));
    }

    #[test]
    fn test_top_of_address_space_terminates() {
        let (mem, space) = setup();
        let reports: Vec<_> = for_each_page(&space, &mem, u64::MAX - PAGE_SIZE, u64::MAX).collect();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[1].va, u64::MAX & !(PAGE_SIZE - 1));
    }

    #[test]
    fn test_inverted_range_is_empty() {
        let (mem, space) = setup();
        assert_eq!(for_each_page(&space, &mem, 0x3000, 0x1000).count(), 0);
        // both bounds inside one page
        assert_eq!(for_each_page(&space, &mem, 0x1004, 0x1002).count(), 0);
        assert_eq!(for_each_page(&space, &mem, 0x1002, 0x1002).count(), 1);
    }

    #[test]
    fn test_reports_mapping_and_restarts() {
        let (mut mem, space) = setup();
        let frame = mem.allocate_zeroed().unwrap();
        let page = Page::containing_address(VirtAddr::new(UTEXT));
        space.map_page(&mut mem, page, frame, PagePermissions::USER_RW).unwrap();

        let reports = for_each_page(&space, &mem, UTEXT, UTEXT + PAGE_SIZE);
        let again = reports.clone();
        let first: Vec<_> = reports.collect();
        assert_eq!(first[0].mapping, Some((frame, PagePermissions::USER_RW)));
        assert!(!first[1].is_mapped());
        assert_eq!(first, again.collect::<Vec<_>>());

        assert_eq!(
            first[0].to_string(),
            alloc::format!(
                "Virtual address [{:016x}] - mapped to [{:016x}], permission: ------UWP",
                UTEXT,
                frame.start_address().as_u64()
            )
        );
        assert_eq!(
            first[1].to_string(),
            "Virtual address [0000000000801000] - not mapped"
        );
    }
}
