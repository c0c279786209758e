//! Simulated physical memory and the frame allocator.
//!
//! Frames are 4 KiB heap blocks addressed as if they sat in physical memory
//! starting at `LOW_MEMORY_FLOOR`. Page-table levels and user data share the
//! same pool, so running out of frames surfaces as `OutOfMemory` from every
//! layer above.

use alloc::boxed::Box;
use alloc::vec::Vec;
use static_assertions::{assert_eq_align, assert_eq_size};
use x86_64::structures::paging::{PageTable, PhysFrame};
use x86_64::PhysAddr;

use super::frame_metadata::FrameRefcounts;
use super::layout::PAGE_SIZE;
use super::MemoryError;

/// Low memory floor. Frame 0 is never handed out, so a zero frame address
/// is never confused with "absent".
pub const LOW_MEMORY_FLOOR: u64 = 0x10_0000; // 1 MiB

/// One physical page of storage.
#[repr(C, align(4096))]
pub struct PhysPage(pub [u8; PAGE_SIZE as usize]);

assert_eq_size!(PhysPage, PageTable);
assert_eq_align!(PhysPage, PageTable);

impl PhysPage {
    fn zeroed() -> Box<Self> {
        Box::new(Self([0; PAGE_SIZE as usize]))
    }
}

/// Physical memory plus a free-list frame allocator.
pub struct PhysicalMemory {
    /// Backing storage, materialized on first allocation of each frame.
    frames: Vec<Box<PhysPage>>,
    free_list: Vec<PhysFrame>,
    capacity: usize,
    allocated: usize,
    refcounts: FrameRefcounts,
}

impl PhysicalMemory {
    /// Create a pool of `capacity` frames. Nothing is allocated up front.
    pub fn new(capacity: usize) -> Self {
        log::debug!(
            "PhysicalMemory: {} frames at {:#x}",
            capacity,
            LOW_MEMORY_FLOOR
        );
        Self {
            frames: Vec::new(),
            free_list: Vec::new(),
            capacity,
            allocated: 0,
            refcounts: FrameRefcounts::new(),
        }
    }

    fn frame_index(frame: PhysFrame) -> Option<usize> {
        let addr = frame.start_address().as_u64();
        addr.checked_sub(LOW_MEMORY_FLOOR)
            .map(|offset| (offset / PAGE_SIZE) as usize)
    }

    fn frame_at(index: usize) -> PhysFrame {
        PhysFrame::containing_address(PhysAddr::new(
            LOW_MEMORY_FLOOR + index as u64 * PAGE_SIZE,
        ))
    }

    /// Allocate a zero-filled frame.
    pub fn allocate_zeroed(&mut self) -> Result<PhysFrame, MemoryError> {
        let frame = if let Some(frame) = self.free_list.pop() {
            self.page_mut(frame)?.0.fill(0);
            frame
        } else if self.frames.len() < self.capacity {
            let frame = Self::frame_at(self.frames.len());
            self.frames.push(PhysPage::zeroed());
            frame
        } else {
            log::warn!(
                "PhysicalMemory: out of frames ({} in use)",
                self.allocated
            );
            return Err(MemoryError::OutOfMemory);
        };
        self.allocated += 1;
        log::trace!("allocated frame {:#x}", frame.start_address().as_u64());
        Ok(frame)
    }

    /// Return a frame to the free list without consulting refcounts.
    /// Used for page-table frames, which are never shared.
    pub fn free(&mut self, frame: PhysFrame) {
        if Self::frame_index(frame).map_or(true, |i| i >= self.frames.len()) {
            log::error!(
                "free: frame {:#x} does not belong to this pool",
                frame.start_address().as_u64()
            );
            return;
        }
        log::trace!("freed frame {:#x}", frame.start_address().as_u64());
        self.allocated -= 1;
        self.free_list.push(frame);
    }

    /// Record one more mapping of `frame`.
    pub fn share(&mut self, frame: PhysFrame) {
        self.refcounts.incref(frame);
    }

    /// Drop one mapping of `frame`, freeing it when it was the last one.
    pub fn release(&mut self, frame: PhysFrame) {
        if self.refcounts.decref(frame) {
            self.free(frame);
        }
    }

    pub fn refcount(&self, frame: PhysFrame) -> u32 {
        self.refcounts.refcount(frame)
    }

    pub fn page(&self, frame: PhysFrame) -> Result<&PhysPage, MemoryError> {
        Self::frame_index(frame)
            .and_then(|i| self.frames.get(i))
            .map(|page| &**page)
            .ok_or(MemoryError::BadFrame(frame.start_address()))
    }

    pub fn page_mut(&mut self, frame: PhysFrame) -> Result<&mut PhysPage, MemoryError> {
        Self::frame_index(frame)
            .and_then(|i| self.frames.get_mut(i))
            .map(|page| &mut **page)
            .ok_or(MemoryError::BadFrame(frame.start_address()))
    }

    /// View a frame as a page table.
    pub fn table(&self, frame: PhysFrame) -> Result<&PageTable, MemoryError> {
        let page = self.page(frame)?;
        // SAFETY: PhysPage and PageTable have identical size and alignment
        // (checked above) and every bit pattern is a valid PageTable.
        Ok(unsafe { &*(page as *const PhysPage as *const PageTable) })
    }

    /// View a frame as a mutable page table.
    pub fn table_mut(&mut self, frame: PhysFrame) -> Result<&mut PageTable, MemoryError> {
        let page = self.page_mut(frame)?;
        // SAFETY: see `table`; the exclusive borrow of `self` covers the frame.
        Ok(unsafe { &mut *(page as *mut PhysPage as *mut PageTable) })
    }

    /// Copy one frame's bytes into another.
    pub fn copy_frame(&mut self, src: PhysFrame, dst: PhysFrame) -> Result<(), MemoryError> {
        let bytes = self.page(src)?.0;
        self.page_mut(dst)?.0 = bytes;
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames currently handed out (user pages and table levels).
    pub fn frames_in_use(&self) -> usize {
        self.allocated
    }

    pub fn free_frames(&self) -> usize {
        self.capacity - self.allocated
    }

    /// Frames referenced by more than one mapping.
    pub fn shared_frames(&self) -> usize {
        self.refcounts.shared_frames()
    }
}
