//! Frame reference counts
//!
//! Every leaf mapping of a frame holds one reference. Fork and `page_map`
//! share frames between address spaces, so a frame may only go back to the
//! allocator once the last mapping is gone.
//!
//! Storage is sparse: only shared frames are tracked. An untracked frame has
//! an implicit refcount of 1 (private to a single mapping).

use alloc::collections::BTreeMap;
use x86_64::structures::paging::PhysFrame;

/// Sparse reference counts keyed by frame start address.
#[derive(Debug, Default)]
pub struct FrameRefcounts {
    counts: BTreeMap<u64, u32>,
}

impl FrameRefcounts {
    pub const fn new() -> Self {
        Self {
            counts: BTreeMap::new(),
        }
    }

    /// Add one reference. The first share of an untracked frame moves it to 2.
    pub fn incref(&mut self, frame: PhysFrame) {
        let addr = frame.start_address().as_u64();
        let count = self.counts.entry(addr).or_insert(1);
        *count += 1;
    }

    /// Drop one reference. Returns true if the frame can be freed.
    pub fn decref(&mut self, frame: PhysFrame) -> bool {
        let addr = frame.start_address().as_u64();
        match self.counts.get_mut(&addr) {
            Some(count) if *count > 2 => {
                *count -= 1;
                false
            }
            Some(_) => {
                // 2 -> 1: back to private, stop tracking
                self.counts.remove(&addr);
                false
            }
            None => true,
        }
    }

    /// Current count; 1 for untracked frames.
    pub fn refcount(&self, frame: PhysFrame) -> u32 {
        self.counts
            .get(&frame.start_address().as_u64())
            .copied()
            .unwrap_or(1)
    }

    /// Number of frames currently shared by more than one mapping.
    pub fn shared_frames(&self) -> usize {
        self.counts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use x86_64::PhysAddr;

    fn frame(addr: u64) -> PhysFrame {
        PhysFrame::containing_address(PhysAddr::new(addr))
    }

    #[test]
    fn test_untracked_frame_is_private() {
        let mut refs = FrameRefcounts::new();
        assert_eq!(refs.refcount(frame(0x1000)), 1);
        assert!(refs.decref(frame(0x1000)));
    }

    #[test]
    fn test_shared_frame_lifecycle() {
        let mut refs = FrameRefcounts::new();
        let f = frame(0x20_0000);
        refs.incref(f);
        refs.incref(f);
        assert_eq!(refs.refcount(f), 3);
        assert_eq!(refs.shared_frames(), 1);

        assert!(!refs.decref(f));
        assert!(!refs.decref(f));
        assert_eq!(refs.refcount(f), 1);
        assert_eq!(refs.shared_frames(), 0);
        assert!(refs.decref(f));
    }
}
