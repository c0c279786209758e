//! Virtual memory: physical frames, four-level page tables, permissions and
//! the inspection/mutation helpers built on them.

pub mod cow_stats;
pub mod flags;
pub mod frame_allocator;
pub mod frame_metadata;
pub mod layout;
pub mod mappings;
pub mod paging;
pub mod protect;

use core::fmt;
use x86_64::PhysAddr;

pub use flags::PagePermissions;
pub use frame_allocator::PhysicalMemory;
pub use paging::AddressSpace;

/// Errors from the page-table and frame layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// The frame allocator has no free frame left.
    OutOfMemory,
    /// The page has no present leaf mapping.
    NotMapped,
    /// A frame address that does not belong to physical memory.
    BadFrame(PhysAddr),
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::OutOfMemory => write!(f, "out of memory"),
            MemoryError::NotMapped => write!(f, "page not mapped"),
            MemoryError::BadFrame(addr) => {
                write!(f, "frame {:#x} outside physical memory", addr.as_u64())
            }
        }
    }
}
