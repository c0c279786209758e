//! Copy-on-Write page fault handler
//!
//! Runs as a process's fault upcall. A write to a page carrying the COW
//! marker gets a private copy:
//!
//! 1. allocate a fresh page at `PFTEMP`
//! 2. copy the faulting page into it
//! 3. map the fresh frame over the faulting page, writable and without COW
//! 4. unmap `PFTEMP`
//!
//! `PFTEMP` is a single slot per process. Faults of one process are handled
//! one at a time, so the slot is never contended.

use core::fmt;

use super::syscall::{SyscallError, VmSyscalls};
use super::ProcessId;
use crate::memory::cow_stats::CowCounters;
use crate::memory::layout::{page_align_down, PFTEMP};
use crate::memory::PagePermissions;
use crate::trap::FaultContext;

/// Why a fault could not be resolved. Every variant is fatal to the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    /// The fault was not caused by a write.
    NotAWrite { addr: u64 },
    /// A write to a page that is not copy-on-write.
    NotCopyOnWrite { addr: u64 },
    /// A kernel primitive failed while copying the page.
    Resolve { addr: u64, error: SyscallError },
}

impl fmt::Display for FaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultError::NotAWrite { addr } => {
                write!(f, "fault at {:#x} is not a write", addr)
            }
            FaultError::NotCopyOnWrite { addr } => {
                write!(f, "write to non-COW page at {:#x}", addr)
            }
            FaultError::Resolve { addr, error } => {
                write!(f, "cannot copy page at {:#x}: {}", addr, error)
            }
        }
    }
}

/// Resolve a write fault on a copy-on-write page.
pub fn handle_cow_fault(
    sys: &mut dyn VmSyscalls,
    pid: ProcessId,
    fault: &FaultContext,
) -> Result<(), FaultError> {
    let addr = fault.fault_va;
    if !fault.is_write() {
        log::error!("COW: pid {} {}: not a write", pid, fault);
        return Err(FaultError::NotAWrite { addr });
    }

    let page = page_align_down(addr);
    let resolve = |error| FaultError::Resolve { addr, error };
    let perms = sys.page_permissions(pid, page).map_err(resolve)?;
    if !perms.is_some_and(PagePermissions::is_cow) {
        log::error!("COW: pid {} {}: page is not copy-on-write", pid, fault);
        return Err(FaultError::NotCopyOnWrite { addr });
    }

    sys.page_alloc(pid, PFTEMP, PagePermissions::USER_RW)
        .map_err(resolve)?;
    sys.copy_page(pid, page, PFTEMP).map_err(resolve)?;
    sys.page_map(pid, PFTEMP, pid, page, PagePermissions::USER_RW)
        .map_err(resolve)?;
    sys.page_unmap(pid, PFTEMP).map_err(resolve)?;

    CowCounters::bump(&sys.stats().pages_copied);
    CowCounters::bump(&sys.stats().faults_resolved);
    log::debug!("COW: pid {} now owns a private copy of {:#x}", pid, page);
    Ok(())
}
