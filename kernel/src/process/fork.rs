//! Copy-on-Write fork
//!
//! Built entirely on the primitives in [`super::syscall`]:
//!
//! 1. give the caller a fault handler and exception stack
//! 2. `exofork` an empty child
//! 3. for every present page in `[UTEXT, USTACKTOP)` decide between sharing,
//!    copy-on-write and a plain read-only mapping
//! 4. give the child its own exception stack and fault handler
//! 5. mark the child runnable
//!
//! A child that fails anywhere in 3-5 is destroyed before it can run.

use core::fmt;

use super::cow::handle_cow_fault;
use super::syscall::{SyscallError, VmSyscalls};
use super::ProcessId;
use crate::memory::cow_stats::CowCounters;
use crate::memory::layout::{USTACKTOP, UTEXT, UXSTACK};
use crate::memory::PagePermissions;

/// Fork failure, naming the step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkError {
    /// Installing the fault handler in `pid` failed.
    InstallHandler { pid: ProcessId, error: SyscallError },
    /// `exofork` failed.
    CreateChild(SyscallError),
    /// Reading the caller's page tables failed.
    ScanParent(SyscallError),
    /// Duplicating the page at `addr` failed.
    DuplicatePage { addr: u64, error: SyscallError },
    /// Allocating the child's exception stack failed.
    ExceptionStack(SyscallError),
    /// Marking the child runnable failed.
    MarkRunnable(SyscallError),
}

impl fmt::Display for ForkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForkError::InstallHandler { pid, error } => {
                write!(f, "installing fault handler in {}: {}", pid, error)
            }
            ForkError::CreateChild(e) => write!(f, "exofork: {}", e),
            ForkError::ScanParent(e) => write!(f, "reading parent mappings: {}", e),
            ForkError::DuplicatePage { addr, error } => {
                write!(f, "duplicating page {:#x}: {}", addr, error)
            }
            ForkError::ExceptionStack(e) => write!(f, "child exception stack: {}", e),
            ForkError::MarkRunnable(e) => write!(f, "set_runnable: {}", e),
        }
    }
}

/// How a page was carried into the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageDisposition {
    /// Same frame, same permissions (Shared marker).
    Shared,
    /// Same frame, read-only + COW in both processes.
    CopyOnWrite,
    /// Same frame, read-only in both processes, masked to the syscall bits.
    ReadOnly,
}

/// Map the page at `va` into `child` according to its permissions.
pub fn duplicate_page(
    sys: &mut dyn VmSyscalls,
    parent: ProcessId,
    child: ProcessId,
    va: u64,
    perms: PagePermissions,
) -> Result<PageDisposition, SyscallError> {
    if perms.is_shared() {
        sys.page_map(parent, va, child, va, perms.masked_to_syscall())?;
        log::trace!("fork: {:#x} shared [{}]", va, perms.summary());
        return Ok(PageDisposition::Shared);
    }

    let new_perms = perms.to_copy_on_write().masked_to_syscall();
    let disposition = if new_perms.is_cow() {
        PageDisposition::CopyOnWrite
    } else {
        PageDisposition::ReadOnly
    };

    // Child first: once the parent's entry loses Writable, its next write
    // faults, and the copy it makes must not be visible to the child.
    // Both ends carry the same masked bits afterwards.
    sys.page_map(parent, va, child, va, new_perms)?;
    sys.page_map(parent, va, parent, va, new_perms)?;
    log::trace!("fork: {:#x} {:?} [{}]", va, disposition, new_perms.summary());
    Ok(disposition)
}

/// Give `pid` a writable exception stack (if it has none) and the COW upcall.
pub fn install_fault_handler(sys: &mut dyn VmSyscalls, pid: ProcessId) -> Result<(), SyscallError> {
    if sys.page_permissions(pid, UXSTACK)?.is_none() {
        sys.page_alloc(pid, UXSTACK, PagePermissions::USER_RW)?;
    }
    sys.set_fault_upcall(pid, handle_cow_fault)
}

/// Replicate `parent` into a new runnable process.
pub fn fork(sys: &mut dyn VmSyscalls, parent: ProcessId) -> Result<ProcessId, ForkError> {
    install_fault_handler(sys, parent).map_err(|error| ForkError::InstallHandler {
        pid: parent,
        error,
    })?;

    let child = sys.exofork(parent).map_err(ForkError::CreateChild)?;
    log::debug!("fork: parent {} -> child {}", parent, child);

    if let Err(err) = populate_child(sys, parent, child) {
        log::error!("fork: {}, destroying child {}", err, child);
        if let Err(destroy_err) = sys.destroy(child) {
            log::error!("fork: destroying child {} failed: {}", child, destroy_err);
        }
        return Err(err);
    }

    CowCounters::bump(&sys.stats().forks);
    log::info!("fork: process {} forked child {}", parent, child);
    Ok(child)
}

fn populate_child(
    sys: &mut dyn VmSyscalls,
    parent: ProcessId,
    child: ProcessId,
) -> Result<(), ForkError> {
    let pages = sys
        .present_pages(parent, UTEXT, USTACKTOP)
        .map_err(ForkError::ScanParent)?;

    for (va, perms) in pages {
        if !perms.is_user() {
            log::debug!("fork: skipping kernel-only page {:#x}", va);
            continue;
        }
        let disposition = duplicate_page(sys, parent, child, va, perms)
            .map_err(|error| ForkError::DuplicatePage { addr: va, error })?;
        let stats = sys.stats();
        CowCounters::bump(match disposition {
            PageDisposition::Shared => &stats.pages_shared,
            PageDisposition::CopyOnWrite => &stats.pages_cow,
            PageDisposition::ReadOnly => &stats.pages_readonly,
        });
    }

    sys.page_alloc(child, UXSTACK, PagePermissions::USER_RW)
        .map_err(ForkError::ExceptionStack)?;
    sys.set_fault_upcall(child, handle_cow_fault)
        .map_err(|error| ForkError::InstallHandler { pid: child, error })?;
    sys.set_runnable(child).map_err(ForkError::MarkRunnable)
}
