//! Kernel primitives the fork protocol and the COW fault handler are built on.
//!
//! These are the only ways user-level memory code touches page tables.
//! Every primitive takes explicit process handles; there is no notion of a
//! "current" process here.

use alloc::vec::Vec;
use core::fmt;

use super::ProcessId;
use crate::memory::cow_stats::CowCounters;
use crate::memory::{MemoryError, PagePermissions};
use crate::process::cow::FaultError;
use crate::trap::FaultContext;

/// System call error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum SyscallError {
    /// No such process
    NoSuchProcess = -3,
    /// Process table full
    ResourceExhausted = -11,
    /// Out of memory
    OutOfMemory = -12,
    /// Invalid argument
    InvalidArgument = -22,
}

impl SyscallError {
    pub const fn errno(self) -> i64 {
        self as i64
    }
}

impl fmt::Display for SyscallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            SyscallError::NoSuchProcess => "no such process",
            SyscallError::ResourceExhausted => "process table full",
            SyscallError::OutOfMemory => "out of memory",
            SyscallError::InvalidArgument => "invalid argument",
        };
        write!(f, "{} ({})", msg, self.errno())
    }
}

impl From<MemoryError> for SyscallError {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::OutOfMemory => SyscallError::OutOfMemory,
            MemoryError::NotMapped | MemoryError::BadFrame(_) => SyscallError::InvalidArgument,
        }
    }
}

/// A user-level page fault handler, run on the process's exception stack.
pub type FaultUpcall =
    fn(&mut dyn VmSyscalls, ProcessId, &FaultContext) -> Result<(), FaultError>;

/// Virtual memory and process primitives.
pub trait VmSyscalls {
    /// Allocate a zeroed frame and map it at `va`, replacing any old mapping.
    fn page_alloc(
        &mut self,
        pid: ProcessId,
        va: u64,
        perm: PagePermissions,
    ) -> Result<(), SyscallError>;

    /// Map the frame behind `src_va` in `src` at `dst_va` in `dst`.
    fn page_map(
        &mut self,
        src: ProcessId,
        src_va: u64,
        dst: ProcessId,
        dst_va: u64,
        perm: PagePermissions,
    ) -> Result<(), SyscallError>;

    /// Unmap `va`. Succeeds if nothing was mapped.
    fn page_unmap(&mut self, pid: ProcessId, va: u64) -> Result<(), SyscallError>;

    /// Create a child with an empty user address space and a copy of the
    /// parent's registers (return register 0). The child is not runnable.
    fn exofork(&mut self, parent: ProcessId) -> Result<ProcessId, SyscallError>;

    fn set_runnable(&mut self, pid: ProcessId) -> Result<(), SyscallError>;

    fn set_fault_upcall(&mut self, pid: ProcessId, upcall: FaultUpcall)
        -> Result<(), SyscallError>;

    /// Tear down a process and its address space.
    fn destroy(&mut self, pid: ProcessId) -> Result<(), SyscallError>;

    /// Permissions of the present page containing `va`, if any.
    fn page_permissions(
        &self,
        pid: ProcessId,
        va: u64,
    ) -> Result<Option<PagePermissions>, SyscallError>;

    /// Present pages with `start <= va < end`, ascending.
    fn present_pages(
        &self,
        pid: ProcessId,
        start: u64,
        end: u64,
    ) -> Result<Vec<(u64, PagePermissions)>, SyscallError>;

    /// Copy one page of the process's own memory, as a user-mode memmove
    /// would. Both pages must be user-accessible and `dst_va` writable.
    fn copy_page(&mut self, pid: ProcessId, src_va: u64, dst_va: u64)
        -> Result<(), SyscallError>;

    /// COW counters.
    fn stats(&self) -> &CowCounters;
}
