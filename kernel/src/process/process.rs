//! Process structure and lifecycle

use alloc::string::String;
use core::fmt;

use super::syscall::FaultUpcall;
use crate::memory::paging::AddressSpace;

/// Process ID type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(u64);

impl ProcessId {
    pub const fn new(id: u64) -> Self {
        ProcessId(id)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Process state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Created by exofork, not yet runnable
    Creating,
    /// Process is ready to run
    Ready,
    /// Process has terminated
    Terminated(i32), // exit code
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::Creating => write!(f, "creating"),
            ProcessState::Ready => write!(f, "ready"),
            ProcessState::Terminated(code) => write!(f, "terminated({})", code),
        }
    }
}

/// Saved user register state. Only what fork needs to distinguish
/// parent from child and what the stack walker starts from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserContext {
    pub rip: u64,
    pub rsp: u64,
    pub rbp: u64,
    /// Syscall return register; 0 in a freshly forked child.
    pub rax: u64,
}

/// A process: an address space plus the state the kernel keeps about it.
pub struct Process {
    /// Unique process identifier
    pub id: ProcessId,

    /// Process name (for debugging)
    pub name: String,

    /// Current state
    pub state: ProcessState,

    /// Parent process ID (if any)
    pub parent: Option<ProcessId>,

    /// Page tables; `None` once the process has been torn down
    pub space: Option<AddressSpace>,

    /// User-level page fault handler
    pub fault_upcall: Option<FaultUpcall>,

    /// Saved registers
    pub context: UserContext,
}

impl Process {
    pub fn new(id: ProcessId, name: String, space: AddressSpace) -> Self {
        Self {
            id,
            name,
            state: ProcessState::Creating,
            parent: None,
            space: Some(space),
            fault_upcall: None,
            context: UserContext::default(),
        }
    }

    pub fn is_alive(&self) -> bool {
        !matches!(self.state, ProcessState::Terminated(_))
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("parent", &self.parent)
            .field("has_upcall", &self.fault_upcall.is_some())
            .finish()
    }
}
