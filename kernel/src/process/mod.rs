//! Process management
//!
//! A process is an address space plus a little register state. The
//! manager owns every process and all physical memory; fork and the COW
//! fault handler only reach it through the [`VmSyscalls`] primitives.

pub mod cow;
pub mod fork;
pub mod manager;
pub mod process;
pub mod syscall;

pub use cow::{handle_cow_fault, FaultError};
pub use fork::{fork, ForkError};
pub use manager::ProcessManager;
pub use process::{Process, ProcessId, ProcessState, UserContext};
pub use syscall::{FaultUpcall, SyscallError, VmSyscalls};
