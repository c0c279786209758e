//! Page-fault capture for simulated user memory accesses.
//!
//! The MMU check mirrors what the hardware does for a user-mode access:
//! the page must be present and user-accessible, and a write additionally
//! needs Writable. A failed check produces a [`FaultContext`] carrying the
//! faulting address and the x86 page-fault error code, which the process
//! manager hands to the process's upcall.

use core::fmt;
use x86_64::structures::idt::PageFaultErrorCode;
use x86_64::structures::paging::{Page, PhysFrame, Size4KiB};
use x86_64::VirtAddr;

use crate::memory::frame_allocator::PhysicalMemory;
use crate::memory::paging::AddressSpace;
use crate::memory::MemoryError;
use crate::process::ProcessId;

/// Exit status of a process killed by an unrecoverable fault (SIGSEGV).
pub const FAULT_EXIT_STATUS: i32 = 139;

/// Kind of user access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// A captured page fault: faulting address and reason bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultContext {
    pub fault_va: u64,
    pub error_code: PageFaultErrorCode,
}

impl FaultContext {
    pub fn is_write(&self) -> bool {
        self.error_code.contains(PageFaultErrorCode::CAUSED_BY_WRITE)
    }

    /// Page was present; the access broke its protection.
    pub fn is_protection_violation(&self) -> bool {
        self.error_code
            .contains(PageFaultErrorCode::PROTECTION_VIOLATION)
    }
}

impl fmt::Display for FaultContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} fault at {:#x} ({})",
            if self.is_write() { "write" } else { "read" },
            self.fault_va,
            if self.is_protection_violation() {
                "protection violation"
            } else {
                "not present"
            }
        )
    }
}

/// Why a user access did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessError {
    /// No such process, or it has already terminated.
    NoSuchProcess(ProcessId),
    /// The fault could not be handled; the process has been killed.
    Killed { pid: ProcessId, fault: FaultContext },
    /// The backing frame could not be read or written.
    Memory(MemoryError),
}

impl fmt::Display for AccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessError::NoSuchProcess(pid) => write!(f, "no live process {}", pid.as_u64()),
            AccessError::Killed { pid, fault } => {
                write!(f, "process {} killed by {}", pid.as_u64(), fault)
            }
            AccessError::Memory(e) => write!(f, "user access: {}", e),
        }
    }
}

/// Walk the tables the way the MMU would for a user-mode access to `va`.
///
/// Returns the backing frame, or the fault the access raises.
pub fn check_user_access(
    space: &AddressSpace,
    mem: &PhysicalMemory,
    va: u64,
    access: Access,
) -> Result<PhysFrame, FaultContext> {
    let mut error_code = PageFaultErrorCode::USER_MODE;
    if access == Access::Write {
        error_code |= PageFaultErrorCode::CAUSED_BY_WRITE;
    }
    let fault = |error_code| FaultContext {
        fault_va: va,
        error_code,
    };

    let addr = VirtAddr::try_new(va).map_err(|_| fault(error_code))?;
    let page = Page::<Size4KiB>::containing_address(addr);
    let (frame, perms) = space.translate(mem, page).ok_or(fault(error_code))?;

    let denied = !perms.is_user() || (access == Access::Write && !perms.is_writable());
    if denied {
        return Err(fault(
            error_code | PageFaultErrorCode::PROTECTION_VIOLATION,
        ));
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::layout::UTEXT;
    use crate::memory::PagePermissions;

    fn setup(perms: PagePermissions) -> (PhysicalMemory, AddressSpace, PhysFrame) {
        let mut mem = PhysicalMemory::new(8);
        let space = AddressSpace::new(&mut mem).unwrap();
        let frame = mem.allocate_zeroed().unwrap();
        let page = Page::containing_address(VirtAddr::new(UTEXT));
        space.map_page(&mut mem, page, frame, perms).unwrap();
        (mem, space, frame)
    }

    #[test]
    fn test_allowed_accesses() {
        let (mem, space, frame) = setup(PagePermissions::USER_RW);
        assert_eq!(check_user_access(&space, &mem, UTEXT + 8, Access::Read), Ok(frame));
        assert_eq!(check_user_access(&space, &mem, UTEXT + 8, Access::Write), Ok(frame));
    }

    #[test]
    fn test_write_to_read_only_page() {
        let (mem, space, _) = setup(PagePermissions::USER_RO | PagePermissions::COPY_ON_WRITE);
        let fault = check_user_access(&space, &mem, UTEXT + 8, Access::Write).unwrap_err();
        assert_eq!(fault.fault_va, UTEXT + 8);
        assert!(fault.is_write());
        assert!(fault.is_protection_violation());
    }

    #[test]
    fn test_not_present_read() {
        let (mem, space, _) = setup(PagePermissions::USER_RO);
        let fault = check_user_access(&space, &mem, 0x1000, Access::Read).unwrap_err();
        assert!(!fault.is_write());
        assert!(!fault.is_protection_violation());
        assert!(fault.error_code.contains(PageFaultErrorCode::USER_MODE));
    }

    #[test]
    fn test_kernel_only_page_is_protected() {
        let (mem, space, _) = setup(PagePermissions::PRESENT | PagePermissions::WRITABLE);
        let fault = check_user_access(&space, &mem, UTEXT, Access::Read).unwrap_err();
        assert!(fault.is_protection_violation());
    }
}
