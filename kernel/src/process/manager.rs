//! Process manager - owns physical memory and the process table, implements
//! the kernel primitives and delivers page faults to user upcalls.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use x86_64::structures::paging::{Page, PhysFrame, Size4KiB};
use x86_64::VirtAddr;

use super::syscall::{FaultUpcall, SyscallError, VmSyscalls};
use super::{Process, ProcessId, ProcessState, UserContext};
use crate::memory::cow_stats::{CowCounters, CowStats};
use crate::memory::layout::{is_user_page, page_align_down, PAGE_SIZE, UXSTACK};
use crate::memory::{AddressSpace, PagePermissions, PhysicalMemory};
use crate::trap::{self, Access, AccessError, FaultContext, FAULT_EXIT_STATUS};

/// Resolve a user virtual address to a page, rejecting unaligned and
/// non-user addresses.
fn user_page(va: u64) -> Result<Page<Size4KiB>, SyscallError> {
    let addr = VirtAddr::try_new(va).map_err(|_| SyscallError::InvalidArgument)?;
    if !is_user_page(addr) {
        return Err(SyscallError::InvalidArgument);
    }
    Ok(Page::containing_address(addr))
}

/// Permissions a caller may pass to `page_alloc`/`page_map`.
fn check_perm(perm: PagePermissions) -> Result<(), SyscallError> {
    let required = PagePermissions::PRESENT | PagePermissions::USER_ACCESSIBLE;
    if perm.is_syscall_legal() && perm.contains(required) {
        Ok(())
    } else {
        Err(SyscallError::InvalidArgument)
    }
}

/// Process manager handles all processes in the system
pub struct ProcessManager {
    /// Frames backing page tables and user pages
    mem: PhysicalMemory,

    /// All processes indexed by PID, terminated ones included
    processes: BTreeMap<ProcessId, Process>,

    /// Next available PID
    next_pid: u64,

    /// Upper bound on live processes
    max_processes: usize,

    stats: CowCounters,
}

impl ProcessManager {
    /// Create a manager over `frames` physical frames and room for
    /// `max_processes` live processes.
    pub fn new(frames: usize, max_processes: usize) -> Self {
        log::info!(
            "ProcessManager: {} frames, up to {} processes",
            frames,
            max_processes
        );
        ProcessManager {
            mem: PhysicalMemory::new(frames),
            processes: BTreeMap::new(),
            next_pid: 1, // PIDs start at 1 (0 is kernel)
            max_processes,
            stats: CowCounters::new(),
        }
    }

    fn live_count(&self) -> usize {
        self.processes.values().filter(|p| p.is_alive()).count()
    }

    fn allocate_process(&mut self, name: String) -> Result<ProcessId, SyscallError> {
        if self.live_count() >= self.max_processes {
            log::warn!("process table full ({} live)", self.max_processes);
            return Err(SyscallError::ResourceExhausted);
        }
        let space = AddressSpace::new(&mut self.mem)?;
        let pid = ProcessId::new(self.next_pid);
        self.next_pid += 1;
        self.processes.insert(pid, Process::new(pid, name, space));
        Ok(pid)
    }

    /// Create a runnable process with an empty address space.
    pub fn create_process(&mut self, name: &str) -> Result<ProcessId, SyscallError> {
        let pid = self.allocate_process(String::from(name))?;
        if let Some(process) = self.processes.get_mut(&pid) {
            process.state = ProcessState::Ready;
        }
        log::info!("Created process {} (PID {})", name, pid);
        Ok(pid)
    }

    /// Get a reference to a process
    pub fn get_process(&self, pid: ProcessId) -> Option<&Process> {
        self.processes.get(&pid)
    }

    /// All processes in PID order
    pub fn processes(&self) -> impl Iterator<Item = &Process> {
        self.processes.values()
    }

    /// Get all process IDs
    pub fn all_pids(&self) -> Vec<ProcessId> {
        self.processes.keys().cloned().collect()
    }

    pub fn memory(&self) -> &PhysicalMemory {
        &self.mem
    }

    /// Page tables of a live process.
    pub fn address_space(&self, pid: ProcessId) -> Result<AddressSpace, SyscallError> {
        self.processes
            .get(&pid)
            .filter(|p| p.is_alive())
            .and_then(|p| p.space)
            .ok_or(SyscallError::NoSuchProcess)
    }

    /// Borrow a live process's page tables together with physical memory,
    /// for the inspector and mutator.
    pub fn space_and_memory(
        &mut self,
        pid: ProcessId,
    ) -> Result<(AddressSpace, &mut PhysicalMemory), SyscallError> {
        let space = self.address_space(pid)?;
        Ok((space, &mut self.mem))
    }

    /// Frame and permissions of the page containing `va`.
    pub fn translate(&self, pid: ProcessId, va: u64) -> Option<(PhysFrame, PagePermissions)> {
        let space = self.address_space(pid).ok()?;
        let addr = VirtAddr::try_new(page_align_down(va)).ok()?;
        space.translate(&self.mem, Page::containing_address(addr))
    }

    pub fn context(&self, pid: ProcessId) -> Option<UserContext> {
        self.processes.get(&pid).map(|p| p.context)
    }

    pub fn set_context(&mut self, pid: ProcessId, context: UserContext) -> Result<(), SyscallError> {
        let process = self
            .processes
            .get_mut(&pid)
            .filter(|p| p.is_alive())
            .ok_or(SyscallError::NoSuchProcess)?;
        process.context = context;
        Ok(())
    }

    /// Get current CoW statistics
    pub fn cow_stats(&self) -> CowStats {
        self.stats.snapshot()
    }

    /// Terminate `pid` and release its address space. The table entry stays
    /// behind with the exit status.
    pub fn kill(&mut self, pid: ProcessId, status: i32) {
        let Some(process) = self.processes.get_mut(&pid) else {
            return;
        };
        if !process.is_alive() {
            return;
        }
        log::error!(
            "Process {} (PID {}) killed with status {}",
            process.name,
            pid,
            status
        );
        process.state = ProcessState::Terminated(status);
        process.fault_upcall = None;
        if let Some(space) = process.space.take() {
            if let Err(e) = space.destroy(&mut self.mem) {
                log::error!("kill: tearing down PID {}: {}", pid, e);
            }
        }
    }

    /// Run the process's fault upcall for `fault`, killing the process if
    /// that is impossible or the upcall fails.
    pub fn deliver_fault(&mut self, pid: ProcessId, fault: &FaultContext) -> Result<(), AccessError> {
        CowCounters::bump(&self.stats.total_faults);
        let killed = AccessError::Killed { pid, fault: *fault };

        let upcall = self
            .processes
            .get(&pid)
            .filter(|p| p.is_alive())
            .ok_or(AccessError::NoSuchProcess(pid))?
            .fault_upcall;
        let Some(upcall) = upcall else {
            log::error!("PID {}: {} with no fault handler", pid, fault);
            self.kill(pid, FAULT_EXIT_STATUS);
            return Err(killed);
        };

        let stack_ok = self
            .translate(pid, UXSTACK)
            .is_some_and(|(_, perms)| perms.is_user() && perms.is_writable());
        if !stack_ok {
            log::error!("PID {}: {} with no usable exception stack", pid, fault);
            self.kill(pid, FAULT_EXIT_STATUS);
            return Err(killed);
        }

        log::trace!("PID {}: delivering {}", pid, fault);
        if let Err(e) = upcall(self, pid, fault) {
            log::error!("PID {}: fault handler failed: {}", pid, e);
            self.kill(pid, FAULT_EXIT_STATUS);
            return Err(killed);
        }
        Ok(())
    }

    /// One user-mode access to `va`: translate, fault, retry once.
    fn user_access(
        &mut self,
        pid: ProcessId,
        va: u64,
        access: Access,
    ) -> Result<PhysFrame, AccessError> {
        let mut delivered = false;
        loop {
            let space = self
                .address_space(pid)
                .map_err(|_| AccessError::NoSuchProcess(pid))?;
            match trap::check_user_access(&space, &self.mem, va, access) {
                Ok(frame) => return Ok(frame),
                Err(fault) if delivered => {
                    log::error!("PID {}: {} persists after handler", pid, fault);
                    self.kill(pid, FAULT_EXIT_STATUS);
                    return Err(AccessError::Killed { pid, fault });
                }
                Err(fault) => {
                    self.deliver_fault(pid, &fault)?;
                    delivered = true;
                }
            }
        }
    }

    /// Store `bytes` at `va` as the process itself would.
    pub fn write_user(&mut self, pid: ProcessId, va: u64, bytes: &[u8]) -> Result<(), AccessError> {
        let mut done = 0;
        while done < bytes.len() {
            let addr = va.wrapping_add(done as u64);
            let offset = (addr % PAGE_SIZE) as usize;
            let len = (PAGE_SIZE as usize - offset).min(bytes.len() - done);
            let frame = self.user_access(pid, addr, Access::Write)?;
            let page = self.mem.page_mut(frame).map_err(AccessError::Memory)?;
            page.0[offset..offset + len].copy_from_slice(&bytes[done..done + len]);
            done += len;
        }
        Ok(())
    }

    /// Load `buf.len()` bytes from `va` as the process itself would.
    pub fn read_user(&mut self, pid: ProcessId, va: u64, buf: &mut [u8]) -> Result<(), AccessError> {
        let mut done = 0;
        while done < buf.len() {
            let addr = va.wrapping_add(done as u64);
            let offset = (addr % PAGE_SIZE) as usize;
            let len = (PAGE_SIZE as usize - offset).min(buf.len() - done);
            let frame = self.user_access(pid, addr, Access::Read)?;
            let page = self.mem.page(frame).map_err(AccessError::Memory)?;
            buf[done..done + len].copy_from_slice(&page.0[offset..offset + len]);
            done += len;
        }
        Ok(())
    }

    pub fn write_u64(&mut self, pid: ProcessId, va: u64, value: u64) -> Result<(), AccessError> {
        self.write_user(pid, va, &value.to_le_bytes())
    }

    pub fn read_u64(&mut self, pid: ProcessId, va: u64) -> Result<u64, AccessError> {
        let mut bytes = [0u8; 8];
        self.read_user(pid, va, &mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// Read a word without raising a fault; `None` if the access would fault.
    pub fn peek_u64(&self, pid: ProcessId, va: u64) -> Option<u64> {
        let space = self.address_space(pid).ok()?;
        let mut bytes = [0u8; 8];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let addr = va.checked_add(i as u64)?;
            let frame = trap::check_user_access(&space, &self.mem, addr, Access::Read).ok()?;
            *byte = self.mem.page(frame).ok()?.0[(addr % PAGE_SIZE) as usize];
        }
        Some(u64::from_le_bytes(bytes))
    }

    /// Log a one-line summary per process
    pub fn debug_processes(&self) {
        for process in self.processes.values() {
            log::debug!(
                "  PID {} {:?} parent={:?} state={}",
                process.id,
                process.name,
                process.parent,
                process.state
            );
        }
    }
}

impl VmSyscalls for ProcessManager {
    fn page_alloc(
        &mut self,
        pid: ProcessId,
        va: u64,
        perm: PagePermissions,
    ) -> Result<(), SyscallError> {
        let page = user_page(va)?;
        check_perm(perm)?;
        let space = self.address_space(pid)?;
        let frame = self.mem.allocate_zeroed()?;
        if let Err(e) = space.map_page(&mut self.mem, page, frame, perm) {
            self.mem.free(frame);
            return Err(e.into());
        }
        log::trace!("page_alloc: PID {} {:#x} [{}]", pid, va, perm.summary());
        Ok(())
    }

    fn page_map(
        &mut self,
        src: ProcessId,
        src_va: u64,
        dst: ProcessId,
        dst_va: u64,
        perm: PagePermissions,
    ) -> Result<(), SyscallError> {
        let src_page = user_page(src_va)?;
        let dst_page = user_page(dst_va)?;
        check_perm(perm)?;
        let src_space = self.address_space(src)?;
        let dst_space = self.address_space(dst)?;

        let (frame, src_perm) = src_space
            .translate(&self.mem, src_page)
            .ok_or(SyscallError::InvalidArgument)?;
        if perm.is_writable() && !src_perm.is_writable() {
            return Err(SyscallError::InvalidArgument);
        }

        self.mem.share(frame);
        if let Err(e) = dst_space.map_page(&mut self.mem, dst_page, frame, perm) {
            self.mem.release(frame);
            return Err(e.into());
        }
        Ok(())
    }

    fn page_unmap(&mut self, pid: ProcessId, va: u64) -> Result<(), SyscallError> {
        let page = user_page(va)?;
        let space = self.address_space(pid)?;
        space.unmap_page(&mut self.mem, page)?;
        Ok(())
    }

    fn exofork(&mut self, parent: ProcessId) -> Result<ProcessId, SyscallError> {
        let parent_process = self
            .processes
            .get(&parent)
            .filter(|p| p.is_alive())
            .ok_or(SyscallError::NoSuchProcess)?;
        let name = parent_process.name.clone();
        let mut context = parent_process.context;
        context.rax = 0;

        let child = self.allocate_process(name)?;
        if let Some(process) = self.processes.get_mut(&child) {
            process.parent = Some(parent);
            process.context = context;
        }
        log::debug!("exofork: PID {} -> PID {}", parent, child);
        Ok(child)
    }

    fn set_runnable(&mut self, pid: ProcessId) -> Result<(), SyscallError> {
        let process = self
            .processes
            .get_mut(&pid)
            .filter(|p| p.is_alive())
            .ok_or(SyscallError::NoSuchProcess)?;
        process.state = ProcessState::Ready;
        Ok(())
    }

    fn set_fault_upcall(
        &mut self,
        pid: ProcessId,
        upcall: FaultUpcall,
    ) -> Result<(), SyscallError> {
        let process = self
            .processes
            .get_mut(&pid)
            .filter(|p| p.is_alive())
            .ok_or(SyscallError::NoSuchProcess)?;
        process.fault_upcall = Some(upcall);
        Ok(())
    }

    fn destroy(&mut self, pid: ProcessId) -> Result<(), SyscallError> {
        let process = self
            .processes
            .remove(&pid)
            .ok_or(SyscallError::NoSuchProcess)?;
        if let Some(space) = process.space {
            space.destroy(&mut self.mem)?;
        }
        log::info!("Destroyed process {} (PID {})", process.name, pid);
        Ok(())
    }

    fn page_permissions(
        &self,
        pid: ProcessId,
        va: u64,
    ) -> Result<Option<PagePermissions>, SyscallError> {
        let page = user_page(page_align_down(va))?;
        let space = self.address_space(pid)?;
        Ok(space.translate(&self.mem, page).map(|(_, perms)| perms))
    }

    fn present_pages(
        &self,
        pid: ProcessId,
        start: u64,
        end: u64,
    ) -> Result<Vec<(u64, PagePermissions)>, SyscallError> {
        let space = self.address_space(pid)?;
        let mappings = space.present_pages(&self.mem, start, end)?;
        Ok(mappings
            .into_iter()
            .map(|m| (m.page.start_address().as_u64(), m.perms))
            .collect())
    }

    fn copy_page(&mut self, pid: ProcessId, src_va: u64, dst_va: u64) -> Result<(), SyscallError> {
        user_page(src_va)?;
        user_page(dst_va)?;
        let space = self.address_space(pid)?;
        let src = trap::check_user_access(&space, &self.mem, src_va, Access::Read)
            .map_err(|_| SyscallError::InvalidArgument)?;
        let dst = trap::check_user_access(&space, &self.mem, dst_va, Access::Write)
            .map_err(|_| SyscallError::InvalidArgument)?;
        self.mem.copy_frame(src, dst).map_err(SyscallError::from)
    }

    fn stats(&self) -> &CowCounters {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::layout::{USTACKTOP, UTEXT};
    use crate::process::cow::handle_cow_fault;

    fn manager_with_init() -> (ProcessManager, ProcessId) {
        let mut pm = ProcessManager::new(64, 4);
        let pid = pm.create_process("init").unwrap();
        (pm, pid)
    }

    #[test]
    fn test_page_alloc_validation() {
        let (mut pm, pid) = manager_with_init();
        let rw = PagePermissions::USER_RW;
        assert_eq!(pm.page_alloc(pid, UTEXT + 1, rw), Err(SyscallError::InvalidArgument));
        assert_eq!(
            pm.page_alloc(pid, 0xffff_8000_0000_0000, rw),
            Err(SyscallError::InvalidArgument)
        );
        assert_eq!(
            pm.page_alloc(pid, UTEXT, PagePermissions::PRESENT),
            Err(SyscallError::InvalidArgument)
        );
        assert_eq!(
            pm.page_alloc(pid, UTEXT, rw | PagePermissions::LARGE_PAGE),
            Err(SyscallError::InvalidArgument)
        );
        assert_eq!(
            pm.page_alloc(ProcessId::new(99), UTEXT, rw),
            Err(SyscallError::NoSuchProcess)
        );
        assert_eq!(pm.page_alloc(pid, UTEXT, rw), Ok(()));
        assert_eq!(pm.page_permissions(pid, UTEXT + 5), Ok(Some(rw)));
    }

    #[test]
    fn test_page_map_refuses_write_upgrade() {
        let (mut pm, pid) = manager_with_init();
        pm.page_alloc(pid, UTEXT, PagePermissions::USER_RO).unwrap();
        assert_eq!(
            pm.page_map(pid, UTEXT, pid, UTEXT + PAGE_SIZE, PagePermissions::USER_RW),
            Err(SyscallError::InvalidArgument)
        );
        assert_eq!(
            pm.page_map(pid, UTEXT + PAGE_SIZE, pid, UTEXT, PagePermissions::USER_RO),
            Err(SyscallError::InvalidArgument),
            "unmapped source"
        );
        pm.page_map(pid, UTEXT, pid, UTEXT + PAGE_SIZE, PagePermissions::USER_RO)
            .unwrap();
        let (a, _) = pm.translate(pid, UTEXT).unwrap();
        let (b, _) = pm.translate(pid, UTEXT + PAGE_SIZE).unwrap();
        assert_eq!(a, b);
        assert_eq!(pm.memory().refcount(a), 2);
    }

    #[test]
    fn test_exofork_copies_context_and_zeroes_return() {
        let (mut pm, pid) = manager_with_init();
        let ctx = UserContext {
            rip: 0x80_0040,
            rsp: USTACKTOP - 64,
            rbp: USTACKTOP - 16,
            rax: 7,
        };
        pm.set_context(pid, ctx).unwrap();
        let child = pm.exofork(pid).unwrap();
        let child_proc = pm.get_process(child).unwrap();
        assert_eq!(child_proc.state, ProcessState::Creating);
        assert_eq!(child_proc.parent, Some(pid));
        assert_eq!(child_proc.context, UserContext { rax: 0, ..ctx });
        assert!(pm.present_pages(child, 0, u64::MAX).unwrap().is_empty());
    }

    #[test]
    fn test_process_table_limit() {
        let mut pm = ProcessManager::new(64, 2);
        let init = pm.create_process("init").unwrap();
        let child = pm.exofork(init).unwrap();
        assert_eq!(pm.exofork(init), Err(SyscallError::ResourceExhausted));
        pm.destroy(child).unwrap();
        assert!(pm.exofork(init).is_ok());
    }

    #[test]
    fn test_fault_without_handler_kills() {
        let (mut pm, pid) = manager_with_init();
        pm.page_alloc(pid, UTEXT, PagePermissions::USER_RO).unwrap();
        let err = pm.write_u64(pid, UTEXT, 1).unwrap_err();
        assert!(matches!(err, AccessError::Killed { .. }));
        assert_eq!(
            pm.get_process(pid).unwrap().state,
            ProcessState::Terminated(FAULT_EXIT_STATUS)
        );
        assert_eq!(pm.memory().frames_in_use(), 0);
        assert_eq!(
            pm.write_u64(pid, UTEXT, 1),
            Err(AccessError::NoSuchProcess(pid))
        );
    }

    #[test]
    fn test_fault_without_exception_stack_kills() {
        let (mut pm, pid) = manager_with_init();
        pm.page_alloc(pid, UTEXT, PagePermissions::USER_RO).unwrap();
        pm.set_fault_upcall(pid, handle_cow_fault).unwrap();
        assert!(pm.read_u64(pid, UTEXT + PAGE_SIZE).is_err());
        assert!(!pm.get_process(pid).unwrap().is_alive());
    }

    #[test]
    fn test_user_access_spans_pages() {
        let (mut pm, pid) = manager_with_init();
        pm.page_alloc(pid, UTEXT, PagePermissions::USER_RW).unwrap();
        pm.page_alloc(pid, UTEXT + PAGE_SIZE, PagePermissions::USER_RW).unwrap();
        let va = UTEXT + PAGE_SIZE - 4;
        pm.write_u64(pid, va, 0x1122_3344_5566_7788).unwrap();
        assert_eq!(pm.read_u64(pid, va).unwrap(), 0x1122_3344_5566_7788);
        assert_eq!(pm.peek_u64(pid, va), Some(0x1122_3344_5566_7788));
        assert_eq!(pm.peek_u64(pid, UTEXT + 2 * PAGE_SIZE - 4), None);
    }

    #[test]
    fn test_copy_page_requires_writable_destination() {
        let (mut pm, pid) = manager_with_init();
        pm.page_alloc(pid, UTEXT, PagePermissions::USER_RW).unwrap();
        pm.page_alloc(pid, UTEXT + PAGE_SIZE, PagePermissions::USER_RO).unwrap();
        pm.write_u64(pid, UTEXT, 42).unwrap();
        assert_eq!(
            pm.copy_page(pid, UTEXT, UTEXT + PAGE_SIZE),
            Err(SyscallError::InvalidArgument)
        );
        assert_eq!(pm.copy_page(pid, UTEXT + PAGE_SIZE, UTEXT), Ok(()));
        assert_eq!(pm.read_u64(pid, UTEXT).unwrap(), 0);
    }
}
