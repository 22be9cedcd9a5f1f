//! System call decoding and dispatch.
//!
//! The number arrives in `rax`, the single argument in `rdi`, and the
//! return value goes back out through the saved frame's `rax`. Results
//! user code can act on are reported as small negative values from
//! [`errno`]; conditions no correct program can trigger surface as
//! [`Fatal`].

use alloc::vec::Vec;

use crate::kernel::Kernel;
use crate::memory::layout::{CONSOLE_ADDR, MEMSIZE_VIRTUAL, PROC_START_ADDR};
use crate::memory::page_table::{self, Mapping, PtIter, PtePerm, VmIter};
use crate::memory::{PhysAddr, VirtAddr};
use crate::process::{Pid, ProcState, Registers};
use crate::trap::{Disposition, Fatal};

/// Negative return values delivered to user code.
pub mod errno {
    /// Malformed argument (unaligned or out-of-range address, bad pid).
    pub const EINVAL: i64 = -1;
    /// Physical memory exhausted.
    pub const ENOMEM: i64 = -2;
    /// No free process slot.
    pub const EAGAIN: i64 = -3;
    /// No such process.
    pub const ESRCH: i64 = -4;
}

/// The syscall numbers user code puts in `rax`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum SyscallNumber {
    Panic = 1,
    GetPid = 2,
    Yield = 3,
    PageAlloc = 4,
    Fork = 5,
    Exit = 6,
    Kill = 7,
}

impl SyscallNumber {
    pub fn from_u64(raw: u64) -> Option<Self> {
        match raw {
            1 => Some(Self::Panic),
            2 => Some(Self::GetPid),
            3 => Some(Self::Yield),
            4 => Some(Self::PageAlloc),
            5 => Some(Self::Fork),
            6 => Some(Self::Exit),
            7 => Some(Self::Kill),
            _ => None,
        }
    }
}

impl Kernel {
    /// Handle a system call trapped from the current process. `regs` is
    /// the register snapshot the trampoline saved; the return value is
    /// written into the saved frame before the process next runs.
    pub fn syscall(&mut self, regs: &Registers) -> Result<Disposition, Fatal> {
        self.save_registers(regs);
        let pid = self.current();
        let Some(number) = SyscallNumber::from_u64(regs.rax) else {
            return Err(Fatal::UnknownSyscall {
                pid,
                number: regs.rax,
                rip: regs.rip,
            });
        };
        log::trace!("process {pid} syscall {number:?}");

        match number {
            SyscallNumber::GetPid => {
                self.set_return(pid, pid.0 as i64);
                Ok(Disposition::Resume(pid))
            }
            SyscallNumber::Yield => {
                self.set_return(pid, 0);
                Ok(Disposition::Reschedule)
            }
            SyscallNumber::PageAlloc => {
                let value = self.sys_page_alloc(VirtAddr::new(regs.rdi as usize))?;
                self.set_return(pid, value);
                Ok(Disposition::Resume(pid))
            }
            SyscallNumber::Fork => {
                let value = self.sys_fork()?;
                self.set_return(pid, value);
                Ok(Disposition::Resume(pid))
            }
            SyscallNumber::Exit => {
                self.teardown(pid)?;
                Ok(Disposition::Reschedule)
            }
            SyscallNumber::Kill => {
                let (value, killed_self) = self.sys_kill(regs.rdi)?;
                if killed_self {
                    // The caller's slot is gone; there is no frame to
                    // deliver a return value into.
                    return Ok(Disposition::Reschedule);
                }
                self.set_return(pid, value);
                Ok(Disposition::Resume(pid))
            }
            SyscallNumber::Panic => Err(Fatal::UserPanic {
                pid,
                message: regs.rdi,
            }),
        }
    }

    fn set_return(&mut self, pid: Pid, value: i64) {
        self.procs.get_mut(pid).regs.rax = value as u64;
    }

    /// Map a fresh zero-filled page at `va` in the caller's private
    /// region, replacing and releasing whatever was mapped there.
    fn sys_page_alloc(&mut self, va: VirtAddr) -> Result<i64, Fatal> {
        let pid = self.current();
        if !va.is_page_aligned()
            || va.as_usize() < PROC_START_ADDR
            || va.as_usize() >= MEMSIZE_VIRTUAL
        {
            return Ok(errno::EINVAL);
        }
        let Some(root) = self.procs.get(pid).pagetable else {
            return Ok(errno::EINVAL);
        };

        let displaced = page_table::lookup(&self.mem, root, va);
        let Ok(pa) = self.mem.alloc_page() else {
            return Ok(errno::ENOMEM);
        };
        if page_table::try_map(&mut self.mem, root, va, pa, PtePerm::RWU).is_err() {
            self.mem.free_page(pa)?;
            return Ok(errno::ENOMEM);
        }
        self.mem.fill_page(pa, 0);

        // The old physical page, if any, just lost this mapping.
        if let Some(old) = displaced {
            if old.user() && old.pa.as_usize() != CONSOLE_ADDR {
                self.mem.free_page(old.pa)?;
            }
        }
        Ok(0)
    }

    /// Copy-on-write fork. The child shares every private physical page
    /// with the parent; writable pages are downgraded to write-pending
    /// on both sides so the first write to either copy faults and
    /// copies.
    fn sys_fork(&mut self) -> Result<i64, Fatal> {
        let parent = self.current();
        let Some(child) = self.procs.free_slot() else {
            return Ok(errno::EAGAIN);
        };
        let Some(parent_root) = self.procs.get(parent).pagetable else {
            return Ok(errno::EINVAL);
        };

        let Ok(child_root) = page_table::alloc_table(&mut self.mem) else {
            return Ok(errno::ENOMEM);
        };
        // Owned by the child slot from here on, so a failed construction
        // unwinds through ordinary teardown.
        self.procs.get_mut(child).pagetable = Some(child_root);

        let kernel_mappings: Vec<Mapping> =
            VmIter::new(&self.mem, self.kernel_table, 0..PROC_START_ADDR).collect();
        for m in kernel_mappings {
            if page_table::try_map(&mut self.mem, child_root, m.va, m.pa, m.perm).is_err() {
                self.teardown(child)?;
                return Ok(errno::ENOMEM);
            }
        }

        // Pass one: give the child a reference to every private page.
        // The parent is untouched until the child is fully built, so a
        // failure here leaves the parent exactly as it was.
        let private: Vec<Mapping> =
            VmIter::new(&self.mem, parent_root, PROC_START_ADDR..MEMSIZE_VIRTUAL).collect();
        for m in &private {
            let perm = if m.pa.as_usize() == CONSOLE_ADDR {
                // Device memory: shared identically, never counted.
                m.perm
            } else if m.writable() {
                (m.perm - PtePerm::WRITABLE) | PtePerm::COW
            } else {
                m.perm
            };
            if page_table::try_map(&mut self.mem, child_root, m.va, m.pa, perm).is_err() {
                self.teardown(child)?;
                return Ok(errno::ENOMEM);
            }
            if m.pa.as_usize() != CONSOLE_ADDR {
                self.mem.retain(m.pa)?;
            }
        }

        // Pass two: downgrade the parent's writable entries to match.
        // Every leaf entry already exists, so the walk allocates nothing
        // and installing the entry cannot fail.
        for m in &private {
            if m.writable() && m.pa.as_usize() != CONSOLE_ADDR {
                let perm = (m.perm - PtePerm::WRITABLE) | PtePerm::COW;
                let _ = page_table::try_map(&mut self.mem, parent_root, m.va, m.pa, perm);
            }
        }

        let regs = self.procs.get(parent).regs.clone();
        let slot = self.procs.get_mut(child);
        slot.regs = regs;
        slot.regs.rax = 0;
        slot.state = ProcState::Runnable;
        log::debug!("process {parent} forked child {child}");
        Ok(child.0 as i64)
    }

    /// Tear down the target slot. Any process may kill any non-free
    /// slot by pid, itself included; there is no ownership check. A
    /// multi-user system would restrict the target set.
    fn sys_kill(&mut self, raw: u64) -> Result<(i64, bool), Fatal> {
        let Some(target) = Pid::checked(raw) else {
            return Ok((errno::ESRCH, false));
        };
        if self.procs.get(target).state == ProcState::Free {
            return Ok((errno::ESRCH, false));
        }
        log::debug!("process {} killed process {target}", self.current());
        self.teardown(target)?;
        Ok((0, target == self.current()))
    }

    /// Release everything a process slot owns: every private physical
    /// page, then the page-table-structure pages, then the root. Data
    /// pages go first so the structure pages stay walkable while the
    /// address space is enumerated.
    pub(crate) fn teardown(&mut self, pid: Pid) -> Result<(), Fatal> {
        let Some(root) = self.procs.get_mut(pid).pagetable.take() else {
            return Ok(());
        };

        let data: Vec<Mapping> = VmIter::new(&self.mem, root, 0..MEMSIZE_VIRTUAL).collect();
        for m in data {
            if m.user() && m.pa.as_usize() != CONSOLE_ADDR {
                self.mem.free_page(m.pa)?;
            }
        }
        let structure: Vec<PhysAddr> = PtIter::new(&self.mem, root).collect();
        for pa in structure {
            self.mem.free_page(pa)?;
        }
        self.mem.free_page(root)?;

        let slot = self.procs.get_mut(pid);
        slot.state = ProcState::Free;
        slot.regs = Registers::default();
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::loader::{ProgramImage, Segment};
    use crate::memory::layout::PAGE_SIZE;

    fn booted_with(pids: &[usize]) -> Kernel {
        let mut kernel = Kernel::boot().unwrap();
        let segments = [Segment {
            va: VirtAddr::new(PROC_START_ADDR),
            data: &[0x90; 16],
            mem_size: 16,
            writable: false,
        }];
        let image = ProgramImage {
            entry: VirtAddr::new(PROC_START_ADDR),
            segments: &segments,
        };
        for &pid in pids {
            kernel.setup_process(Pid(pid), &image).unwrap();
        }
        kernel
    }

    fn invoke(kernel: &mut Kernel, number: SyscallNumber, arg: u64) -> Disposition {
        let mut regs = kernel.process(kernel.current()).regs.clone();
        regs.rax = number as u64;
        regs.rdi = arg;
        kernel.syscall(&regs).unwrap()
    }

    fn rax(kernel: &Kernel, pid: Pid) -> i64 {
        kernel.process(pid).regs.rax as i64
    }

    #[test]
    fn get_pid_returns_the_caller_id() {
        let mut kernel = booted_with(&[1, 2]);
        kernel.run(Pid(2)).unwrap();
        let disp = invoke(&mut kernel, SyscallNumber::GetPid, 0);
        assert_eq!(disp, Disposition::Resume(Pid(2)));
        assert_eq!(rax(&kernel, Pid(2)), 2);
    }

    #[test]
    fn yield_reschedules_with_zero_return() {
        let mut kernel = booted_with(&[1]);
        kernel.run(Pid(1)).unwrap();
        let disp = invoke(&mut kernel, SyscallNumber::Yield, 0);
        assert_eq!(disp, Disposition::Reschedule);
        assert_eq!(rax(&kernel, Pid(1)), 0);
    }

    #[test]
    fn page_alloc_rejects_bad_addresses() {
        let mut kernel = booted_with(&[1]);
        kernel.run(Pid(1)).unwrap();
        for bad in [
            PROC_START_ADDR as u64 + 1,         // unaligned
            (PROC_START_ADDR - PAGE_SIZE) as u64, // kernel region
            MEMSIZE_VIRTUAL as u64,             // past the top
        ] {
            invoke(&mut kernel, SyscallNumber::PageAlloc, bad);
            assert_eq!(rax(&kernel, Pid(1)), errno::EINVAL);
        }
    }

    #[test]
    fn page_alloc_maps_a_zeroed_user_page() {
        let mut kernel = booted_with(&[1]);
        kernel.run(Pid(1)).unwrap();
        let va = (PROC_START_ADDR + 8 * PAGE_SIZE) as u64;
        invoke(&mut kernel, SyscallNumber::PageAlloc, va);
        assert_eq!(rax(&kernel, Pid(1)), 0);

        let m = kernel.translate(Pid(1), VirtAddr::new(va as usize)).unwrap();
        assert!(m.user() && m.writable());
        assert!(kernel.phys().page(m.pa).iter().all(|&b| b == 0));
    }

    #[test]
    fn page_alloc_twice_replaces_and_releases_the_old_page() {
        let mut kernel = booted_with(&[1]);
        kernel.run(Pid(1)).unwrap();
        let va = (PROC_START_ADDR + 8 * PAGE_SIZE) as u64;
        invoke(&mut kernel, SyscallNumber::PageAlloc, va);
        let first = kernel.translate(Pid(1), VirtAddr::new(va as usize)).unwrap().pa;
        kernel.phys_mut().write_byte(first, 0xAB);

        invoke(&mut kernel, SyscallNumber::PageAlloc, va);
        assert_eq!(rax(&kernel, Pid(1)), 0);
        let second = kernel.translate(Pid(1), VirtAddr::new(va as usize)).unwrap().pa;
        assert_ne!(first, second);
        // Old content is gone and the old page is allocatable again.
        assert!(kernel.phys().page(second).iter().all(|&b| b == 0));
        assert_eq!(kernel.phys().refcount(first), 0);
    }

    #[test]
    fn fork_shares_pages_copy_on_write() {
        let mut kernel = booted_with(&[1]);
        kernel.run(Pid(1)).unwrap();
        let stack_va = VirtAddr::new(MEMSIZE_VIRTUAL - PAGE_SIZE);
        let parent_stack = kernel.translate(Pid(1), stack_va).unwrap();
        assert!(parent_stack.writable());

        let disp = invoke(&mut kernel, SyscallNumber::Fork, 0);
        assert_eq!(disp, Disposition::Resume(Pid(1)));
        assert_eq!(rax(&kernel, Pid(1)), 2);
        assert_eq!(rax(&kernel, Pid(2)), 0);
        assert_eq!(kernel.process(Pid(2)).state, ProcState::Runnable);

        // Both sides now hold the same page, write-pending.
        let p = kernel.translate(Pid(1), stack_va).unwrap();
        let c = kernel.translate(Pid(2), stack_va).unwrap();
        assert_eq!(p.pa, c.pa);
        assert!(p.cow() && !p.writable());
        assert!(c.cow() && !c.writable());
        assert_eq!(kernel.phys().refcount(p.pa), 2);

        // The read-only code page is shared without a permission change.
        let code = kernel.translate(Pid(2), VirtAddr::new(PROC_START_ADDR)).unwrap();
        assert!(!code.cow() && !code.writable());
        assert_eq!(kernel.phys().refcount(code.pa), 2);
    }

    #[test]
    fn fork_with_no_free_slot_fails_cleanly() {
        let mut kernel = booted_with(&(1..crate::process::PID_MAX).collect::<Vec<_>>());
        kernel.run(Pid(1)).unwrap();
        let stack_perm_before = kernel
            .translate(Pid(1), VirtAddr::new(MEMSIZE_VIRTUAL - PAGE_SIZE))
            .unwrap()
            .perm;
        invoke(&mut kernel, SyscallNumber::Fork, 0);
        assert_eq!(rax(&kernel, Pid(1)), errno::EAGAIN);
        // Parent untouched.
        let after = kernel
            .translate(Pid(1), VirtAddr::new(MEMSIZE_VIRTUAL - PAGE_SIZE))
            .unwrap();
        assert_eq!(after.perm, stack_perm_before);
    }

    #[test]
    fn exit_frees_every_owned_page() {
        let mut kernel = booted_with(&[1]);
        kernel.run(Pid(1)).unwrap();
        let code = kernel.translate(Pid(1), VirtAddr::new(PROC_START_ADDR)).unwrap().pa;
        let stack = kernel
            .translate(Pid(1), VirtAddr::new(MEMSIZE_VIRTUAL - PAGE_SIZE))
            .unwrap()
            .pa;
        let root = kernel.process(Pid(1)).pagetable.unwrap();

        let disp = invoke(&mut kernel, SyscallNumber::Exit, 0);
        assert_eq!(disp, Disposition::Reschedule);
        let slot = kernel.process(Pid(1));
        assert_eq!(slot.state, ProcState::Free);
        assert!(slot.pagetable.is_none());
        for pa in [code, stack, root] {
            assert_eq!(kernel.phys().refcount(pa), 0);
        }
    }

    #[test]
    fn exit_after_fork_releases_only_this_side() {
        let mut kernel = booted_with(&[1]);
        kernel.run(Pid(1)).unwrap();
        invoke(&mut kernel, SyscallNumber::Fork, 0);
        let stack_va = VirtAddr::new(MEMSIZE_VIRTUAL - PAGE_SIZE);
        let shared = kernel.translate(Pid(1), stack_va).unwrap().pa;
        assert_eq!(kernel.phys().refcount(shared), 2);

        kernel.run(Pid(2)).unwrap();
        invoke(&mut kernel, SyscallNumber::Exit, 0);
        // The parent still owns its reference.
        assert_eq!(kernel.phys().refcount(shared), 1);
        assert_eq!(kernel.translate(Pid(1), stack_va).unwrap().pa, shared);
    }

    #[test]
    fn kill_reaps_another_process() {
        let mut kernel = booted_with(&[1, 2]);
        kernel.run(Pid(1)).unwrap();
        let disp = invoke(&mut kernel, SyscallNumber::Kill, 2);
        assert_eq!(disp, Disposition::Resume(Pid(1)));
        assert_eq!(rax(&kernel, Pid(1)), 0);
        assert_eq!(kernel.process(Pid(2)).state, ProcState::Free);
    }

    #[test]
    fn kill_of_self_reschedules() {
        let mut kernel = booted_with(&[1]);
        kernel.run(Pid(1)).unwrap();
        let disp = invoke(&mut kernel, SyscallNumber::Kill, 1);
        assert_eq!(disp, Disposition::Reschedule);
        assert_eq!(kernel.process(Pid(1)).state, ProcState::Free);
    }

    #[test]
    fn kill_of_a_free_slot_mutates_nothing() {
        let mut kernel = booted_with(&[1]);
        kernel.run(Pid(1)).unwrap();
        let free_before: usize = (0..crate::memory::layout::NPAGES)
            .filter(|&i| kernel.phys().refcount(PhysAddr::new(i * PAGE_SIZE)) == 0)
            .count();
        for target in [3u64, 0, 99] {
            invoke(&mut kernel, SyscallNumber::Kill, target);
            assert_eq!(rax(&kernel, Pid(1)), errno::ESRCH);
        }
        let free_after: usize = (0..crate::memory::layout::NPAGES)
            .filter(|&i| kernel.phys().refcount(PhysAddr::new(i * PAGE_SIZE)) == 0)
            .count();
        assert_eq!(free_before, free_after);
    }

    #[test]
    fn unknown_syscall_number_is_fatal() {
        let mut kernel = booted_with(&[1]);
        kernel.run(Pid(1)).unwrap();
        let mut regs = kernel.process(Pid(1)).regs.clone();
        regs.rax = 42;
        let err = kernel.syscall(&regs).unwrap_err();
        assert!(matches!(err, Fatal::UnknownSyscall { number: 42, .. }));
    }

    #[test]
    fn panic_syscall_is_fatal_with_the_message_address() {
        let mut kernel = booted_with(&[1]);
        kernel.run(Pid(1)).unwrap();
        let mut regs = kernel.process(Pid(1)).regs.clone();
        regs.rax = SyscallNumber::Panic as u64;
        regs.rdi = 0x101f00;
        let err = kernel.syscall(&regs).unwrap_err();
        assert!(matches!(err, Fatal::UserPanic { message: 0x101f00, .. }));
    }
}
