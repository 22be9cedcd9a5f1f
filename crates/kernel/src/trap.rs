//! Fault and exception handling.
//!
//! The hardware trampoline (outside this crate) saves user registers,
//! builds a [`Trap`] value and calls [`Kernel::exception`] or
//! [`Kernel::syscall`]. Handlers never transfer control themselves: they
//! return a [`Disposition`] and the trampoline interprets it, so every
//! handler is an ordinary function of kernel state.
//!
//! Interrupts are masked while kernel code runs; a handler executes
//! atomically with respect to other traps.

use crate::kernel::Kernel;
use crate::memory::page_table::{self, PtePerm};
use crate::memory::{PhysAddr, VirtAddr};
use crate::process::{Pid, ProcState, Registers};

/// Access type of a faulting memory reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

impl core::fmt::Display for Access {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Access::Read => f.write_str("read"),
            Access::Write => f.write_str("write"),
        }
    }
}

/// Decoded page fault state, taken from the hardware error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    /// The faulting virtual address (not necessarily page-aligned).
    pub addr: VirtAddr,
    pub access: Access,
    /// True for a protection violation, false for a missing mapping.
    pub present: bool,
    /// True if the access originated in user mode.
    pub user: bool,
}

impl PageFault {
    fn problem(&self) -> &'static str {
        if self.present {
            "protection problem"
        } else {
            "missing page"
        }
    }
}

/// Cause of a hardware trap, as decoded by the trampoline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    /// Timer interrupt. The trampoline has already acknowledged the
    /// interrupt controller.
    Timer,
    PageFault(PageFault),
    /// Anything this kernel does not recognize, by vector number.
    Other(u64),
}

/// What the trampoline should do after a handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Restore this process's registers and page table and return to it.
    Resume(Pid),
    /// Invoke the scheduler; the interrupted process is not resumed
    /// directly.
    Reschedule,
}

/// Kernel-fatal conditions: invariant violations and unhandled traps.
/// There is no supervisor above the kernel, so these propagate to the
/// single top-level halt handler instead of being recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fatal {
    /// `free_page` on a misaligned address.
    FreeUnaligned { addr: PhysAddr },
    /// `free_page` on a page with reference count zero.
    FreeUnowned { addr: PhysAddr },
    /// `retain` on a page with reference count zero.
    RetainUnowned { addr: PhysAddr },
    /// A page fault whose access did not originate in user mode.
    KernelPageFault {
        pid: Pid,
        addr: VirtAddr,
        access: Access,
        present: bool,
        rip: u64,
    },
    /// A trap vector this kernel does not handle.
    UnhandledTrap { pid: Pid, number: u64, rip: u64 },
    /// A syscall number this kernel does not implement.
    UnknownSyscall { pid: Pid, number: u64, rip: u64 },
    /// The panic syscall; `message` is the user address of the
    /// diagnostic string.
    UserPanic { pid: Pid, message: u64 },
}

impl core::fmt::Display for Fatal {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Fatal::FreeUnaligned { addr } => {
                write!(f, "free of unaligned physical address {addr}")
            }
            Fatal::FreeUnowned { addr } => {
                write!(f, "free of unowned physical page {addr}")
            }
            Fatal::RetainUnowned { addr } => {
                write!(f, "retain of unowned physical page {addr}")
            }
            Fatal::KernelPageFault {
                pid,
                addr,
                access,
                present,
                rip,
            } => {
                let problem = if *present {
                    "protection problem"
                } else {
                    "missing page"
                };
                write!(
                    f,
                    "kernel page fault on {addr} ({access} {problem}, pid={pid}, rip={rip:#x})"
                )
            }
            Fatal::UnhandledTrap { pid, number, rip } => {
                write!(f, "unhandled exception {number} (pid={pid}, rip={rip:#x})")
            }
            Fatal::UnknownSyscall { pid, number, rip } => {
                write!(
                    f,
                    "unhandled system call {number} (pid={pid}, rip={rip:#x})"
                )
            }
            Fatal::UserPanic { pid, message } => {
                write!(f, "process {pid} panic (message at {message:#x})")
            }
        }
    }
}

impl core::error::Error for Fatal {}

impl Kernel {
    /// Handle an interrupt, trap or fault on behalf of the current
    /// process. `regs` is the register snapshot the trampoline saved.
    pub fn exception(&mut self, regs: &Registers, cause: Trap) -> Result<Disposition, Fatal> {
        self.save_registers(regs);
        match cause {
            Trap::Timer => {
                self.bump_ticks();
                // Fairness comes purely from timer-driven preemption:
                // never return to the interrupted process from here.
                Ok(Disposition::Reschedule)
            }
            Trap::PageFault(fault) => self.page_fault(fault),
            Trap::Other(number) => Err(Fatal::UnhandledTrap {
                pid: self.current(),
                number,
                rip: regs.rip,
            }),
        }
    }

    fn page_fault(&mut self, fault: PageFault) -> Result<Disposition, Fatal> {
        let pid = self.current();
        let page_va = fault.addr.page_down();
        let root = self.procs.get(pid).pagetable;
        let mapping = root.and_then(|root| page_table::lookup(&self.mem, root, page_va));

        // Copy-on-write resolution comes first: a write to a pending
        // entry is the one fault the kernel repairs and retries.
        if fault.access == Access::Write {
            if let (Some(root), Some(mapping)) = (root, mapping) {
                if mapping.cow() {
                    return self.resolve_cow(pid, root, mapping.va, mapping.pa);
                }
            }
        }

        if !fault.user {
            return Err(Fatal::KernelPageFault {
                pid,
                addr: fault.addr,
                access: fault.access,
                present: fault.present,
                rip: self.procs.get(pid).regs.rip,
            });
        }

        log::error!(
            "process {} page fault on {} ({} {}, rip={:#x})",
            pid,
            fault.addr,
            fault.access,
            fault.problem(),
            self.procs.get(pid).regs.rip,
        );
        self.procs.get_mut(pid).state = ProcState::Faulted;
        Ok(Disposition::Reschedule)
    }

    /// Resolve a write fault on a copy-on-write pending page.
    fn resolve_cow(
        &mut self,
        pid: Pid,
        root: PhysAddr,
        va: VirtAddr,
        shared: PhysAddr,
    ) -> Result<Disposition, Fatal> {
        if self.mem.refcount(shared) == 1 {
            // Sole owner: upgrade in place, no copy needed.
            if page_table::try_map(&mut self.mem, root, va, shared, PtePerm::RWU).is_err() {
                // The walk structure exists, so this is exhaustion on a
                // path that allocates nothing; treat like any other
                // out-of-memory fault and terminate the process.
                self.teardown(pid)?;
                return Ok(Disposition::Reschedule);
            }
            return Ok(Disposition::Resume(pid));
        }

        let fresh = match self.mem.alloc_page() {
            Ok(pa) => pa,
            Err(_) => {
                // Out of memory resolving the fault: terminate the
                // faulting process rather than crash the kernel.
                self.teardown(pid)?;
                return Ok(Disposition::Reschedule);
            }
        };
        self.mem.copy_page(fresh, shared);
        if page_table::try_map(&mut self.mem, root, va, fresh, PtePerm::RWU).is_err() {
            self.mem.free_page(fresh)?;
            self.teardown(pid)?;
            return Ok(Disposition::Reschedule);
        }
        // The new mapping replaced this process's reference to the
        // shared page.
        self.mem.free_page(shared)?;
        Ok(Disposition::Resume(pid))
    }
}
