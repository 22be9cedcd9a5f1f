//! The kernel context: physical memory, the kernel page table, the
//! process table, and the scheduler cursor, owned as one value.
//!
//! Entry points (`exception`, `syscall`, `schedule`, `run`) borrow the
//! context mutably, so handler code is plain single-threaded Rust; the
//! trampoline that saves and restores register frames lives outside
//! this crate.

use crate::loader::SetupError;
use crate::memory::layout::{CONSOLE_ADDR, MEMSIZE_PHYSICAL, PAGE_SIZE, PROC_START_ADDR};
use crate::memory::page_table::{self, Mapping, PtePerm};
use crate::memory::phys::PhysMemory;
use crate::memory::{PhysAddr, VirtAddr};
use crate::process::{Pid, ProcState, ProcessTable, Registers};

/// What the trampoline needs to resume a process: the register frame to
/// restore and the page table root to install.
#[derive(Debug, Clone)]
pub struct ResumeFrame {
    pub regs: Registers,
    pub pagetable: PhysAddr,
}

pub struct Kernel {
    pub(crate) mem: PhysMemory,
    pub(crate) kernel_table: PhysAddr,
    pub(crate) procs: ProcessTable,
    current: Pid,
    ticks: u64,
}

impl Kernel {
    /// Bring up the kernel: claim physical memory and build the kernel
    /// page table, an identity mapping of all physical memory.
    ///
    /// Process memory and the console are user-accessible; everything
    /// below `PROC_START_ADDR` is kernel-only. The null page is left
    /// unmapped so kernel null dereferences fault.
    pub fn boot() -> Result<Self, SetupError> {
        let mut mem = PhysMemory::new();
        let kernel_table = page_table::alloc_table(&mut mem).map_err(SetupError::Alloc)?;

        let mut addr = PAGE_SIZE;
        while addr < MEMSIZE_PHYSICAL {
            let perm = if addr >= PROC_START_ADDR || addr == CONSOLE_ADDR {
                PtePerm::RWU
            } else {
                PtePerm::PRESENT | PtePerm::WRITABLE
            };
            page_table::try_map(
                &mut mem,
                kernel_table,
                VirtAddr::new(addr),
                PhysAddr::new(addr),
                perm,
            )
            .map_err(SetupError::Map)?;
            addr += PAGE_SIZE;
        }

        log::info!(
            "kernel up: {:#x} bytes physical, kernel table at {}",
            MEMSIZE_PHYSICAL,
            kernel_table
        );
        Ok(Self {
            mem,
            kernel_table,
            procs: ProcessTable::new(),
            current: Pid(0),
            ticks: 0,
        })
    }

    /// The process the CPU was running when the kernel was entered.
    pub fn current(&self) -> Pid {
        self.current
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub(crate) fn bump_ticks(&mut self) {
        self.ticks += 1;
    }

    pub fn process(&self, pid: Pid) -> &crate::process::Process {
        self.procs.get(pid)
    }

    pub fn phys(&self) -> &PhysMemory {
        &self.mem
    }

    pub fn phys_mut(&mut self) -> &mut PhysMemory {
        &mut self.mem
    }

    /// Walk `pid`'s page table for `va`. `None` if the slot has no page
    /// table or the address is unmapped.
    pub fn translate(&self, pid: Pid, va: VirtAddr) -> Option<Mapping> {
        let root = self.procs.get(pid).pagetable?;
        page_table::lookup(&self.mem, root, va)
    }

    /// Switch to `pid`: make it current and hand back the frame the
    /// trampoline should restore. `None` if the slot is not runnable.
    pub fn run(&mut self, pid: Pid) -> Option<ResumeFrame> {
        let proc = self.procs.get(pid);
        if proc.state != ProcState::Runnable {
            return None;
        }
        let frame = ResumeFrame {
            regs: proc.regs.clone(),
            pagetable: proc.pagetable?,
        };
        self.current = pid;
        Some(frame)
    }

    pub(crate) fn save_registers(&mut self, regs: &Registers) {
        self.procs.get_mut(self.current).regs = regs.clone();
    }
}
