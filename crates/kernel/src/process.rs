//! Process descriptor table.
//!
//! A fixed array of process control blocks. Slot 0 is reserved and never
//! used; valid process ids are `1..PID_MAX`. Each descriptor exclusively
//! owns its page table root; the root is `None` exactly when the slot is
//! free.

use crate::memory::PhysAddr;

/// Number of process table slots, including the reserved slot 0.
pub const PID_MAX: usize = 16;

/// Initial RFLAGS for a fresh process: interrupts enabled.
pub const RFLAGS_IF: u64 = 0x200;

/// Unique identifier for a process; an index into the process table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Pid(pub usize);

impl Pid {
    /// Validate a raw id from a syscall argument. Slot 0 is reserved, so
    /// it is never a valid target.
    #[must_use]
    pub fn checked(raw: u64) -> Option<Pid> {
        let raw = raw as usize;
        if (1..PID_MAX).contains(&raw) {
            Some(Pid(raw))
        } else {
            None
        }
    }
}

impl core::fmt::Display for Pid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State of a process table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    /// Slot is unused.
    Free,
    /// Process can be resumed by the scheduler.
    Runnable,
    /// Process hit an unrecoverable fault; never resumed, slot reclaimed
    /// only by kill.
    Faulted,
}

/// Saved register snapshot, captured on every trap and restored on
/// resume. Syscall convention: number in `rax`, argument in `rdi`,
/// return value in `rax`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registers {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,
}

/// One process control block.
#[derive(Debug)]
pub struct Process {
    pub pid: Pid,
    pub state: ProcState,
    pub regs: Registers,
    /// Root of the owned page table; `None` iff the slot is free.
    pub pagetable: Option<PhysAddr>,
}

/// The fixed-capacity process descriptor table.
pub struct ProcessTable {
    slots: [Process; PID_MAX],
}

impl ProcessTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|i| Process {
                pid: Pid(i),
                state: ProcState::Free,
                regs: Registers::default(),
                pagetable: None,
            }),
        }
    }

    #[must_use]
    pub fn get(&self, pid: Pid) -> &Process {
        &self.slots[pid.0]
    }

    pub fn get_mut(&mut self, pid: Pid) -> &mut Process {
        &mut self.slots[pid.0]
    }

    /// Lowest-numbered free slot, skipping the reserved slot 0.
    #[must_use]
    pub fn free_slot(&self) -> Option<Pid> {
        self.slots[1..]
            .iter()
            .find(|p| p.state == ProcState::Free)
            .map(|p| p.pid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Process> {
        self.slots.iter()
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}
