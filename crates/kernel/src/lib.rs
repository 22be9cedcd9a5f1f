//! A small teaching kernel core: physical page allocator, four-level
//! page tables with copy-on-write fork, a fixed process table, and a
//! round-robin scheduler.
//!
//! The crate is the machine-independent half of the kernel. Physical
//! memory is an owned arena and addresses are typed indexes into it, so
//! every path here runs unchanged under the host test harness; the
//! trampoline that switches privilege levels and register frames is the
//! platform crate's job. Entry points from that side are
//! [`Kernel::exception`], [`Kernel::syscall`], [`Kernel::schedule`] and
//! [`Kernel::run`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod kernel;
pub mod loader;
pub mod memory;
pub mod process;
pub mod sched;
pub mod syscall;
pub mod trap;

pub use kernel::{Kernel, ResumeFrame};
pub use loader::{ProgramImage, Segment, SetupError};
pub use memory::page_table::{MapError, Mapping, PtePerm};
pub use memory::phys::AllocError;
pub use memory::{PhysAddr, VirtAddr};
pub use process::{Pid, ProcState, Process, Registers, PID_MAX};
pub use syscall::{errno, SyscallNumber};
pub use trap::{Access, Disposition, Fatal, PageFault, Trap};
