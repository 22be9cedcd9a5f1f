//! Round-robin scheduling.

use crate::kernel::Kernel;
use crate::process::{Pid, ProcState, PID_MAX};

impl Kernel {
    /// Pick the next runnable process, scanning circularly from the
    /// slot after the current one so every runnable process gets a turn
    /// per rotation. `None` means nothing is runnable and the machine
    /// should idle or halt.
    pub fn schedule(&mut self) -> Option<Pid> {
        let start = self.current().0;
        for step in 1..=PID_MAX {
            let pid = Pid((start + step) % PID_MAX);
            if pid.0 == 0 {
                continue;
            }
            if self.procs.get(pid).state == ProcState::Runnable {
                return Some(pid);
            }
        }
        None
    }
}
