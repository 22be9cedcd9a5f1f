//! Shared harness: a booted kernel plus a software walk of the current
//! process's page table, so tests touch user memory the way the MMU
//! would, faulting into the kernel where the hardware would.

#![allow(clippy::unwrap_used, dead_code)]

use kestrel_kernel::memory::layout::{MEMSIZE_VIRTUAL, PAGE_SIZE, PROC_START_ADDR};
use kestrel_kernel::{
    Access, Disposition, Kernel, PageFault, Pid, ProgramImage, Registers, Segment, SyscallNumber,
    Trap, VirtAddr,
};

pub const STACK_VA: usize = MEMSIZE_VIRTUAL - PAGE_SIZE;

pub struct Machine {
    pub kernel: Kernel,
}

impl Machine {
    /// Boot and load the same tiny program into each listed slot.
    pub fn boot_with(pids: &[usize]) -> Self {
        let mut kernel = Kernel::boot().unwrap();
        let code = [0x90u8; 16];
        let segments = [Segment {
            va: VirtAddr::new(PROC_START_ADDR),
            data: &code,
            mem_size: code.len(),
            writable: false,
        }];
        let image = ProgramImage {
            entry: VirtAddr::new(PROC_START_ADDR),
            segments: &segments,
        };
        for &pid in pids {
            kernel.setup_process(Pid(pid), &image).unwrap();
        }
        Self { kernel }
    }

    pub fn run(&mut self, pid: usize) {
        self.kernel.run(Pid(pid)).unwrap();
    }

    fn trap_regs(&self) -> Registers {
        self.kernel.process(self.kernel.current()).regs.clone()
    }

    /// Issue a syscall from the current process and return both the
    /// disposition and the value left in the caller's `rax`.
    pub fn syscall(&mut self, number: SyscallNumber, arg: u64) -> (Disposition, i64) {
        let caller = self.kernel.current();
        let mut regs = self.trap_regs();
        regs.rax = number as u64;
        regs.rdi = arg;
        let disp = self.kernel.syscall(&regs).unwrap();
        (disp, self.kernel.process(caller).regs.rax as i64)
    }

    /// Store one byte at a user virtual address as the current process.
    /// Unwritable mappings fault into the kernel exactly once per
    /// attempt; returns false if the kernel refused to resume.
    pub fn write_user(&mut self, va: usize, byte: u8) -> bool {
        let pid = self.kernel.current();
        loop {
            let mapping = self.kernel.translate(pid, VirtAddr::new(va));
            if let Some(m) = mapping {
                if m.user() && m.writable() {
                    let pa = m.pa.offset(va % PAGE_SIZE);
                    self.kernel.phys_mut().write_byte(pa, byte);
                    return true;
                }
            }
            let fault = Trap::PageFault(PageFault {
                addr: VirtAddr::new(va),
                access: Access::Write,
                present: mapping.is_some(),
                user: true,
            });
            let regs = self.trap_regs();
            match self.kernel.exception(&regs, fault).unwrap() {
                Disposition::Resume(_) => {}
                Disposition::Reschedule => return false,
            }
        }
    }

    /// Load one byte from a user virtual address as the current process.
    pub fn read_user(&mut self, va: usize) -> Option<u8> {
        let pid = self.kernel.current();
        let mapping = self.kernel.translate(pid, VirtAddr::new(va));
        if let Some(m) = mapping {
            if m.user() {
                return Some(self.kernel.phys().read_byte(m.pa.offset(va % PAGE_SIZE)));
            }
        }
        let fault = Trap::PageFault(PageFault {
            addr: VirtAddr::new(va),
            access: Access::Read,
            present: mapping.is_some(),
            user: true,
        });
        let regs = self.trap_regs();
        // A read fault is never copy-on-write; the process is zombied.
        assert_eq!(
            self.kernel.exception(&regs, fault).unwrap(),
            Disposition::Reschedule
        );
        None
    }

    /// Number of physical pages with a zero reference count.
    pub fn free_pages(&self) -> usize {
        use kestrel_kernel::memory::layout::NPAGES;
        use kestrel_kernel::PhysAddr;
        (0..NPAGES)
            .filter(|&i| self.kernel.phys().refcount(PhysAddr::new(i * PAGE_SIZE)) == 0)
            .count()
    }
}
