//! Process loader.
//!
//! Materializes a process's address space from a pre-parsed program
//! image. Image parsing itself happens outside this crate; the loader
//! consumes `(virtual address, bytes, in-memory size, writable)` segment
//! tuples plus an entry point.

use alloc::vec::Vec;
use kestrel_error::define_kernel_error;

use crate::kernel::Kernel;
use crate::memory::layout::{MEMSIZE_VIRTUAL, PAGE_SIZE, PROC_START_ADDR};
use crate::memory::page_table::{self, MapError, Mapping, PtePerm, VmIter};
use crate::memory::phys::AllocError;
use crate::memory::{PhysAddr, VirtAddr};
use crate::process::{Pid, ProcState, Registers, RFLAGS_IF};

define_kernel_error! {
    /// Process setup errors. Treated as fatal by the boot caller: no
    /// partial-process recovery is attempted.
    pub enum SetupError(0x03) {
        /// No physical page for a segment, stack or table page.
        Alloc(AllocError) = 0x01 => "process setup allocation failed",
        /// Installing a mapping failed.
        Map(MapError) = 0x02 => "process setup mapping failed",
    }
}

/// One loadable segment of a program image.
///
/// `data` holds the on-disk bytes; `mem_size` may exceed `data.len()`,
/// and the tail is zero-filled (uninitialized data). Segments must not
/// share pages with each other.
#[derive(Debug, Clone, Copy)]
pub struct Segment<'a> {
    /// Virtual start address of the segment.
    pub va: VirtAddr,
    /// On-disk bytes, copied to the start of the segment.
    pub data: &'a [u8],
    /// In-memory size; at least `data.len()`.
    pub mem_size: usize,
    pub writable: bool,
}

/// A pre-parsed program image: the loader's entire view of an
/// executable.
#[derive(Debug, Clone, Copy)]
pub struct ProgramImage<'a> {
    pub entry: VirtAddr,
    pub segments: &'a [Segment<'a>],
}

impl Kernel {
    /// Load `image` into process slot `pid`: fresh page table, shared
    /// kernel-region mappings, one freshly allocated page per segment
    /// page, one stack page at the top of the address space. Marks the
    /// slot runnable.
    pub fn setup_process(&mut self, pid: Pid, image: &ProgramImage<'_>) -> Result<(), SetupError> {
        log::debug!("setting up process {} (entry {})", pid, image.entry);

        let root = page_table::alloc_table(&mut self.mem).map_err(SetupError::Alloc)?;
        self.procs.get_mut(pid).pagetable = Some(root);

        // Share every kernel-region mapping, by reference: same physical
        // pages in every address space.
        let kernel_mappings: Vec<Mapping> =
            VmIter::new(&self.mem, self.kernel_table, 0..PROC_START_ADDR).collect();
        for m in kernel_mappings {
            page_table::try_map(&mut self.mem, root, m.va, m.pa, m.perm)
                .map_err(SetupError::Map)?;
        }

        for seg in image.segments {
            self.load_segment(root, seg)?;
        }

        // One page of initial stack at the top of the address space.
        let stack_va = VirtAddr::new(MEMSIZE_VIRTUAL - PAGE_SIZE);
        let stack = self.mem.alloc_page().map_err(SetupError::Alloc)?;
        page_table::try_map(&mut self.mem, root, stack_va, stack, PtePerm::RWU)
            .map_err(SetupError::Map)?;

        let proc = self.procs.get_mut(pid);
        proc.regs = Registers::default();
        proc.regs.rip = image.entry.as_usize() as u64;
        proc.regs.rsp = MEMSIZE_VIRTUAL as u64;
        proc.regs.rflags = RFLAGS_IF;
        proc.state = ProcState::Runnable;
        Ok(())
    }

    fn load_segment(&mut self, root: PhysAddr, seg: &Segment<'_>) -> Result<(), SetupError> {
        let start = seg.va.as_usize();
        let end = start + seg.mem_size;
        let perm = if seg.writable {
            PtePerm::RWU
        } else {
            PtePerm::PRESENT | PtePerm::USER
        };

        let mut page = start & !(PAGE_SIZE - 1);
        while page < end {
            let pa = self.mem.alloc_page().map_err(SetupError::Alloc)?;
            page_table::try_map(&mut self.mem, root, VirtAddr::new(page), pa, perm)
                .map_err(SetupError::Map)?;

            // Zero the whole page, then lay the on-disk bytes over it;
            // whatever `mem_size` covers beyond `data` stays zero.
            self.mem.fill_page(pa, 0);
            let lo = start.max(page);
            let hi = end.min(page + PAGE_SIZE);
            let data_off = lo - start;
            if data_off < seg.data.len() {
                let n = (seg.data.len() - data_off).min(hi - lo);
                let dst = pa.offset(lo - page);
                self.mem.write(dst, &seg.data[data_off..data_off + n]);
            }
            page += PAGE_SIZE;
        }
        Ok(())
    }
}
