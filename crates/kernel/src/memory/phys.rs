//! Physical page allocator.
//!
//! One `PageInfo` record per physical page tracks its boot classification
//! and reference count; the count is the number of live page-table
//! mappings that own the page. A page is allocatable iff it is classified
//! `Available` and its count is zero.

use alloc::boxed::Box;
use alloc::vec::Vec;
use kestrel_error::define_kernel_error;

use super::layout::{
    KERNEL_END_ADDR, KERNEL_START_ADDR, MEMSIZE_PHYSICAL, MMIO_END_ADDR, MMIO_START_ADDR, NPAGES,
    PAGE_SIZE,
};
use super::PhysAddr;
use crate::trap::Fatal;

/// Freshly allocated pages are filled with this byte. It encodes a
/// breakpoint instruction, so executing stale or uninitialized memory
/// traps loudly instead of running garbage.
pub const ALLOC_SENTINEL: u8 = 0xCC;

define_kernel_error! {
    /// Physical page allocation errors.
    pub enum AllocError(0x01) {
        /// No available page has reference count zero.
        Exhausted = 0x01 => "out of physical pages",
    }
}

/// Boot classification of a physical page. Fixed for the kernel's
/// lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// Reserved for the kernel image, kernel stack, or firmware.
    Reserved,
    /// Memory-mapped device region (contains the console page).
    Mmio,
    /// Available for process use.
    Available,
}

impl PageKind {
    /// Classification of the page holding `addr`.
    #[must_use]
    pub fn classify(addr: usize) -> Self {
        if addr < PAGE_SIZE || (KERNEL_START_ADDR..KERNEL_END_ADDR).contains(&addr) {
            PageKind::Reserved
        } else if (MMIO_START_ADDR..MMIO_END_ADDR).contains(&addr) {
            PageKind::Mmio
        } else {
            PageKind::Available
        }
    }
}

/// Per-page record. The array lives for the kernel's lifetime; records
/// are only ever mutated by allocate, free and retain.
#[derive(Debug, Clone, Copy)]
pub struct PageInfo {
    pub kind: PageKind,
    pub refcount: u16,
}

/// The physical address space: the per-page record array plus the byte
/// arena backing it. All physical memory access in the kernel goes
/// through this type.
pub struct PhysMemory {
    pages: Box<[PageInfo]>,
    bytes: Box<[u8]>,
}

impl PhysMemory {
    #[must_use]
    pub fn new() -> Self {
        let pages: Vec<PageInfo> = (0..NPAGES)
            .map(|n| PageInfo {
                kind: PageKind::classify(n * PAGE_SIZE),
                refcount: 0,
            })
            .collect();
        Self {
            pages: pages.into_boxed_slice(),
            bytes: alloc::vec![0u8; MEMSIZE_PHYSICAL].into_boxed_slice(),
        }
    }

    /// Allocate one page: the first page that is classified available and
    /// has reference count zero. On success the count becomes one and the
    /// page is filled with [`ALLOC_SENTINEL`].
    ///
    /// Granularity is fixed at one page; there is no multi-page
    /// interface.
    pub fn alloc_page(&mut self) -> Result<PhysAddr, AllocError> {
        for (n, page) in self.pages.iter_mut().enumerate() {
            if page.kind == PageKind::Available && page.refcount == 0 {
                page.refcount = 1;
                let pa = PhysAddr::new(n * PAGE_SIZE);
                self.fill_page(pa, ALLOC_SENTINEL);
                return Ok(pa);
            }
        }
        Err(AllocError::Exhausted)
    }

    /// Release one reference to `pa`. The page becomes allocatable again
    /// only when the count reaches zero.
    ///
    /// A misaligned address or a zero count is a kernel programming
    /// error, not a recoverable condition.
    pub fn free_page(&mut self, pa: PhysAddr) -> Result<(), Fatal> {
        if !pa.is_page_aligned() {
            return Err(Fatal::FreeUnaligned { addr: pa });
        }
        let page = &mut self.pages[pa.page_index()];
        if page.refcount == 0 {
            return Err(Fatal::FreeUnowned { addr: pa });
        }
        page.refcount -= 1;
        Ok(())
    }

    /// Add a reference to an already-owned page; used when an existing
    /// physical page gains an additional virtual mapping.
    pub fn retain(&mut self, pa: PhysAddr) -> Result<(), Fatal> {
        let page = &mut self.pages[pa.page_index()];
        if page.refcount == 0 {
            return Err(Fatal::RetainUnowned { addr: pa });
        }
        page.refcount += 1;
        Ok(())
    }

    #[must_use]
    pub fn refcount(&self, pa: PhysAddr) -> u16 {
        self.pages[pa.page_index()].refcount
    }

    #[must_use]
    pub fn kind(&self, pa: PhysAddr) -> PageKind {
        self.pages[pa.page_index()].kind
    }

    /// The whole page containing `pa`.
    #[must_use]
    pub fn page(&self, pa: PhysAddr) -> &[u8] {
        let base = pa.page_index() * PAGE_SIZE;
        &self.bytes[base..base + PAGE_SIZE]
    }

    /// Overwrite the whole page containing `pa` with `byte`.
    pub fn fill_page(&mut self, pa: PhysAddr, byte: u8) {
        let base = pa.page_index() * PAGE_SIZE;
        self.bytes[base..base + PAGE_SIZE].fill(byte);
    }

    /// Copy the full contents of the page at `src` into the page at
    /// `dst`.
    pub fn copy_page(&mut self, dst: PhysAddr, src: PhysAddr) {
        let s = src.page_index() * PAGE_SIZE;
        let d = dst.page_index() * PAGE_SIZE;
        self.bytes.copy_within(s..s + PAGE_SIZE, d);
    }

    #[must_use]
    pub fn read_byte(&self, at: PhysAddr) -> u8 {
        self.bytes[at.as_usize()]
    }

    pub fn write_byte(&mut self, at: PhysAddr, value: u8) {
        self.bytes[at.as_usize()] = value;
    }

    /// Copy `src` into the arena starting at `at`.
    pub fn write(&mut self, at: PhysAddr, src: &[u8]) {
        let base = at.as_usize();
        self.bytes[base..base + src.len()].copy_from_slice(src);
    }

    pub(crate) fn read_u64(&self, at: PhysAddr) -> u64 {
        let base = at.as_usize();
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.bytes[base..base + 8]);
        u64::from_le_bytes(raw)
    }

    pub(crate) fn write_u64(&mut self, at: PhysAddr, value: u64) {
        let base = at.as_usize();
        self.bytes[base..base + 8].copy_from_slice(&value.to_le_bytes());
    }
}

impl Default for PhysMemory {
    fn default() -> Self {
        Self::new()
    }
}
