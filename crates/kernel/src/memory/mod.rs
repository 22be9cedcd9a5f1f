//! Physical and virtual memory management.
//!
//! Physical memory is an owned byte arena indexed by typed addresses; the
//! page allocator tracks one record per physical page and page tables live
//! inside arena pages allocated from it. Raw pointers never appear: the
//! lowest hardware-access layer (outside this crate) is the only place an
//! address becomes a pointer.

pub mod page_table;
pub mod phys;

/// Fixed memory layout, set at boot and never changed.
pub mod layout {
    /// Size of a physical page, the minimum allocation granularity.
    pub const PAGE_SIZE: usize = 4096;

    /// Total physical memory.
    pub const MEMSIZE_PHYSICAL: usize = 0x20_0000;

    /// Number of physical pages.
    pub const NPAGES: usize = MEMSIZE_PHYSICAL / PAGE_SIZE;

    /// Top of every virtual address space.
    pub const MEMSIZE_VIRTUAL: usize = 0x30_0000;

    /// Start of the process-private region; everything below is the
    /// kernel region, shared read-only (from the process's perspective)
    /// by all address spaces.
    pub const PROC_START_ADDR: usize = 0x10_0000;

    /// Start of the kernel image and kernel stack.
    pub const KERNEL_START_ADDR: usize = 0x4_0000;

    /// End of the kernel image and kernel stack.
    pub const KERNEL_END_ADDR: usize = 0x8_0000;

    /// Start of the memory-mapped I/O hole.
    pub const MMIO_START_ADDR: usize = 0xA_0000;

    /// End of the memory-mapped I/O hole.
    pub const MMIO_END_ADDR: usize = 0x10_0000;

    /// The console page, device memory identity-mapped into every
    /// address space. Never reference-counted.
    pub const CONSOLE_ADDR: usize = 0xB_8000;

    /// Timer interrupt frequency, interrupts per second.
    pub const HZ: u64 = 100;
}

use layout::PAGE_SIZE;

/// A physical address: an index into the physical memory arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysAddr(usize);

impl PhysAddr {
    #[must_use]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Index of the page this address falls in.
    #[must_use]
    pub const fn page_index(self) -> usize {
        self.0 / PAGE_SIZE
    }

    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    /// The address `off` bytes further on.
    #[must_use]
    pub const fn offset(self, off: usize) -> Self {
        Self(self.0 + off)
    }
}

impl core::fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A virtual address in some process's (or the kernel's) address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtAddr(usize);

impl VirtAddr {
    #[must_use]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    /// Round down to the containing page boundary.
    #[must_use]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    /// Offset within the containing page.
    #[must_use]
    pub const fn page_offset(self) -> usize {
        self.0 % PAGE_SIZE
    }
}

impl core::fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
