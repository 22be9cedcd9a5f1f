//! Page table manager.
//!
//! Four-level tables stored inside arena pages allocated from the
//! physical page allocator. Each table is one page of 512 little-endian
//! `u64` entries: a physical page address plus permission bits.
//!
//! The copy-on-write mark lives in an ignored bit of the entry, so the
//! hardware treats a pending page as read-only and the write fault
//! reaches the kernel.

use alloc::vec::Vec;
use bitflags::bitflags;
use kestrel_error::define_kernel_error;

use super::layout::{MEMSIZE_VIRTUAL, PAGE_SIZE};
use super::phys::{AllocError, PhysMemory};
use super::{PhysAddr, VirtAddr};

bitflags! {
    /// Page table entry permission bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PtePerm: u64 {
        /// Entry maps a page.
        const PRESENT = 1 << 0;
        /// Page may be written.
        const WRITABLE = 1 << 1;
        /// Page is accessible from user mode.
        const USER = 1 << 2;
        /// Copy-on-write pending: shared read-only until written.
        const COW = 1 << 9;
    }
}

impl PtePerm {
    /// Present, writable, user-accessible. The permission set of a page
    /// a process fully owns.
    pub const RWU: PtePerm = PtePerm::PRESENT
        .union(PtePerm::WRITABLE)
        .union(PtePerm::USER);

    /// Present, user-accessible, copy-on-write pending.
    pub const COW_USER: PtePerm = PtePerm::PRESENT.union(PtePerm::USER).union(PtePerm::COW);
}

define_kernel_error! {
    /// Mapping errors.
    pub enum MapError(0x02) {
        /// No physical page for an intermediate table-structure page.
        OutOfMemory = 0x01 => "no physical page for table structure",
        /// Virtual or physical address not page-aligned.
        Misaligned = 0x02 => "address not page-aligned",
        /// Virtual address outside the mapped space.
        OutOfRange = 0x03 => "virtual address outside the address space",
    }
}

const ENTRY_COUNT: usize = PAGE_SIZE / 8;
const ENTRY_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;
/// Depth of the leaf level; the root is depth 0.
const LEAF_DEPTH: usize = 3;

/// One present leaf mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub va: VirtAddr,
    pub pa: PhysAddr,
    pub perm: PtePerm,
}

impl Mapping {
    #[must_use]
    pub fn user(&self) -> bool {
        self.perm.contains(PtePerm::USER)
    }

    #[must_use]
    pub fn writable(&self) -> bool {
        self.perm.contains(PtePerm::WRITABLE)
    }

    #[must_use]
    pub fn cow(&self) -> bool {
        self.perm.contains(PtePerm::COW)
    }
}

/// Index into the table at `depth` for `va`.
fn table_index(va: VirtAddr, depth: usize) -> usize {
    (va.as_usize() >> (39 - 9 * depth)) & (ENTRY_COUNT - 1)
}

fn entry_at(mem: &PhysMemory, table: PhysAddr, index: usize) -> u64 {
    mem.read_u64(table.offset(index * 8))
}

fn set_entry(mem: &mut PhysMemory, table: PhysAddr, index: usize, entry: u64) {
    mem.write_u64(table.offset(index * 8), entry);
}

fn entry_addr(entry: u64) -> PhysAddr {
    PhysAddr::new((entry & ENTRY_ADDR_MASK) as usize)
}

/// Allocate a zero-filled root (or any other) table page.
pub fn alloc_table(mem: &mut PhysMemory) -> Result<PhysAddr, AllocError> {
    let pa = mem.alloc_page()?;
    mem.fill_page(pa, 0);
    Ok(pa)
}

/// Install or replace the leaf entry mapping `va` to `pa` with `perm`,
/// allocating intermediate table-structure pages on demand.
///
/// On exhaustion mid-walk the already-built intermediate structure stays
/// allocated; the table remains well-defined and the structure is
/// reclaimed by process teardown.
pub fn try_map(
    mem: &mut PhysMemory,
    root: PhysAddr,
    va: VirtAddr,
    pa: PhysAddr,
    perm: PtePerm,
) -> Result<(), MapError> {
    if !va.is_page_aligned() || !pa.is_page_aligned() {
        return Err(MapError::Misaligned);
    }
    if va.as_usize() >= MEMSIZE_VIRTUAL {
        return Err(MapError::OutOfRange);
    }

    let mut table = root;
    for depth in 0..LEAF_DEPTH {
        let index = table_index(va, depth);
        let entry = entry_at(mem, table, index);
        if entry & PtePerm::PRESENT.bits() == 0 {
            let fresh = alloc_table(mem).map_err(|_| MapError::OutOfMemory)?;
            // Intermediate entries carry the widest permissions; the
            // leaf entry decides what an access may do.
            set_entry(
                mem,
                table,
                index,
                fresh.as_usize() as u64 | PtePerm::RWU.bits(),
            );
            table = fresh;
        } else {
            table = entry_addr(entry);
        }
    }

    let index = table_index(va, LEAF_DEPTH);
    set_entry(mem, table, index, pa.as_usize() as u64 | perm.bits());
    Ok(())
}

/// The present leaf mapping for the page containing `va`, if any.
#[must_use]
pub fn lookup(mem: &PhysMemory, root: PhysAddr, va: VirtAddr) -> Option<Mapping> {
    let va = va.page_down();
    if va.as_usize() >= MEMSIZE_VIRTUAL {
        return None;
    }
    let mut table = root;
    for depth in 0..LEAF_DEPTH {
        let entry = entry_at(mem, table, table_index(va, depth));
        if entry & PtePerm::PRESENT.bits() == 0 {
            return None;
        }
        table = entry_addr(entry);
    }
    let entry = entry_at(mem, table, table_index(va, LEAF_DEPTH));
    if entry & PtePerm::PRESENT.bits() == 0 {
        return None;
    }
    Some(Mapping {
        va,
        pa: entry_addr(entry),
        perm: PtePerm::from_bits_truncate(entry),
    })
}

/// Forward iterator over the present leaf mappings in a virtual range.
pub struct VmIter<'a> {
    mem: &'a PhysMemory,
    root: PhysAddr,
    next: usize,
    end: usize,
}

impl<'a> VmIter<'a> {
    #[must_use]
    pub fn new(mem: &'a PhysMemory, root: PhysAddr, range: core::ops::Range<usize>) -> Self {
        Self {
            mem,
            root,
            next: range.start & !(PAGE_SIZE - 1),
            end: range.end.min(MEMSIZE_VIRTUAL),
        }
    }
}

impl Iterator for VmIter<'_> {
    type Item = Mapping;

    fn next(&mut self) -> Option<Mapping> {
        while self.next < self.end {
            let va = VirtAddr::new(self.next);
            self.next += PAGE_SIZE;
            if let Some(mapping) = lookup(self.mem, self.root, va) {
                return Some(mapping);
            }
        }
        None
    }
}

/// Iterator over the table-structure pages below a root, for teardown.
/// The root itself is not yielded; parents come before their children.
pub struct PtIter<'a> {
    mem: &'a PhysMemory,
    // (table page, next entry index, depth of that table)
    stack: Vec<(PhysAddr, usize, usize)>,
}

impl<'a> PtIter<'a> {
    #[must_use]
    pub fn new(mem: &'a PhysMemory, root: PhysAddr) -> Self {
        Self {
            mem,
            stack: alloc::vec![(root, 0, 0)],
        }
    }
}

impl Iterator for PtIter<'_> {
    type Item = PhysAddr;

    fn next(&mut self) -> Option<PhysAddr> {
        loop {
            let (table, index, depth) = *self.stack.last()?;
            let mut index = index;
            while index < ENTRY_COUNT {
                let entry = entry_at(self.mem, table, index);
                index += 1;
                if entry & PtePerm::PRESENT.bits() != 0 {
                    if let Some(top) = self.stack.last_mut() {
                        top.1 = index;
                    }
                    let child = entry_addr(entry);
                    // Children of leaf-level tables are data pages, not
                    // structure pages.
                    if depth + 1 < LEAF_DEPTH {
                        self.stack.push((child, 0, depth + 1));
                    }
                    return Some(child);
                }
            }
            self.stack.pop();
        }
    }
}
