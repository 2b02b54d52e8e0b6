//! # Per-Address-Space Page Table Tree
//!
//! [`PageMap`] owns the directory frame and every table frame of one
//! address space. It is a pure `(virtual, physical, size, access)` →
//! hardware-entry function; it never inspects allocator bookkeeping.

use crate::table::{DirIndex, ENTRIES_PER_TABLE, PageTable, TableIndex};
use crate::{FrameAlloc, PageAccess, PageEntry, PhysMapper};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage, VirtualAddress};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MapError {
    /// No frame left for an intermediate page table.
    #[error("out of physical memory for page tables")]
    OutOfMemory,
}

/// The page-table tree of one address space.
///
/// Holds only the physical address of the directory frame; every access to
/// the tree goes through a [`PhysMapper`]. Dropping a `PageMap` does *not*
/// free its frames: teardown needs the frame allocator and is explicit via
/// [`destroy`](Self::destroy).
pub struct PageMap {
    root: PhysicalPage,
}

impl PageMap {
    /// Allocate and zero a directory frame.
    pub fn new<M: PhysMapper, A: FrameAlloc>(mapper: &M, frames: &A) -> Result<Self, MapError> {
        let root = alloc_table(mapper, frames)?;
        Ok(Self { root })
    }

    /// Physical address of the directory, the value loaded into CR3 when
    /// this address space is activated.
    #[must_use]
    pub const fn root(&self) -> PhysicalPage {
        self.root
    }

    /// Install entries for every page of `[virt, virt + size)`, mapping it
    /// to `[phys, phys + size)` with `access`.
    ///
    /// Intermediate tables are allocated (zero-filled) on demand. Re-mapping
    /// a page overwrites its entry, so the call is idempotent per page.
    /// `size` is rounded up to whole pages; `virt` and `phys` are aligned
    /// down, as the hardware only knows page-granular mappings.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] when a table frame cannot be allocated.
    /// Entries installed before the failure remain installed.
    pub fn set_range<M: PhysMapper, A: FrameAlloc>(
        &mut self,
        mapper: &M,
        frames: &A,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        size: u32,
        access: PageAccess,
    ) -> Result<(), MapError> {
        let virt = virt.page();
        let phys = phys.page();
        let pages = kernel_memory_addresses::pages_spanned(size);

        for n in 0..pages {
            let va = virt.add_pages(n).base();
            let dir = unsafe { table_at(mapper, self.root) };
            let slot = DirIndex::of(va).as_usize();
            let de = dir.get(slot);
            let table_page = if de.present() {
                de.physical_page()
            } else {
                let tp = alloc_table(mapper, frames)?;
                dir.set(slot, PageEntry::table(tp));
                tp
            };

            let table = unsafe { table_at(mapper, table_page) };
            table.set(
                TableIndex::of(va).as_usize(),
                PageEntry::leaf(phys.add_pages(n), access),
            );
            invalidate_tlb_page(va);
        }
        Ok(())
    }

    /// Mark every page of `[virt, virt + size)` not-present.
    ///
    /// Intermediate tables are kept; pages whose table was never allocated
    /// are skipped.
    pub fn clear_range<M: PhysMapper>(&mut self, mapper: &M, virt: VirtualAddress, size: u32) {
        let virt = virt.page();
        for n in 0..kernel_memory_addresses::pages_spanned(size) {
            let va = virt.add_pages(n).base();
            let dir = unsafe { table_at(mapper, self.root) };
            let de = dir.get(DirIndex::of(va).as_usize());
            if !de.present() {
                continue;
            }
            let table = unsafe { table_at(mapper, de.physical_page()) };
            table.set(TableIndex::of(va).as_usize(), PageEntry::new());
            invalidate_tlb_page(va);
        }
    }

    /// Resolve `va` to the physical address it maps to, preserving the
    /// in-page offset. `None` if the page is not present.
    #[must_use]
    pub fn translate<M: PhysMapper>(&self, mapper: &M, va: VirtualAddress) -> Option<PhysicalAddress> {
        let dir = unsafe { table_at(mapper, self.root) };
        let de = dir.get(DirIndex::of(va).as_usize());
        if !de.present() {
            return None;
        }
        let table = unsafe { table_at(mapper, de.physical_page()) };
        let pte = table.get(TableIndex::of(va).as_usize());
        if !pte.present() {
            return None;
        }
        Some(pte.physical_page().base() + va.page_offset())
    }

    /// Return every table frame and the directory frame to the allocator.
    pub fn destroy<M: PhysMapper, A: FrameAlloc>(self, mapper: &M, frames: &A) {
        let dir = unsafe { table_at(mapper, self.root) };
        for i in 0..ENTRIES_PER_TABLE {
            let de = dir.get(i);
            if de.present() {
                frames.free_frames(de.physical_page().base(), 1);
            }
        }
        frames.free_frames(self.root.base(), 1);
    }
}

/// Borrow the table stored in `page` through the mapper.
///
/// # Safety
/// `page` must hold a live page table exclusively owned by the calling
/// `PageMap`; the borrow must not outlive that ownership.
unsafe fn table_at<'a, M: PhysMapper>(mapper: &M, page: PhysicalPage) -> &'a mut PageTable {
    unsafe { mapper.phys_to_mut::<PageTable>(page.base()) }
}

fn alloc_table<M: PhysMapper, A: FrameAlloc>(
    mapper: &M,
    frames: &A,
) -> Result<PhysicalPage, MapError> {
    let pa = frames.alloc_frames(1).ok_or(MapError::OutOfMemory)?;
    let page = PhysicalPage::new_aligned(pa);
    unsafe { table_at(mapper, page) }.clear();
    Ok(page)
}

/// Flush one virtual page from the TLB of the executing CPU.
#[inline]
fn invalidate_tlb_page(va: VirtualAddress) {
    #[cfg(target_arch = "x86")]
    unsafe {
        core::arch::asm!("invlpg [{0}]", in(reg) va.as_u32(), options(nostack, preserves_flags));
    }
    #[cfg(not(target_arch = "x86"))]
    let _ = va;
}
