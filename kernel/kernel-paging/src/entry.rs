//! # Page Directory / Page Table Entries
//!
//! On i386 the directory entry (PDE) and table entry (PTE) share one 32-bit
//! layout, so a single [`PageEntry`] type serves both levels. A present
//! directory entry points at a page table frame; a present table entry maps
//! a 4 KiB leaf frame.

use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalPage;

/// Software view of the permissions a mapping should carry, independent of
/// the hardware bit layout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PageAccess {
    /// Writes allowed through this mapping.
    pub writable: bool,
    /// User-mode (CPL 3) access allowed.
    pub user: bool,
}

impl PageAccess {
    /// Kernel read/write, no user access.
    #[must_use]
    pub const fn kernel_rw() -> Self {
        Self {
            writable: true,
            user: false,
        }
    }
}

/// One 32-bit paging entry (PDE or PTE).
///
/// | Bits  | Name | Meaning |
/// |-------|------|---------|
/// | 0     | `P`  | Present |
/// | 1     | `RW` | Writable |
/// | 2     | `US` | User-mode accessible |
/// | 3     | `PWT`| Write-through caching |
/// | 4     | `PCD`| Caching disabled |
/// | 5     | `A`  | Accessed |
/// | 6     | `D`  | Dirty (leaf only) |
/// | 7     | `PS` | Large page (unused here, always 0) |
/// | 8     | `G`  | Global (leaf only) |
/// | 9-11  | —    | Available to the OS |
/// | 12-31 | addr | Frame number of the target frame/table |
#[bitfield(u32)]
pub struct PageEntry {
    pub present: bool,
    pub writable: bool,
    pub user_access: bool,
    pub write_through: bool,
    pub cache_disabled: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub large_page: bool,
    pub global: bool,
    #[bits(3)]
    __: u8,
    #[bits(20)]
    frame: u32,
}

impl PageEntry {
    /// A present directory entry pointing at the page table in `table`.
    ///
    /// Directory entries are always RW+user; the effective permissions are
    /// enforced at the leaf.
    #[must_use]
    pub fn table(table: PhysicalPage) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(true)
            .with_frame(table.number() as u32)
    }

    /// A present 4 KiB leaf entry mapping `page` with `access`.
    #[must_use]
    pub fn leaf(page: PhysicalPage, access: PageAccess) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(access.writable)
            .with_user_access(access.user)
            .with_frame(page.number() as u32)
    }

    /// The frame this entry points at (table frame for a PDE, mapped frame
    /// for a PTE). Only meaningful while `present`.
    #[must_use]
    pub fn physical_page(&self) -> PhysicalPage {
        PhysicalPage::from_number(self.frame() as usize)
    }
}
