//! # Memory Layout and Boot Memory Map

use core::fmt;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, page_align_up};

/// End of the allocatable virtual address space.
///
/// The top page is left out so that `addr + size` arithmetic on ranges
/// cannot wrap around the 32-bit space.
pub const VM_SPACE_END: u32 = 0xFFFF_F000;

/// Number of virtual pages each address space accounts for.
pub const VM_PAGE_COUNT: usize = (VM_SPACE_END / PAGE_SIZE) as usize;

/// Number of physical frames the frame bitmap can describe (full 4 GiB).
pub const PHYS_PAGE_CAPACITY: usize = 1 << (32 - 12);

/// Size of the kernel heap arena in pages, claimed once at boot.
pub const KERNEL_HEAP_PAGES: usize = 0x6400;

const _: () = {
    assert!(VM_SPACE_END % PAGE_SIZE == 0);
    assert!(VM_PAGE_COUNT <= PHYS_PAGE_CAPACITY);
    assert!(KERNEL_HEAP_PAGES < VM_PAGE_COUNT);
};

/// Classification of a firmware memory-map region.
///
/// Everything except [`Available`](MemoryRegionKind::Available) is pre-marked
/// allocated in the frame bitmap and never handed out.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MemoryRegionKind {
    Available,
    Reserved,
    AcpiReclaimable,
    AcpiNvs,
    Defective,
    Unknown,
}

impl MemoryRegionKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Available => "Available",
            Self::Reserved => "Reserved",
            Self::AcpiReclaimable => "ACPI",
            Self::AcpiNvs => "NVS",
            Self::Defective => "Bad",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for MemoryRegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the firmware physical-memory map.
///
/// Start and length are 64-bit because the firmware reports them that way
/// even on this 32-bit machine; anything beyond the 4 GiB boundary is
/// unaddressable and simply ignored by the consumers.
#[derive(Clone, Copy, Debug)]
pub struct MemoryRegion {
    pub start: u64,
    pub len: u64,
    pub kind: MemoryRegionKind,
}

impl MemoryRegion {
    #[must_use]
    pub const fn new(start: u64, len: u64, kind: MemoryRegionKind) -> Self {
        Self { start, len, kind }
    }

    /// Exclusive end address.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.start.saturating_add(self.len)
    }
}

impl fmt::Display for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#012x} - {:#012x} size {:#012x}  {}",
            self.start,
            self.end().saturating_sub(1),
            self.len,
            self.kind
        )
    }
}

/// Load range of the kernel image itself, reserved at boot so the frame
/// allocator never hands out the pages the kernel is executing from.
#[derive(Clone, Copy, Debug)]
pub struct KernelImage {
    pub start: PhysicalAddress,
    pub end: PhysicalAddress,
}

impl KernelImage {
    #[must_use]
    pub const fn new(start: PhysicalAddress, end: PhysicalAddress) -> Self {
        Self { start, end }
    }

    /// Number of frames from frame 0 up to the end of the image, the
    /// "leave lower memory and the kernel alone" reservation.
    #[must_use]
    pub fn reserved_frames(&self) -> usize {
        (page_align_up(self.end.as_u32()) / PAGE_SIZE) as usize
    }
}
