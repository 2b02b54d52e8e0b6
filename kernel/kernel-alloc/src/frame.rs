//! # Physical Frame Allocator
//!
//! One bitmap over every physical page frame of the machine, built once at
//! boot from the firmware memory map. A set bit means the frame is
//! allocated or unusable; allocation is a strictly first-fit linear scan
//! from frame 0. Physical allocations are infrequent and large-grained, so
//! the scan stays cheap and no per-size free lists are kept.
//!
//! Exhaustion is an ordinary error for most callers (task creation surfaces
//! it as out-of-memory); only kernel-critical bootstrap code escalates it to
//! a panic, and that decision is the caller's.

use kernel_bitmap::{Bitmap, words_for};
use kernel_info::memory::PHYS_PAGE_CAPACITY;
use kernel_info::{KernelImage, MemoryRegion, MemoryRegionKind};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage};
use kernel_sync::SpinLock;
use kernel_sync::spin_lock::DEFAULT_LOCK_RETRIES;
use log::{error, info};

use crate::MemStats;

type FrameBitmap = Bitmap<{ words_for(PHYS_PAGE_CAPACITY) }>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    /// No run of the requested length is free.
    #[error("no run of {0} contiguous free frames")]
    OutOfFrames(usize),
    /// The bitmap lock could not be taken within the retry budget.
    #[error("frame bitmap lock contended")]
    LockContended,
}

/// The machine-wide physical frame allocator.
///
/// Large (the bitmap covers the full 4 GiB frame space inline), so the
/// kernel keeps exactly one in a static. There is no double-free detection;
/// callers of [`free_frames`](Self::free_frames) must own the frames they
/// return.
pub struct FrameAllocator {
    bitmap: SpinLock<FrameBitmap>,
}

impl FrameAllocator {
    /// Build the allocator from the firmware memory map and the kernel
    /// image's own load range, both of which are pre-marked allocated.
    #[must_use]
    pub fn new(map: &[MemoryRegion], kernel: KernelImage) -> Self {
        let mut bitmap = FrameBitmap::new(PHYS_PAGE_CAPACITY);

        info!("frames: hardware memory map:");
        let mut top: u64 = 0;
        for region in map {
            info!("  {region}");
            if region.kind == MemoryRegionKind::Available {
                top = top.max(region.end());
                continue;
            }
            // Mark every frame the region touches, including partial ones.
            let first = (region.start / u64::from(PAGE_SIZE)) as usize;
            let last = region.end().div_ceil(u64::from(PAGE_SIZE)) as usize;
            let last = last.min(PHYS_PAGE_CAPACITY);
            if first < last {
                bitmap.set_run(first, last - first);
            }
        }

        // Leave lower memory and the kernel image alone.
        bitmap.set_run(0, kernel.reserved_frames());
        info!("frames: kernel resides at {} - {}", kernel.start, kernel.end);

        let frames = ((top / u64::from(PAGE_SIZE)) as usize).min(PHYS_PAGE_CAPACITY);
        bitmap.set_len(frames);

        let used = bitmap.count_set();
        info!(
            "frames: ready, {} MiB, {} frames, {} used, {} free",
            (frames * PAGE_SIZE as usize) / (1024 * 1024),
            frames,
            used,
            frames - used
        );

        Self {
            bitmap: SpinLock::new(bitmap),
        }
    }

    /// Allocate `count` physically contiguous frames (first-fit).
    ///
    /// # Errors
    /// [`FrameError::OutOfFrames`] if no run of that length is clear; the
    /// bitmap is left untouched. [`FrameError::LockContended`] on lock
    /// timeout.
    pub fn alloc_frames(&self, count: usize) -> Result<PhysicalAddress, FrameError> {
        let mut bitmap = self
            .bitmap
            .try_lock_for(DEFAULT_LOCK_RETRIES)
            .ok_or(FrameError::LockContended)?;
        let frame = bitmap
            .find_clear_run(0, count)
            .ok_or(FrameError::OutOfFrames(count))?;
        bitmap.set_run(frame, count);
        Ok(PhysicalPage::from_number(frame).base())
    }

    /// Return `count` frames starting at `base`.
    ///
    /// The caller must own the frames; a double free silently re-clears the
    /// bits.
    pub fn free_frames(&self, base: PhysicalAddress, count: usize) {
        match self.bitmap.try_lock_for(DEFAULT_LOCK_RETRIES) {
            Some(mut bitmap) => bitmap.clear_run(base.frame_number(), count),
            None => error!("frames: lock contended on free, leaking {count} frames at {base}"),
        }
    }

    #[must_use]
    pub fn stats(&self) -> MemStats {
        let bitmap = self.bitmap.lock();
        MemStats {
            total: bitmap.len() as u64 * u64::from(PAGE_SIZE),
            used: bitmap.count_set() as u64 * u64::from(PAGE_SIZE),
        }
    }
}

impl kernel_paging::FrameAlloc for FrameAllocator {
    fn alloc_frames(&self, count: usize) -> Option<PhysicalAddress> {
        Self::alloc_frames(self, count).ok()
    }

    fn free_frames(&self, base: PhysicalAddress, count: usize) {
        Self::free_frames(self, base, count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_map() -> [MemoryRegion; 3] {
        [
            MemoryRegion::new(0, 0x9_F000, MemoryRegionKind::Available),
            MemoryRegion::new(0x9_F000, 0x6_1000, MemoryRegionKind::Reserved),
            MemoryRegion::new(0x10_0000, 0xF0_0000, MemoryRegionKind::Available),
        ]
    }

    fn image() -> KernelImage {
        KernelImage::new(PhysicalAddress::new(0x10_0000), PhysicalAddress::new(0x14_0000))
    }

    #[test]
    fn skips_reserved_and_kernel_frames() {
        let alloc = FrameAllocator::new(&test_map(), image());
        // Everything below the end of the kernel image is reserved, so the
        // first fit lands right after it.
        let base = alloc.alloc_frames(4).unwrap();
        assert_eq!(base, PhysicalAddress::new(0x14_0000));
    }

    #[test]
    fn first_fit_reuses_freed_run() {
        let alloc = FrameAllocator::new(&test_map(), image());
        let a = alloc.alloc_frames(2).unwrap();
        let b = alloc.alloc_frames(2).unwrap();
        assert_eq!(b, a + 2 * PAGE_SIZE);
        alloc.free_frames(a, 2);
        assert_eq!(alloc.alloc_frames(1).unwrap(), a);
    }

    #[test]
    fn exhaustion_leaves_bitmap_unchanged() {
        let alloc = FrameAllocator::new(&test_map(), image());
        let before = alloc.stats();
        let err = alloc.alloc_frames(PHYS_PAGE_CAPACITY).unwrap_err();
        assert_eq!(err, FrameError::OutOfFrames(PHYS_PAGE_CAPACITY));
        assert_eq!(alloc.stats(), before);
    }

    #[test]
    fn stats_track_allocation() {
        let alloc = FrameAllocator::new(&test_map(), image());
        let before = alloc.stats();
        let base = alloc.alloc_frames(8).unwrap();
        let after = alloc.stats();
        assert_eq!(after.used, before.used + 8 * u64::from(PAGE_SIZE));
        assert_eq!(after.total, before.total);
        alloc.free_frames(base, 8);
        assert_eq!(alloc.stats(), before);
    }

    #[test]
    fn total_covers_available_memory_only() {
        let alloc = FrameAllocator::new(&test_map(), image());
        assert_eq!(alloc.stats().total, 0x100_0000);
    }
}
