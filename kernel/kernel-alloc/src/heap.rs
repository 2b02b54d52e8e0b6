//! # Kernel Heap
//!
//! Byte-granular allocator behind `kmalloc`. The heap carves objects out of
//! a single large window obtained from the region allocator once at boot;
//! after that it never talks to the lower layers again.
//!
//! Every block is laid out as
//!
//! ```text
//! +--------+-----------------------+--------+
//! | header |       content         | footer |
//! +--------+-----------------------+--------+
//! ```
//!
//! with the footer mirroring the header's size, so the block physically
//! before any block can be found by reading the footer just below it.
//! Free blocks reuse their own content area for the free-list node, which
//! is why the minimum content size is the size of that node.
//!
//! The free list is doubly linked, most-recently-freed first; allocation
//! searches it first-fit and only grows the heap (bumping `end` towards
//! `max`) when nothing on the list fits. Freeing coalesces with the
//! physically preceding and following blocks, so adjacent fragments never
//! accumulate.
//!
//! Blocks are addressed by byte offsets into the window rather than raw
//! pointers; every offset is validated against `[0, end)` before it is
//! dereferenced, and the header/footer mirror is a checked invariant in
//! canary builds.
//!
//! Running out of heap is a kernel panic: the heap backs core kernel
//! bookkeeping and there is no graceful degradation once it is gone. Every
//! other failure (lock timeout, bad free) is survivable.

use core::ptr::{self, NonNull};

use kernel_memory_addresses::PAGE_SIZE;
use kernel_paging::PhysMapper;
use kernel_sync::SpinLock;
use log::{error, info};

use crate::MemStats;
use crate::region::{AllocAt, VmEnv, VmError, VmFlags};

/// Lock retry budget; a timeout surfaces as [`HeapError::LockContended`].
const LOCK_RETRIES: u32 = 30;

/// Filler blocks carved for page alignment must have room for their own
/// metadata plus a worthwhile remainder.
const MIN_ALIGN_FILLER: u32 = 0x100;

#[cfg(feature = "canary")]
const CANARY: u16 = 0xCAFE;

/// Free-list link sentinel stored in raw memory.
const NONE: u32 = u32::MAX;

const STATE_USED: u32 = 0;
const STATE_FREE: u32 = 1;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HeapError {
    /// The heap lock could not be taken within the retry budget.
    #[error("heap lock contended")]
    LockContended,
}

/// Block header, directly before the content area.
#[repr(C, align(8))]
#[derive(Clone, Copy)]
struct BlockHeader {
    #[cfg(feature = "canary")]
    canary_head: u16,
    /// Content bytes between header and footer.
    size: u32,
    state: u32,
    #[cfg(feature = "canary")]
    canary_tail: u16,
}

/// Trailing size mirror, directly after the content area.
#[repr(C, align(8))]
#[derive(Clone, Copy)]
struct BlockFooter {
    size: u32,
}

/// Free-list node, stored inside the content area of free blocks. Links are
/// header offsets, [`NONE`] when absent.
#[repr(C, align(8))]
#[derive(Clone, Copy)]
struct FreeNode {
    #[cfg(feature = "canary")]
    canary_head: u16,
    prev: u32,
    next: u32,
    #[cfg(feature = "canary")]
    canary_tail: u16,
}

const HDR: u32 = size_of::<BlockHeader>() as u32;
const FTR: u32 = size_of::<BlockFooter>() as u32;
const MIN_CONTENT: u32 = size_of::<FreeNode>() as u32;

/// Header + content + footer.
const fn full_size(content: u32) -> u32 {
    HDR + content + FTR
}

const fn align8(v: usize) -> usize {
    (v + 7) & !7
}

struct Heap {
    /// Window base; all block offsets are relative to this.
    base: *mut u8,
    /// Bump boundary: offsets at or beyond this were never handed out.
    end: u32,
    /// Window size; growing past this is fatal.
    max: u32,
    /// Most recently freed block (header offset).
    last_free: Option<u32>,
}

// Safety: the raw window pointer is only touched under the heap lock.
unsafe impl Send for Heap {}

impl Heap {
    #[inline]
    fn header_ptr(&self, off: u32) -> *mut BlockHeader {
        unsafe { self.base.add(off as usize).cast() }
    }

    #[inline]
    fn header(&self, off: u32) -> BlockHeader {
        unsafe { self.header_ptr(off).read() }
    }

    #[inline]
    fn content_ptr(&self, off: u32) -> *mut u8 {
        unsafe { self.base.add((off + HDR) as usize) }
    }

    #[inline]
    fn node_ptr(&self, off: u32) -> *mut FreeNode {
        self.content_ptr(off).cast()
    }

    #[inline]
    fn node(&self, off: u32) -> FreeNode {
        unsafe { self.node_ptr(off).read() }
    }

    /// Write the size into header and footer, keeping the state field.
    fn set_block(&mut self, off: u32, size: u32) {
        let hp = self.header_ptr(off);
        unsafe {
            (*hp).size = size;
            #[cfg(feature = "canary")]
            {
                (*hp).canary_head = CANARY;
                (*hp).canary_tail = CANARY;
            }
            let fp: *mut BlockFooter = self.base.add((off + HDR + size) as usize).cast();
            (*fp).size = size;
        }
    }

    fn set_state(&mut self, off: u32, state: u32) {
        unsafe { (*self.header_ptr(off)).state = state };
    }

    /// Offset of the block after `off`, given `off`'s content size.
    const fn next_off(off: u32, size: u32) -> u32 {
        off + full_size(size)
    }

    /// Offset of the block physically before `off`, via the footer mirror.
    fn prev_off(&self, off: u32) -> Option<u32> {
        if off == 0 {
            return None;
        }
        let fp: *const BlockFooter = unsafe { self.base.add((off - FTR) as usize).cast() };
        let prev_size = unsafe { (*fp).size };
        Some(off - FTR - prev_size - HDR)
    }

    fn push_free(&mut self, off: u32) {
        let prev = self.last_free.unwrap_or(NONE);
        unsafe {
            let np = self.node_ptr(off);
            (*np).prev = prev;
            (*np).next = NONE;
            #[cfg(feature = "canary")]
            {
                (*np).canary_head = CANARY;
                (*np).canary_tail = CANARY;
            }
        }
        if let Some(tail) = self.last_free {
            unsafe { (*self.node_ptr(tail)).next = off };
        }
        self.last_free = Some(off);
    }

    fn unlink_free(&mut self, off: u32) {
        let node = self.node(off);
        if node.next != NONE {
            unsafe { (*self.node_ptr(node.next)).prev = node.prev };
        }
        if node.prev != NONE {
            unsafe { (*self.node_ptr(node.prev)).next = node.next };
        }
        if self.last_free == Some(off) {
            self.last_free = if node.prev == NONE {
                None
            } else {
                Some(node.prev)
            };
        }
    }

    /// Return a block to the free list, absorbing free physical neighbors.
    ///
    /// If the preceding block is free the block is merged into it instead of
    /// becoming a new list node; afterwards a free following block is merged
    /// in and unlinked. Returns the offset of the surviving block.
    fn free_block(&mut self, off: u32) -> u32 {
        self.check_block(off);
        let size = self.header(off).size;

        let merged = match self.prev_off(off) {
            Some(prev) if self.header(prev).state == STATE_FREE => {
                let prev_size = self.header(prev).size;
                self.set_block(prev, prev_size + full_size(size));
                prev
            }
            _ => {
                self.set_state(off, STATE_FREE);
                self.push_free(off);
                off
            }
        };

        let merged_size = self.header(merged).size;
        let next = Self::next_off(merged, merged_size);
        if next < self.end && self.header(next).state == STATE_FREE {
            let next_size = self.header(next).size;
            self.unlink_free(next);
            self.set_block(merged, merged_size + full_size(next_size));
        }
        merged
    }

    /// Split `off` so its content shrinks to `size`; the remainder becomes a
    /// fresh block. `None` if the remainder would be smaller than a minimal
    /// block.
    fn split_block(&mut self, off: u32, size: u32) -> Option<u32> {
        let orig = self.header(off).size;
        if orig < size + HDR + FTR + MIN_CONTENT {
            return None;
        }
        self.set_block(off, size);
        let new = Self::next_off(off, size);
        self.set_block(new, orig - size - HDR - FTR);
        Some(new)
    }

    /// Bytes between the content of a block at `off` and the next page
    /// boundary. Zero when already aligned; bumped by a whole page when the
    /// gap is too small to hold the filler block's metadata.
    fn alignment_offset(&self, off: u32) -> u32 {
        let content = self.base as usize + (off + HDR) as usize;
        let misalign = content % PAGE_SIZE as usize;
        if misalign == 0 {
            return 0;
        }
        let mut offset = (PAGE_SIZE as usize - misalign) as u32;
        if offset < MIN_ALIGN_FILLER {
            offset += PAGE_SIZE;
        }
        offset
    }

    /// First-fit search of the free list, newest first. For aligned
    /// requests the candidate must also have room for the filler block
    /// carved out in front of the aligned result.
    fn find_free_block(&mut self, size: u32, aligned: bool) -> Option<u32> {
        let mut cur = self.last_free;
        while let Some(off) = cur {
            self.check_block(off);
            let header = self.header(off);
            cur = match self.node(off).prev {
                NONE => None,
                p => Some(p),
            };

            if header.state != STATE_FREE {
                error!("heap: non-free block on the free list");
                continue;
            }

            let mut needed = size;
            let mut align_off = 0;
            if aligned {
                align_off = self.alignment_offset(off);
                needed = size + align_off + HDR + FTR;
            }

            if header.size >= needed {
                self.unlink_free(off);
                if let Some(rest) = self.split_block(off, size + align_off) {
                    // Claim before freeing the remainder so it cannot merge
                    // back into us.
                    self.set_state(off, STATE_USED);
                    self.free_block(rest);
                }
                return Some(off);
            }
        }
        None
    }

    #[cfg(feature = "canary")]
    fn check_block(&self, off: u32) {
        assert!(
            off + full_size(0) <= self.end,
            "heap: block {off:#x} out of bounds"
        );
        let header = self.header(off);
        assert!(
            header.canary_head == CANARY && header.canary_tail == CANARY,
            "heap: header canary smashed at {off:#x}"
        );
        let fp: *const BlockFooter =
            unsafe { self.base.add((off + HDR + header.size) as usize).cast() };
        let footer_size = unsafe { (*fp).size };
        assert!(
            header.size == footer_size,
            "heap: header/footer size mismatch at {off:#x} ({} != {})",
            header.size,
            footer_size,
        );
        if header.state == STATE_FREE {
            let node = self.node(off);
            assert!(
                node.canary_head == CANARY && node.canary_tail == CANARY,
                "heap: free node canary smashed at {off:#x}"
            );
        }
    }

    #[cfg(not(feature = "canary"))]
    fn check_block(&self, _off: u32) {}
}

/// The kernel `malloc`.
///
/// Constructed empty (`const`), pointed at its window once at boot via
/// [`init`](Self::init), then shared freely: all state sits behind one spin
/// lock.
pub struct KernelHeap {
    inner: SpinLock<Heap>,
}

impl KernelHeap {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(Heap {
                base: ptr::null_mut(),
                end: 0,
                max: 0,
                last_free: None,
            }),
        }
    }

    /// Point the heap at its backing window.
    ///
    /// # Safety
    /// `window .. window + size` must be mapped, writable, exclusive to the
    /// heap, and page-aligned. Must be called exactly once, before any
    /// allocation.
    pub unsafe fn init(&self, window: NonNull<u8>, size: usize) {
        let mut heap = self.inner.lock();
        if !heap.base.is_null() {
            error!("heap: double init ignored");
            return;
        }
        heap.base = window.as_ptr();
        heap.end = 0;
        heap.max = size as u32;
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        !self.inner.lock().base.is_null()
    }

    /// Claim the heap arena from the kernel address space and initialize.
    ///
    /// This is the single boot-time contact between the heap and the layers
    /// below it; afterwards the heap never calls back down.
    ///
    /// # Errors
    /// Any region-allocation failure. The heap stays uninitialized in that
    /// case, which is fatal for the kernel; the caller decides how loudly.
    pub fn init_from_region<M: PhysMapper>(
        &self,
        env: &VmEnv<'_, M>,
        pages: usize,
    ) -> Result<(), VmError> {
        let arena = env.kernel.alloc(
            env,
            pages,
            AllocAt::Anywhere,
            None,
            VmFlags::new().with_writable(true),
        )?;
        let Some(phys) = arena.phys() else {
            debug_assert!(false, "fresh allocation without physical base");
            return Err(VmError::ShardedSource);
        };
        // Mapper contract: valid, non-null pointers for mapped frames.
        let window = unsafe { NonNull::new_unchecked(env.mapper.phys_to_ptr(phys)) };
        unsafe { self.init(window, arena.size() as usize) };
        info!(
            "heap: allocating from {} - {}",
            arena.addr(),
            arena.addr() + arena.size()
        );
        Ok(())
    }

    /// Allocate `size` bytes; `aligned` places the content on a page
    /// boundary, `zero` wipes it.
    ///
    /// Panics when the request cannot be satisfied within the window (heap
    /// exhaustion has no recovery path) and when called before
    /// [`init`](Self::init).
    ///
    /// # Errors
    /// [`HeapError::LockContended`] when the heap lock cannot be taken; the
    /// caller may retry.
    pub fn alloc(&self, size: usize, aligned: bool, zero: bool) -> Result<NonNull<u8>, HeapError> {
        let content = align8(size).max(MIN_CONTENT as usize) as u32;

        let result = {
            let mut heap = self
                .inner
                .try_lock_for(LOCK_RETRIES)
                .ok_or(HeapError::LockContended)?;
            assert!(!heap.base.is_null(), "heap: allocation before init");

            let mut found = heap.find_free_block(content, aligned);
            let align_off = if aligned {
                heap.alignment_offset(found.unwrap_or(heap.end))
            } else {
                0
            };

            let mut off = match found.take() {
                Some(off) => off,
                None => {
                    // Nothing on the list fits: grow at the bump boundary.
                    let grown = content + align_off;
                    let off = heap.end;
                    assert!(
                        off.checked_add(full_size(grown))
                            .is_some_and(|new_end| new_end <= heap.max),
                        "kmalloc: out of memory"
                    );
                    heap.end = off + full_size(grown);
                    heap.set_block(off, grown);
                    heap.set_state(off, STATE_USED);
                    off
                }
            };

            if aligned && align_off > 0 {
                // Carve the filler in front of the aligned result and hand
                // it back to the free list.
                if let Some(result) = heap.split_block(off, align_off - HDR - FTR) {
                    heap.set_state(result, STATE_USED);
                    heap.free_block(off);
                    off = result;
                }
            }

            heap.set_state(off, STATE_USED);
            heap.check_block(off);
            heap.content_ptr(off)
        };

        if zero {
            unsafe { ptr::write_bytes(result, 0, size) };
        }
        // The content pointer is derived from a NonNull window base.
        Ok(unsafe { NonNull::new_unchecked(result) })
    }

    /// Release an allocation.
    ///
    /// A pointer the heap never handed out (outside the window, or
    /// pointing at a block that is already free) is logged and ignored
    /// rather than corrupting the block structure.
    pub fn free(&self, block: NonNull<u8>) {
        let Some(mut heap) = self.inner.try_lock_for(LOCK_RETRIES) else {
            error!("heap: lock contended on free, leaking block");
            return;
        };

        let addr = block.as_ptr() as usize;
        let window = heap.base as usize;
        let Some(content_off) = addr.checked_sub(window) else {
            error!("heap: attempt to free foreign pointer");
            return;
        };
        if heap.base.is_null()
            || content_off < HDR as usize
            || content_off >= heap.end as usize
        {
            error!("heap: attempt to free invalid block");
            return;
        }
        let off = (content_off - HDR as usize) as u32;
        if heap.header(off).state != STATE_USED {
            error!("heap: attempt to free unallocated block");
            return;
        }
        heap.free_block(off);
    }

    /// Window size and bytes currently tied up in blocks (metadata
    /// included).
    #[must_use]
    pub fn stats(&self) -> MemStats {
        let heap = self.inner.lock();
        let mut used = u64::from(heap.end);
        let mut cur = heap.last_free;
        while let Some(off) = cur {
            used -= u64::from(heap.header(off).size);
            cur = match heap.node(off).prev {
                NONE => None,
                p => Some(p),
            };
        }
        MemStats {
            total: u64::from(heap.max),
            used,
        }
    }
}

impl Default for KernelHeap {
    fn default() -> Self {
        Self::new()
    }
}
