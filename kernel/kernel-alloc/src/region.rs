//! # Virtual Region Allocator
//!
//! Per-address-space accounting of virtual memory. Each [`AddressSpace`]
//! owns a page bitmap, a table of live allocation records ("ranges") and,
//! lazily, the hardware page-table tree for the space. The kernel's own
//! address space is an ordinary instance, passed around in [`VmEnv`]; the
//! only thing special about it is that cross-context operations use it as
//! the staging area for zeroing and copying, because the target space's
//! mappings are generally not addressable from the allocator's own
//! execution context.
//!
//! Ranges are either *contiguous* (one physical base address) or *sharded*
//! (a chain of per-page mappings), the latter produced by
//! [`AddressSpace::map_from`] when aliasing another space's memory whose
//! physical backing is scattered.
//!
//! Callers receive [`VmAllocation`] value copies. The authoritative record
//! lives in the space's range table; the copy carries a generation-checked
//! id, so a stale handle is detected instead of corrupting the table.
//!
//! ### Invariants
//! - A range's reserved virtual pages are exactly the set bits of its
//!   space's bitmap over that interval; ranges never overlap.
//! - A sharded range has no contiguous physical base, and vice versa.
//!
//! ### Locking
//! Mutating operations take the space's lock with a bounded spin and fail
//! with [`VmError::LockContended`] on timeout; an operation that touches a
//! second space takes the target's lock first, then the other's (a no-op
//! when they are the same space). Read-only queries spin unboundedly; they
//! hold the lock for a few loads only.

use core::ptr;

use bitfield_struct::bitfield;
use kernel_bitmap::{Bitmap, words_for};
use kernel_info::memory::VM_PAGE_COUNT;
use kernel_memory_addresses::{
    PAGE_SIZE, PhysicalAddress, PhysicalPage, VirtualAddress, VirtualPage,
};
use kernel_paging::{PageAccess, PageMap, PhysMapper};
use kernel_sync::spin_lock::DEFAULT_LOCK_RETRIES;
use kernel_sync::{SpinLock, SpinLockGuard};
use log::{debug, error, warn};

use crate::MemStats;
use crate::frame::{FrameAllocator, FrameError};

/// Range records per address space.
pub const MAX_RANGES: usize = 128;

/// Shard records per address space, shared by all of its sharded ranges.
pub const MAX_SHARDS: usize = 1024;

type PageBitmap = Bitmap<{ words_for(VM_PAGE_COUNT) }>;

/// Per-range behavior flags, stored on the range record.
///
/// `writable` and `user` reach the hardware entries; the rest steer the
/// allocator itself.
#[bitfield(u16)]
#[derive(PartialEq, Eq)]
pub struct VmFlags {
    /// Writes allowed through the mapping.
    pub writable: bool,
    /// Readable from user space.
    pub user: bool,
    /// Return the physical backing to the frame allocator when the range is
    /// freed or its space torn down.
    pub free_phys: bool,
    /// Duplicate this range into the child when the owning space is cloned
    /// for fork().
    pub fork_copy: bool,
    /// Zero the memory during allocation.
    pub zero: bool,
    /// Skip the hardware mapping entirely; the range only reserves
    /// addresses.
    pub no_map: bool,
    /// `map_from` only: refuse to alias pages that are not user-accessible
    /// in the source space.
    pub user_only: bool,
    /// `map_from` only: stop at the first unmapped source page instead of
    /// failing (loader workaround for under-allocated images).
    pub tolerate_gaps: bool,
    /// Emit debug traces for operations on this range.
    pub trace: bool,
    #[bits(7)]
    __: u8,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VmError {
    /// No run of free virtual pages of the requested length.
    #[error("virtual address space exhausted")]
    OutOfVirtualSpace,
    #[error(transparent)]
    Frames(#[from] FrameError),
    /// A space lock could not be taken within the retry budget.
    #[error("address space lock contended")]
    LockContended,
    /// Fixed-address allocation over an already reserved page.
    #[error("virtual address {0} already allocated")]
    AddressInUse(VirtualAddress),
    /// The range table of the space is full.
    #[error("too many live ranges")]
    TooManyRanges,
    /// The shard table of the space is full.
    #[error("too many shards")]
    TooManyShards,
    /// Zero-length request.
    #[error("zero-length allocation")]
    ZeroSize,
    /// `map_from` found no mapping behind a source page.
    #[error("source page {0} is not mapped")]
    SourceUnmapped(VirtualAddress),
    /// `map_from` with `user_only` hit a kernel-only source page.
    #[error("source page {0} is not user-accessible")]
    SourceNotUserAccessible(VirtualAddress),
    /// A sharded range was passed to an operation that requires contiguous
    /// physical backing.
    #[error("operation requires contiguous physical backing")]
    ShardedSource,
    /// A stale or foreign [`VmAllocation`] handle.
    #[error("stale range handle")]
    InvalidHandle,
    #[error(transparent)]
    Mapping(#[from] kernel_paging::MapError),
}

/// Everything a region operation needs besides the space itself: the
/// physical access path, the frame allocator, and the kernel address space
/// used as staging area for cross-context work.
pub struct VmEnv<'a, M: PhysMapper> {
    pub mapper: &'a M,
    pub frames: &'a FrameAllocator,
    pub kernel: &'a AddressSpace,
}

impl<M: PhysMapper> VmEnv<'_, M> {
    fn is_kernel(&self, space: &AddressSpace) -> bool {
        ptr::eq(space, self.kernel)
    }
}

/// Placement request for [`AddressSpace::alloc`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocAt {
    /// First fit anywhere in the space.
    Anywhere,
    /// Exactly at this address (aligned down to its page). Fails if any
    /// targeted page is already reserved.
    Fixed(VirtualAddress),
}

/// Generation-checked handle to a range record.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RangeId {
    index: u16,
    generation: u32,
}

/// Caller-held value copy of a range record.
///
/// Reads are free; mutation always goes back through the owning
/// [`AddressSpace`] using the embedded id.
#[derive(Clone, Copy, Debug)]
pub struct VmAllocation {
    id: RangeId,
    addr: VirtualPage,
    pages: usize,
    flags: VmFlags,
    phys: Option<PhysicalPage>,
}

impl VmAllocation {
    /// Base virtual address (page-aligned).
    #[must_use]
    pub const fn addr(&self) -> VirtualAddress {
        self.addr.base()
    }

    /// Size in bytes (a multiple of the page size).
    #[must_use]
    pub const fn size(&self) -> u32 {
        (self.pages as u32) * PAGE_SIZE
    }

    #[must_use]
    pub const fn pages(&self) -> usize {
        self.pages
    }

    #[must_use]
    pub const fn flags(&self) -> VmFlags {
        self.flags
    }

    /// Contiguous physical base, `None` for sharded ranges.
    #[must_use]
    pub const fn phys(&self) -> Option<PhysicalAddress> {
        match self.phys {
            Some(p) => Some(p.base()),
            None => None,
        }
    }

    fn from_range(id: RangeId, range: &Range) -> Self {
        Self {
            id,
            addr: range.addr,
            pages: range.pages,
            flags: range.flags,
            phys: range.phys,
        }
    }
}

/// The authoritative range record.
#[derive(Clone, Copy)]
struct Range {
    addr: VirtualPage,
    pages: usize,
    flags: VmFlags,
    /// Contiguous physical base; `None` when `shards` carries the backing
    /// (or when a gap-tolerant aliasing stopped before mapping anything).
    phys: Option<PhysicalPage>,
    /// Head of this range's shard chain in the space's shard table.
    shards: Option<u16>,
}

impl Range {
    const fn size(&self) -> u32 {
        (self.pages as u32) * PAGE_SIZE
    }

    const fn covers(&self, addr: VirtualAddress) -> bool {
        let base = self.addr.base().as_u32();
        addr.as_u32() >= base && addr.as_u32() - base < self.size()
    }
}

/// One page of a sharded range: a single-page mapping whose physical frame
/// is not contiguous with its neighbors'.
#[derive(Clone, Copy)]
struct Shard {
    addr: VirtualPage,
    phys: PhysicalPage,
    next: Option<u16>,
}

#[derive(Clone, Copy)]
enum RangeSlot {
    Free { next: Option<u16> },
    Used {
        generation: u32,
        prev: Option<u16>,
        next: Option<u16>,
        range: Range,
    },
}

/// Fixed-capacity slab of range records, linked into a most-recent-first
/// live list. Indices are stable for the lifetime of a record, and each
/// occupancy bumps the slot generation so stale ids cannot resolve.
struct RangeTable {
    slots: [RangeSlot; MAX_RANGES],
    free_head: Option<u16>,
    live_head: Option<u16>,
    next_generation: u32,
}

impl RangeTable {
    fn new() -> Self {
        let mut slots = [const { RangeSlot::Free { next: None } }; MAX_RANGES];
        let mut i = MAX_RANGES - 1;
        while i > 0 {
            slots[i - 1] = RangeSlot::Free {
                next: Some(i as u16),
            };
            i -= 1;
        }
        Self {
            slots,
            free_head: Some(0),
            live_head: None,
            next_generation: 1,
        }
    }

    fn insert(&mut self, range: Range) -> Option<RangeId> {
        let index = self.free_head?;
        let RangeSlot::Free { next: free_next } = self.slots[index as usize] else {
            debug_assert!(false, "free list points at a used slot");
            return None;
        };
        self.free_head = free_next;

        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);

        if let Some(head) = self.live_head
            && let RangeSlot::Used { prev, .. } = &mut self.slots[head as usize]
        {
            *prev = Some(index);
        }
        self.slots[index as usize] = RangeSlot::Used {
            generation,
            prev: None,
            next: self.live_head,
            range,
        };
        self.live_head = Some(index);
        Some(RangeId { index, generation })
    }

    /// Unlink and return the record, invalidating every outstanding copy of
    /// the id.
    fn remove(&mut self, id: RangeId) -> Option<Range> {
        let RangeSlot::Used {
            generation,
            prev,
            next,
            range,
        } = self.slots[id.index as usize]
        else {
            return None;
        };
        if generation != id.generation {
            return None;
        }

        match prev {
            Some(p) => {
                if let RangeSlot::Used { next: pn, .. } = &mut self.slots[p as usize] {
                    *pn = next;
                }
            }
            None => self.live_head = next,
        }
        if let Some(n) = next
            && let RangeSlot::Used { prev: np, .. } = &mut self.slots[n as usize]
        {
            *np = prev;
        }

        self.slots[id.index as usize] = RangeSlot::Free {
            next: self.free_head,
        };
        self.free_head = Some(id.index);
        Some(range)
    }

    /// Most recently inserted live record.
    fn head(&self) -> Option<RangeId> {
        let index = self.live_head?;
        match &self.slots[index as usize] {
            RangeSlot::Used { generation, .. } => Some(RangeId {
                index,
                generation: *generation,
            }),
            RangeSlot::Free { .. } => None,
        }
    }

    fn iter(&self) -> RangeIter<'_> {
        RangeIter {
            table: self,
            cur: self.live_head,
        }
    }
}

struct RangeIter<'a> {
    table: &'a RangeTable,
    cur: Option<u16>,
}

impl<'a> Iterator for RangeIter<'a> {
    type Item = (RangeId, &'a Range);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cur?;
        match &self.table.slots[index as usize] {
            RangeSlot::Used {
                generation,
                next,
                range,
                ..
            } => {
                self.cur = *next;
                Some((
                    RangeId {
                        index,
                        generation: *generation,
                    },
                    range,
                ))
            }
            RangeSlot::Free { .. } => {
                debug_assert!(false, "live list points at a free slot");
                None
            }
        }
    }
}

#[derive(Clone, Copy)]
enum ShardSlot {
    Free { next: Option<u16> },
    Used(Shard),
}

/// Fixed-capacity slab of shard records, chained per range by slot index.
struct ShardTable {
    slots: [ShardSlot; MAX_SHARDS],
    free_head: Option<u16>,
}

impl ShardTable {
    fn new() -> Self {
        let mut slots = [const { ShardSlot::Free { next: None } }; MAX_SHARDS];
        let mut i = MAX_SHARDS - 1;
        while i > 0 {
            slots[i - 1] = ShardSlot::Free {
                next: Some(i as u16),
            };
            i -= 1;
        }
        Self {
            slots,
            free_head: Some(0),
        }
    }

    /// Prepend a shard to the chain rooted at `head`.
    fn push(
        &mut self,
        head: &mut Option<u16>,
        addr: VirtualPage,
        phys: PhysicalPage,
    ) -> Result<(), VmError> {
        let index = self.free_head.ok_or(VmError::TooManyShards)?;
        let ShardSlot::Free { next: free_next } = self.slots[index as usize] else {
            debug_assert!(false, "free list points at a used slot");
            return Err(VmError::TooManyShards);
        };
        self.free_head = free_next;
        self.slots[index as usize] = ShardSlot::Used(Shard {
            addr,
            phys,
            next: *head,
        });
        *head = Some(index);
        Ok(())
    }

    /// Walk a chain read-only.
    fn chain(&self, head: Option<u16>) -> ShardIter<'_> {
        ShardIter {
            table: self,
            cur: head,
        }
    }

    /// Dismantle a chain, handing each shard to `f` before its slot is
    /// recycled.
    fn take_chain(&mut self, head: Option<u16>, mut f: impl FnMut(Shard)) {
        let mut cur = head;
        while let Some(index) = cur {
            let ShardSlot::Used(shard) = self.slots[index as usize] else {
                debug_assert!(false, "shard chain points at a free slot");
                return;
            };
            cur = shard.next;
            self.slots[index as usize] = ShardSlot::Free {
                next: self.free_head,
            };
            self.free_head = Some(index);
            f(shard);
        }
    }
}

struct ShardIter<'a> {
    table: &'a ShardTable,
    cur: Option<u16>,
}

impl Iterator for ShardIter<'_> {
    type Item = Shard;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cur?;
        match &self.table.slots[index as usize] {
            ShardSlot::Used(shard) => {
                self.cur = shard.next;
                Some(*shard)
            }
            ShardSlot::Free { .. } => {
                debug_assert!(false, "shard chain points at a free slot");
                None
            }
        }
    }
}

/// Lock-protected interior of an [`AddressSpace`].
struct Space {
    bitmap: PageBitmap,
    ranges: RangeTable,
    shards: ShardTable,
    /// Lazily created on first use; a space without one is valid and simply
    /// has no hardware mapping yet.
    page_map: Option<PageMap>,
}

impl Space {
    fn new() -> Self {
        let mut bitmap = PageBitmap::new(VM_PAGE_COUNT);
        // Never hand out the null page.
        bitmap.set_run(0, 1);
        Self {
            bitmap,
            ranges: RangeTable::new(),
            shards: ShardTable::new(),
            page_map: None,
        }
    }

    /// Reserve `pages` pages of virtual space, either at a fixed spot or
    /// first-fit.
    fn alloc_virt(&mut self, pages: usize, at: AllocAt) -> Result<VirtualPage, VmError> {
        match at {
            AllocAt::Fixed(addr) => {
                let start = addr.page_number();
                for i in 0..pages {
                    if self.bitmap.get(start + i) {
                        let clash = VirtualPage::from_number(start + i).base();
                        error!("vm: duplicate allocation attempt at {clash}");
                        if let Some((_, conflict)) = self.range_covering(clash) {
                            error!(
                                "vm: conflicting range: {} - {}",
                                conflict.addr.base(),
                                conflict.addr.base() + conflict.size()
                            );
                        }
                        return Err(VmError::AddressInUse(addr));
                    }
                }
                self.bitmap.set_run(start, pages);
                Ok(addr.page())
            }
            AllocAt::Anywhere => {
                let start = self
                    .bitmap
                    .find_clear_run(0, pages)
                    .ok_or(VmError::OutOfVirtualSpace)?;
                self.bitmap.set_run(start, pages);
                Ok(VirtualPage::from_number(start))
            }
        }
    }

    /// Live range covering the virtual address, if any.
    fn range_covering(&self, addr: VirtualAddress) -> Option<(RangeId, Range)> {
        if !self.bitmap.get(addr.page_number()) {
            return None;
        }
        self.ranges
            .iter()
            .find(|(_, r)| r.covers(addr))
            .map(|(id, r)| (id, *r))
    }

    /// Live range whose physical backing covers the physical address, if
    /// any. Checks contiguous backings and shard chains alike.
    fn range_covering_phys(&self, addr: PhysicalAddress) -> Option<(RangeId, Range)> {
        for (id, range) in self.ranges.iter() {
            if let Some(phys) = range.phys {
                let base = phys.base().as_u32();
                if addr.as_u32() >= base && addr.as_u32() - base < range.size() {
                    return Some((id, *range));
                }
            } else if self
                .shards
                .chain(range.shards)
                .any(|s| s.phys == addr.page())
            {
                return Some((id, *range));
            }
        }
        None
    }
}

/// One address space: virtual page accounting plus its lazily built page
/// tables. One exists per task, plus one for the kernel itself.
pub struct AddressSpace {
    inner: SpinLock<Space>,
}

impl AddressSpace {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: SpinLock::new(Space::new()),
        }
    }

    fn space(&self) -> Result<SpinLockGuard<'_, Space>, VmError> {
        self.inner
            .try_lock_for(DEFAULT_LOCK_RETRIES)
            .ok_or(VmError::LockContended)
    }

    /// Allocate `pages` pages of virtual memory.
    ///
    /// `phys` supplies an explicit physical backing (e.g. MMIO); when
    /// `None`, frames are taken from the frame allocator. Unless
    /// [`VmFlags::no_map`] is set and once this space has page tables, the
    /// mapping is installed in hardware; [`VmFlags::zero`] wipes the memory
    /// through a kernel-context alias when the space is not the kernel's.
    ///
    /// The whole sequence runs under this space's lock; zeroing a foreign
    /// space additionally takes the kernel lock, always second (the lock
    /// order for every two-space operation).
    ///
    /// # Errors
    /// All failures are total: any bitmap reservation, frame allocation or
    /// partial mapping made before the failing step is rolled back.
    pub fn alloc<M: PhysMapper>(
        &self,
        env: &VmEnv<'_, M>,
        pages: usize,
        at: AllocAt,
        phys: Option<PhysicalAddress>,
        flags: VmFlags,
    ) -> Result<VmAllocation, VmError> {
        if pages == 0 {
            return Err(VmError::ZeroSize);
        }

        let mut space = self.space()?;
        let virt = space.alloc_virt(pages, at)?;

        match Self::alloc_locked(&mut space, env.is_kernel(self), env, virt, pages, phys, flags) {
            Ok(allocation) => {
                if flags.trace() {
                    debug!(
                        "vm: alloc {pages} pages at {} -> {:?}",
                        allocation.addr(),
                        allocation.phys()
                    );
                }
                Ok(allocation)
            }
            Err(e) => {
                space.bitmap.clear_run(virt.number(), pages);
                Err(e)
            }
        }
    }

    /// Allocate the same run of virtual pages in every given space at once,
    /// so the memory is identically addressed everywhere (kernel-visible
    /// segments mapped into every task). Returns the shared base address;
    /// per-space records are reachable via [`range_at`](Self::range_at).
    ///
    /// The spaces must be distinct. One physical backing is shared by all
    /// of them: passed in, or allocated once when `phys` is `None`.
    pub fn alloc_many<const N: usize, M: PhysMapper>(
        env: &VmEnv<'_, M>,
        spaces: [&AddressSpace; N],
        pages: usize,
        phys: Option<PhysicalAddress>,
        flags: [VmFlags; N],
    ) -> Result<VirtualAddress, VmError> {
        if pages == 0 || N == 0 {
            return Err(VmError::ZeroSize);
        }

        // Phase 1: find a run that is free in *all* spaces and reserve it
        // everywhere, all locks held.
        let start = {
            let mut guards: [Option<SpinLockGuard<'_, Space>>; N] = [const { None }; N];
            for (guard, space) in guards.iter_mut().zip(spaces) {
                *guard = Some(space.space()?);
            }

            let mut candidate;
            {
                let first = guards[0].as_ref().ok_or(VmError::LockContended)?;
                candidate = first
                    .bitmap
                    .find_clear_run(0, pages)
                    .ok_or(VmError::OutOfVirtualSpace)?;
            }
            'probe: loop {
                for guard in guards.iter().skip(1) {
                    let space = guard.as_ref().ok_or(VmError::LockContended)?;
                    if !space.bitmap.run_is_clear(candidate, pages) {
                        let first = guards[0].as_ref().ok_or(VmError::LockContended)?;
                        candidate = first
                            .bitmap
                            .find_clear_run(candidate + 1, pages)
                            .ok_or(VmError::OutOfVirtualSpace)?;
                        continue 'probe;
                    }
                }
                break;
            }
            for guard in &mut guards {
                if let Some(space) = guard.as_mut() {
                    space.bitmap.set_run(candidate, pages);
                }
            }
            candidate
        };
        let virt = VirtualPage::from_number(start);

        // Phase 2: the usual physical setup and record creation, one space
        // at a time. The reservation made above keeps the run ours.
        let mut shared_phys = phys;
        for (i, space) in spaces.iter().enumerate() {
            match space.alloc_reserved(env, virt, pages, shared_phys, flags[i]) {
                Ok(allocation) => shared_phys = allocation.phys(),
                Err(e) => {
                    Self::unwind_alloc_many(env, &spaces[..i], virt, pages, phys, shared_phys);
                    for later in &spaces[i..] {
                        if let Ok(mut s) = later.space() {
                            s.bitmap.clear_run(virt.number(), pages);
                        }
                    }
                    return Err(e);
                }
            }
        }

        Ok(virt.base())
    }

    fn unwind_alloc_many<M: PhysMapper>(
        env: &VmEnv<'_, M>,
        done: &[&AddressSpace],
        virt: VirtualPage,
        pages: usize,
        caller_phys: Option<PhysicalAddress>,
        shared_phys: Option<PhysicalAddress>,
    ) {
        let mut phys_released = false;
        for space in done {
            if let Some((id, range)) = space.inner.lock().range_covering(virt.base()) {
                let allocation = VmAllocation::from_range(id, &range);
                phys_released |= range.flags.free_phys();
                if space.free(env, allocation).is_err() {
                    error!("vm: rollback failed for {}", virt.base());
                }
            }
        }
        // The backing was allocated here (not passed in) and no freed range
        // owned it: return it explicitly.
        if caller_phys.is_none()
            && !phys_released
            && let Some(base) = shared_phys
        {
            env.frames.free_frames(base, pages);
        }
    }

    /// Like [`alloc`](Self::alloc), but for a virtual run the caller has
    /// already reserved (the `alloc_many` second phase). The bitmap
    /// reservation stays in place on error; the caller owns it.
    fn alloc_reserved<M: PhysMapper>(
        &self,
        env: &VmEnv<'_, M>,
        virt: VirtualPage,
        pages: usize,
        phys: Option<PhysicalAddress>,
        flags: VmFlags,
    ) -> Result<VmAllocation, VmError> {
        let mut space = self.space()?;
        Self::alloc_locked(&mut space, env.is_kernel(self), env, virt, pages, phys, flags)
    }

    /// Physical setup and record creation for a reserved run, with the
    /// target space's lock held by the caller: obtain frames, install the
    /// hardware mapping, zero, insert the range record. On error everything
    /// but the caller's bitmap reservation is undone.
    fn alloc_locked<M: PhysMapper>(
        space: &mut Space,
        target_is_kernel: bool,
        env: &VmEnv<'_, M>,
        virt: VirtualPage,
        pages: usize,
        phys: Option<PhysicalAddress>,
        flags: VmFlags,
    ) -> Result<VmAllocation, VmError> {
        let owned = phys.is_none();
        let phys = match phys {
            Some(p) => p.page(),
            None => env.frames.alloc_frames(pages)?.page(),
        };
        let size = (pages as u32) * PAGE_SIZE;

        let release = |space: &mut Space| {
            if !flags.no_map()
                && let Some(pm) = space.page_map.as_mut()
            {
                pm.clear_range(env.mapper, virt.base(), size);
            }
            if owned {
                env.frames.free_frames(phys.base(), pages);
            }
        };

        if let Err(e) = Self::install_locked(space, target_is_kernel, env, virt, phys, pages, flags)
        {
            release(space);
            return Err(e);
        }

        let range = Range {
            addr: virt,
            pages,
            flags,
            phys: Some(phys),
            shards: None,
        };
        match space.ranges.insert(range) {
            Some(id) => Ok(VmAllocation::from_range(id, &range)),
            None => {
                release(space);
                Err(VmError::TooManyRanges)
            }
        }
    }

    /// Hardware mapping and optional zeroing for a fresh allocation, target
    /// lock held.
    fn install_locked<M: PhysMapper>(
        space: &mut Space,
        target_is_kernel: bool,
        env: &VmEnv<'_, M>,
        virt: VirtualPage,
        phys: PhysicalPage,
        pages: usize,
        flags: VmFlags,
    ) -> Result<(), VmError> {
        let size = (pages as u32) * PAGE_SIZE;

        if !flags.no_map()
            && let Some(pm) = space.page_map.as_mut()
        {
            pm.set_range(
                env.mapper,
                env.frames,
                virt.base(),
                phys.base(),
                size,
                access_of(flags),
            )?;
        }

        if flags.zero() {
            if target_is_kernel && !flags.no_map() {
                // The kernel's own memory is directly addressable.
                unsafe {
                    ptr::write_bytes(env.mapper.phys_to_ptr(phys.base()), 0, size as usize);
                }
            } else if target_is_kernel {
                // Already holding the kernel lock: the re-entrant path.
                Self::zero_via_alias(space, env, phys, pages)?;
            } else {
                // Target lock first, kernel lock second.
                let mut kernel = env.kernel.space()?;
                Self::zero_via_alias(&mut kernel, env, phys, pages)?;
            }
        }
        Ok(())
    }

    /// Wipe `pages` frames through a transient alias in the kernel space;
    /// the target space's mapping may not be addressable from the
    /// allocator's own execution context. Reserve kernel pages, map, zero
    /// through the alias, unmap, release.
    fn zero_via_alias<M: PhysMapper>(
        kernel: &mut Space,
        env: &VmEnv<'_, M>,
        phys: PhysicalPage,
        pages: usize,
    ) -> Result<(), VmError> {
        let size = (pages as u32) * PAGE_SIZE;
        let alias = kernel.alloc_virt(pages, AllocAt::Anywhere)?;
        if let Some(pm) = kernel.page_map.as_mut() {
            match pm.set_range(
                env.mapper,
                env.frames,
                alias.base(),
                phys.base(),
                size,
                PageAccess::kernel_rw(),
            ) {
                Ok(()) => {
                    for n in 0..pages {
                        let va = alias.add_pages(n).base();
                        if let Some(pa) = pm.translate(env.mapper, va) {
                            unsafe {
                                ptr::write_bytes(env.mapper.phys_to_ptr(pa), 0, PAGE_SIZE as usize);
                            }
                        }
                    }
                    pm.clear_range(env.mapper, alias.base(), size);
                }
                Err(e) => {
                    kernel.bitmap.clear_run(alias.number(), pages);
                    return Err(e.into());
                }
            }
        } else {
            // No kernel page tables yet (early boot): the direct map still
            // reaches every frame.
            unsafe {
                ptr::write_bytes(env.mapper.phys_to_ptr(phys.base()), 0, size as usize);
            }
        }
        kernel.bitmap.clear_run(alias.number(), pages);
        Ok(())
    }

    /// Alias `size` bytes starting at `src_addr` in `src` into this space,
    /// read through freshly allocated virtual pages here. Returns the
    /// address of the first aliased byte (including the sub-page offset of
    /// `src_addr`) along with the new range.
    ///
    /// The source may be physically scattered across multiple ranges; each
    /// page is resolved individually and recorded as a shard. With
    /// [`VmFlags::tolerate_gaps`] the walk stops at the first unmapped
    /// source page instead of failing.
    pub fn map_from<M: PhysMapper>(
        &self,
        env: &VmEnv<'_, M>,
        src: &AddressSpace,
        src_addr: VirtualAddress,
        size: u32,
        flags: VmFlags,
    ) -> Result<(VirtualAddress, VmAllocation), VmError> {
        if size == 0 {
            return Err(VmError::ZeroSize);
        }
        let src_offset = src_addr.page_offset();
        // One more page than size/PAGE_SIZE when the source is not
        // page-aligned: 0x100 bytes at 0x1FF0 straddle two pages.
        let pages = ((u64::from(size) + u64::from(src_offset))
            .div_ceil(u64::from(PAGE_SIZE))) as usize;

        let same_space = ptr::eq(self, src);
        let mut dest = self.space()?;
        let src_guard = if same_space { None } else { Some(src.space()?) };

        let virt = dest.alloc_virt(pages, AllocAt::Anywhere)?;

        let src_base = src_addr.page();
        let mut head: Option<u16> = None;
        let mut mapped = 0usize;
        let result: Result<(), VmError> = 'walk: {
            for n in 0..pages {
                let src_va = src_base.add_pages(n).base();
                let looked_up = match &src_guard {
                    Some(guard) => guard.range_covering(src_va),
                    None => dest.range_covering(src_va),
                };
                let Some((_, src_range)) = looked_up else {
                    if flags.tolerate_gaps() {
                        break 'walk Ok(());
                    }
                    break 'walk Err(VmError::SourceUnmapped(src_va));
                };
                let Some(src_phys) = src_range.phys else {
                    debug_assert!(false, "aliasing a sharded range");
                    break 'walk Err(VmError::ShardedSource);
                };
                if flags.user_only() && !src_range.flags.user() {
                    break 'walk Err(VmError::SourceNotUserAccessible(src_va));
                }

                let phys = src_phys.add_pages(src_va.page_number() - src_range.addr.number());
                let dst_page = virt.add_pages(n);
                if let Err(e) = dest.shards.push(&mut head, dst_page, phys) {
                    break 'walk Err(e);
                }
                if !flags.no_map()
                    && let Some(pm) = dest.page_map.as_mut()
                    && let Err(e) = pm.set_range(
                        env.mapper,
                        env.frames,
                        dst_page.base(),
                        phys.base(),
                        PAGE_SIZE,
                        access_of(flags),
                    )
                {
                    break 'walk Err(e.into());
                }
                mapped += 1;
                if flags.trace() {
                    debug!("vm: aliased {} -> {}", dst_page.base(), phys.base());
                }
            }
            Ok(())
        };

        if let Err(e) = result {
            // Total rollback: shards, hardware entries, reservation.
            dest.shards.take_chain(head, |_| {});
            if let Some(pm) = dest.page_map.as_mut() {
                pm.clear_range(env.mapper, virt.base(), (mapped as u32) * PAGE_SIZE);
            }
            dest.bitmap.clear_run(virt.number(), pages);
            return Err(e);
        }

        let range = Range {
            addr: virt,
            pages,
            flags,
            phys: None,
            shards: head,
        };
        let id = match dest.ranges.insert(range) {
            Some(id) => id,
            None => {
                dest.shards.take_chain(head, |_| {});
                if let Some(pm) = dest.page_map.as_mut() {
                    pm.clear_range(env.mapper, virt.base(), (mapped as u32) * PAGE_SIZE);
                }
                dest.bitmap.clear_run(virt.number(), pages);
                return Err(VmError::TooManyRanges);
            }
        };

        Ok((
            virt.base() + src_offset,
            VmAllocation::from_range(id, &range),
        ))
    }

    /// Release a range: clears its bitmap pages, removes the record, unmaps
    /// it, and (only with [`VmFlags::free_phys`]) returns the physical
    /// backing, contiguous or per shard, to the frame allocator.
    ///
    /// The handle is resolved against the authoritative table; a stale one
    /// is rejected with [`VmError::InvalidHandle`].
    pub fn free<M: PhysMapper>(
        &self,
        env: &VmEnv<'_, M>,
        allocation: VmAllocation,
    ) -> Result<(), VmError> {
        let mut space = self.space()?;
        let Some(range) = space.ranges.remove(allocation.id) else {
            warn!("vm: free with stale range handle at {}", allocation.addr());
            return Err(VmError::InvalidHandle);
        };

        space.bitmap.clear_run(range.addr.number(), range.pages);
        if let Some(pm) = space.page_map.as_mut() {
            pm.clear_range(env.mapper, range.addr.base(), range.size());
        }

        let free_phys = range.flags.free_phys();
        if free_phys && let Some(phys) = range.phys {
            env.frames.free_frames(phys.base(), range.pages);
        }
        space.shards.take_chain(range.shards, |shard| {
            if free_phys {
                env.frames.free_frames(shard.phys.base(), 1);
            }
        });

        if range.flags.trace() {
            debug!("vm: freed {} pages at {}", range.pages, range.addr.base());
        }
        Ok(())
    }

    /// Duplicate a contiguous range of `src` into this space at the same
    /// virtual address, backed by freshly allocated physical memory.
    ///
    /// Both the source and a scratch destination are staged through
    /// kernel-space aliases for the byte copy; any final partial page is
    /// zero-padded so stale data never leaks into the copy.
    pub fn copy_from<M: PhysMapper>(
        &self,
        env: &VmEnv<'_, M>,
        src: &AddressSpace,
        src_alloc: &VmAllocation,
    ) -> Result<VmAllocation, VmError> {
        if src_alloc.phys.is_none() {
            debug_assert!(false, "copy of a sharded range");
            return Err(VmError::ShardedSource);
        }
        let pages = src_alloc.pages();
        let size = src_alloc.size();

        // Fresh physical memory, reachable through the kernel space.
        let scratch = env.kernel.alloc(
            env,
            pages,
            AllocAt::Anywhere,
            None,
            VmFlags::new().with_writable(true),
        )?;
        let Some(scratch_phys) = scratch.phys() else {
            debug_assert!(false, "contiguous allocation without physical base");
            return Err(VmError::ShardedSource);
        };

        // Stage the source into the kernel space and copy page by page.
        let alias = env
            .kernel
            .map_from(env, src, src_alloc.addr(), size, VmFlags::new());
        let (alias_addr, alias_alloc) = match alias {
            Ok(v) => v,
            Err(e) => {
                let _ = env.kernel.free(env, scratch);
                env.frames.free_frames(scratch_phys, pages);
                return Err(e);
            }
        };

        let mut copied = 0u32;
        while copied < size {
            let chunk = (size - copied).min(PAGE_SIZE);
            let src_pa = env.kernel.translate(alias_addr + copied);
            let Some(src_pa) = src_pa else {
                let _ = env.kernel.free(env, alias_alloc);
                let _ = env.kernel.free(env, scratch);
                env.frames.free_frames(scratch_phys, pages);
                return Err(VmError::SourceUnmapped(alias_addr + copied));
            };
            unsafe {
                ptr::copy_nonoverlapping(
                    env.mapper.phys_to_ptr(src_pa),
                    env.mapper.phys_to_ptr(scratch_phys + copied),
                    chunk as usize,
                );
                // Zero the remainder of the final page so no previous
                // owner's bytes survive in the copy.
                if chunk < PAGE_SIZE {
                    ptr::write_bytes(
                        env.mapper.phys_to_ptr(scratch_phys + copied + chunk),
                        0,
                        (PAGE_SIZE - chunk) as usize,
                    );
                }
            }
            copied += chunk;
        }

        // Drop the alias and the scratch window; the physical memory
        // survives (scratch was allocated without `free_phys`) and becomes
        // the backing of the real destination range.
        env.kernel.free(env, alias_alloc)?;
        env.kernel.free(env, scratch)?;

        self.alloc(
            env,
            pages,
            AllocAt::Fixed(src_alloc.addr()),
            Some(scratch_phys),
            src_alloc.flags(),
        )
    }

    /// Fork-time duplication: copy every range of `src` marked
    /// [`VmFlags::fork_copy`] into this space.
    pub fn clone_from<M: PhysMapper>(
        &self,
        env: &VmEnv<'_, M>,
        src: &AddressSpace,
    ) -> Result<(), VmError> {
        // Snapshot under the source lock; the copies re-lock per operation.
        let mut targets: [Option<VmAllocation>; MAX_RANGES] = [None; MAX_RANGES];
        {
            let space = src.space()?;
            for (slot, (id, range)) in targets
                .iter_mut()
                .zip(space.ranges.iter().filter(|(_, r)| r.flags.fork_copy()))
            {
                *slot = Some(VmAllocation::from_range(id, range));
            }
        }
        for allocation in targets.iter().flatten() {
            self.copy_from(env, src, allocation)?;
        }
        Ok(())
    }

    /// The range covering a virtual address, as a value copy.
    #[must_use]
    pub fn range_at(&self, addr: VirtualAddress) -> Option<VmAllocation> {
        let space = self.inner.lock();
        space
            .range_covering(addr)
            .map(|(id, r)| VmAllocation::from_range(id, &r))
    }

    /// The range whose physical backing covers `addr`, as a value copy.
    #[must_use]
    pub fn range_at_phys(&self, addr: PhysicalAddress) -> Option<VmAllocation> {
        let space = self.inner.lock();
        space
            .range_covering_phys(addr)
            .map(|(id, r)| VmAllocation::from_range(id, &r))
    }

    /// Resolve a virtual address to the physical address backing it,
    /// through the range bookkeeping (works with or without page tables).
    #[must_use]
    pub fn translate(&self, addr: VirtualAddress) -> Option<PhysicalAddress> {
        let space = self.inner.lock();
        let (_, range) = space.range_covering(addr)?;
        if let Some(phys) = range.phys {
            return Some(phys.base() + (addr.as_u32() - range.addr.base().as_u32()));
        }
        space
            .shards
            .chain(range.shards)
            .find(|s| s.addr == addr.page())
            .map(|s| s.phys.base() + addr.page_offset())
    }

    /// Reverse translation: the virtual address in this space that maps the
    /// given physical address.
    #[must_use]
    pub fn translate_phys(&self, addr: PhysicalAddress) -> Option<VirtualAddress> {
        let space = self.inner.lock();
        let (_, range) = space.range_covering_phys(addr)?;
        if let Some(phys) = range.phys {
            return Some(range.addr.base() + (addr.as_u32() - phys.base().as_u32()));
        }
        space
            .shards
            .chain(range.shards)
            .find(|s| s.phys == addr.page())
            .map(|s| s.addr.base() + addr.page_offset())
    }

    /// Root of this space's page tables (the CR3 value), building them on
    /// first use by replaying every recorded range.
    ///
    /// Spaces that are never scheduled never pay for a page directory; the
    /// ranges they accumulated before their first activation are installed
    /// here in one sweep.
    pub fn page_map_root<M: PhysMapper>(
        &self,
        env: &VmEnv<'_, M>,
    ) -> Result<PhysicalPage, VmError> {
        let mut space = self.space()?;
        if let Some(pm) = &space.page_map {
            return Ok(pm.root());
        }

        let mut pm = PageMap::new(env.mapper, env.frames)?;
        let result: Result<(), VmError> = 'replay: {
            for (_, range) in space.ranges.iter() {
                if range.flags.no_map() {
                    continue;
                }
                let access = access_of(range.flags);
                if let Some(phys) = range.phys {
                    if let Err(e) = pm.set_range(
                        env.mapper,
                        env.frames,
                        range.addr.base(),
                        phys.base(),
                        range.size(),
                        access,
                    ) {
                        break 'replay Err(e.into());
                    }
                } else {
                    for shard in space.shards.chain(range.shards) {
                        if let Err(e) = pm.set_range(
                            env.mapper,
                            env.frames,
                            shard.addr.base(),
                            shard.phys.base(),
                            PAGE_SIZE,
                            access,
                        ) {
                            break 'replay Err(e.into());
                        }
                    }
                }
            }
            Ok(())
        };
        if let Err(e) = result {
            pm.destroy(env.mapper, env.frames);
            return Err(e);
        }

        let root = pm.root();
        space.page_map = Some(pm);
        Ok(root)
    }

    /// Destroy the space's contents: every `free_phys` range returns its
    /// frames, the page tables are dismantled, and the space resets to the
    /// freshly created state.
    pub fn teardown<M: PhysMapper>(&self, env: &VmEnv<'_, M>) -> Result<(), VmError> {
        let mut space = self.space()?;
        while let Some(id) = space.ranges.head() {
            let Some(range) = space.ranges.remove(id) else {
                break;
            };
            let free_phys = range.flags.free_phys();
            if free_phys && let Some(phys) = range.phys {
                env.frames.free_frames(phys.base(), range.pages);
            }
            space.shards.take_chain(range.shards, |shard| {
                if free_phys {
                    env.frames.free_frames(shard.phys.base(), 1);
                }
            });
        }
        if let Some(pm) = space.page_map.take() {
            pm.destroy(env.mapper, env.frames);
        }
        let mut bitmap = PageBitmap::new(VM_PAGE_COUNT);
        bitmap.set_run(0, 1);
        space.bitmap = bitmap;
        Ok(())
    }

    /// Total and used bytes of this space's virtual page budget.
    #[must_use]
    pub fn stats(&self) -> MemStats {
        let space = self.inner.lock();
        MemStats {
            total: space.bitmap.len() as u64 * u64::from(PAGE_SIZE),
            used: space.bitmap.count_set() as u64 * u64::from(PAGE_SIZE),
        }
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

const fn access_of(flags: VmFlags) -> PageAccess {
    PageAccess {
        writable: flags.writable(),
        user: flags.user(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::{KernelImage, MemoryRegion, MemoryRegionKind};
    use std::alloc::{Layout, alloc_zeroed, dealloc};

    const ARENA_PAGES: usize = 512;

    /// Page-aligned arena standing in for physical RAM; physical address 0
    /// is the first arena byte.
    struct TestMemory {
        ptr: *mut u8,
        layout: Layout,
    }

    impl TestMemory {
        fn new(pages: usize) -> Self {
            let layout =
                Layout::from_size_align(pages * PAGE_SIZE as usize, PAGE_SIZE as usize).unwrap();
            let ptr = unsafe { alloc_zeroed(layout) };
            assert!(!ptr.is_null());
            Self { ptr, layout }
        }

        fn fill(&self, value: u8) {
            unsafe { ptr::write_bytes(self.ptr, value, self.layout.size()) };
        }

        fn read(&self, pa: PhysicalAddress) -> u8 {
            assert!(pa.as_usize() < self.layout.size());
            unsafe { *self.ptr.add(pa.as_usize()) }
        }

        fn write(&self, pa: PhysicalAddress, value: u8) {
            assert!(pa.as_usize() < self.layout.size());
            unsafe { *self.ptr.add(pa.as_usize()) = value };
        }
    }

    impl Drop for TestMemory {
        fn drop(&mut self) {
            unsafe { dealloc(self.ptr, self.layout) };
        }
    }

    impl PhysMapper for TestMemory {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
            assert!(pa.as_usize() + size_of::<T>() <= self.layout.size());
            unsafe { &mut *self.ptr.add(pa.as_usize()).cast::<T>() }
        }
    }

    struct TestRig {
        mem: TestMemory,
        frames: FrameAllocator,
        kernel: AddressSpace,
    }

    impl TestRig {
        fn new() -> Box<Self> {
            let mem = TestMemory::new(ARENA_PAGES);
            let map = [MemoryRegion::new(
                0,
                (ARENA_PAGES * PAGE_SIZE as usize) as u64,
                MemoryRegionKind::Available,
            )];
            let image = KernelImage::new(PhysicalAddress::new(0), PhysicalAddress::new(0x4000));
            let frames = FrameAllocator::new(&map, image);
            Box::new(Self {
                mem,
                frames,
                kernel: AddressSpace::new(),
            })
        }

        fn env(&self) -> VmEnv<'_, TestMemory> {
            VmEnv {
                mapper: &self.mem,
                frames: &self.frames,
                kernel: &self.kernel,
            }
        }
    }

    fn rw() -> VmFlags {
        VmFlags::new().with_writable(true)
    }

    /// Core consistency invariant: a page bit is set iff a live range
    /// covers the page (modulo the permanently blocked null page).
    fn assert_bitmap_matches_ranges(space: &AddressSpace) {
        let inner = space.inner.lock();
        let live: Vec<Range> = inner.ranges.iter().map(|(_, r)| *r).collect();
        let highest = live
            .iter()
            .map(|r| r.addr.number() + r.pages)
            .max()
            .unwrap_or(0);
        for page in 1..highest + 16 {
            let covered = live
                .iter()
                .any(|r| page >= r.addr.number() && page < r.addr.number() + r.pages);
            assert_eq!(
                inner.bitmap.get(page),
                covered,
                "bitmap/range mismatch at page {page}"
            );
        }
        let total: usize = live.iter().map(|r| r.pages).sum();
        assert_eq!(inner.bitmap.count_set(), total + 1, "null page plus ranges");
    }

    #[test]
    fn alloc_reserves_and_free_restores() {
        let rig = TestRig::new();
        let env = rig.env();

        let before = rig.kernel.stats();
        let a = rig
            .kernel
            .alloc(&env, 3, AllocAt::Anywhere, None, rw())
            .unwrap();
        assert_eq!(a.size(), 3 * PAGE_SIZE);
        assert_bitmap_matches_ranges(&rig.kernel);

        rig.kernel.free(&env, a).unwrap();
        assert_eq!(rig.kernel.stats(), before);
        assert!(rig.kernel.range_at(a.addr()).is_none());
        assert_bitmap_matches_ranges(&rig.kernel);

        // First fit hands the same run out again when nothing intervened.
        let b = rig
            .kernel
            .alloc(&env, 3, AllocAt::Anywhere, None, rw())
            .unwrap();
        assert_eq!(b.addr(), a.addr());
    }

    #[test]
    fn intervening_alloc_moves_first_fit() {
        let rig = TestRig::new();
        let env = rig.env();

        let a = rig
            .kernel
            .alloc(&env, 3, AllocAt::Anywhere, None, rw())
            .unwrap();
        let _b = rig
            .kernel
            .alloc(&env, 1, AllocAt::Anywhere, None, rw())
            .unwrap();
        rig.kernel.free(&env, a).unwrap();
        // The freed hole is reusable, but a larger request skips past it.
        let c = rig
            .kernel
            .alloc(&env, 4, AllocAt::Anywhere, None, rw())
            .unwrap();
        assert_ne!(c.addr(), a.addr());
        let d = rig
            .kernel
            .alloc(&env, 3, AllocAt::Anywhere, None, rw())
            .unwrap();
        assert_eq!(d.addr(), a.addr());
    }

    #[test]
    fn live_ranges_never_overlap() {
        let rig = TestRig::new();
        let env = rig.env();

        let mut ranges = Vec::new();
        for pages in [1usize, 3, 2, 5, 1] {
            ranges.push(
                rig.kernel
                    .alloc(&env, pages, AllocAt::Anywhere, None, rw())
                    .unwrap(),
            );
        }
        rig.kernel.free(&env, ranges.remove(2)).unwrap();
        ranges.push(
            rig.kernel
                .alloc(&env, 2, AllocAt::Anywhere, None, rw())
                .unwrap(),
        );

        for (i, a) in ranges.iter().enumerate() {
            for b in &ranges[i + 1..] {
                let disjoint = a.addr().as_u32() + a.size() <= b.addr().as_u32()
                    || b.addr().as_u32() + b.size() <= a.addr().as_u32();
                assert!(disjoint, "{} overlaps {}", a.addr(), b.addr());
            }
        }
        assert_bitmap_matches_ranges(&rig.kernel);
    }

    #[test]
    fn fixed_alloc_zeroes_memory() {
        let rig = TestRig::new();
        let env = rig.env();
        rig.mem.fill(0xAA);

        let at = VirtualAddress::new(0x30_0000);
        let a = rig
            .kernel
            .alloc(&env, 3, AllocAt::Fixed(at), None, rw().with_zero(true))
            .unwrap();
        assert_eq!(a.addr(), at);

        for off in (0..3 * PAGE_SIZE).step_by(0x401) {
            let pa = rig.kernel.translate(at + off).unwrap();
            assert_eq!(rig.mem.read(pa), 0, "byte at offset {off:#x} not zeroed");
        }
    }

    #[test]
    fn zeroing_foreign_space_stages_through_kernel() {
        let rig = TestRig::new();
        let env = rig.env();
        rig.mem.fill(0xAA);
        // Give the kernel page tables so the transient alias really maps.
        rig.kernel.page_map_root(&env).unwrap();

        let task = AddressSpace::new();
        let kernel_stats = rig.kernel.stats();

        let a = task
            .alloc(&env, 2, AllocAt::Anywhere, None, rw().with_zero(true))
            .unwrap();
        let phys = a.phys().unwrap();
        for off in (0..2 * PAGE_SIZE).step_by(0x101) {
            assert_eq!(rig.mem.read(phys + off), 0);
        }
        // The staging alias was fully released again.
        assert_eq!(rig.kernel.stats(), kernel_stats);
    }

    #[test]
    fn duplicate_fixed_allocation_fails_loudly() {
        let rig = TestRig::new();
        let env = rig.env();

        let at = VirtualAddress::new(0x40_0000);
        let a = rig
            .kernel
            .alloc(&env, 2, AllocAt::Fixed(at), None, rw())
            .unwrap();
        let err = rig
            .kernel
            .alloc(&env, 1, AllocAt::Fixed(at + PAGE_SIZE), None, rw())
            .unwrap_err();
        assert_eq!(err, VmError::AddressInUse(at + PAGE_SIZE));

        // The loser left no trace.
        assert_bitmap_matches_ranges(&rig.kernel);
        assert_eq!(rig.kernel.range_at(at).unwrap().addr(), a.addr());
    }

    #[test]
    fn frame_exhaustion_rolls_back_reservation() {
        let rig = TestRig::new();
        let env = rig.env();

        let before = rig.kernel.stats();
        let frames_before = rig.frames.stats();
        let err = rig
            .kernel
            .alloc(&env, ARENA_PAGES + 1, AllocAt::Anywhere, None, rw())
            .unwrap_err();
        assert!(matches!(err, VmError::Frames(FrameError::OutOfFrames(_))));
        assert_eq!(rig.kernel.stats(), before);
        assert_eq!(rig.frames.stats(), frames_before);
    }

    #[test]
    fn free_phys_returns_frames() {
        let rig = TestRig::new();
        let env = rig.env();

        let before = rig.frames.stats();
        let a = rig
            .kernel
            .alloc(&env, 4, AllocAt::Anywhere, None, rw().with_free_phys(true))
            .unwrap();
        assert!(rig.frames.stats().used > before.used);
        rig.kernel.free(&env, a).unwrap();
        assert_eq!(rig.frames.stats(), before);
    }

    #[test]
    fn free_without_free_phys_keeps_frames() {
        let rig = TestRig::new();
        let env = rig.env();

        let before = rig.frames.stats();
        let a = rig
            .kernel
            .alloc(&env, 2, AllocAt::Anywhere, None, rw())
            .unwrap();
        rig.kernel.free(&env, a).unwrap();
        let after = rig.frames.stats();
        assert_eq!(after.used, before.used + 2 * u64::from(PAGE_SIZE));
    }

    #[test]
    fn stale_handle_is_rejected() {
        let rig = TestRig::new();
        let env = rig.env();

        let a = rig
            .kernel
            .alloc(&env, 1, AllocAt::Anywhere, None, rw())
            .unwrap();
        rig.kernel.free(&env, a).unwrap();
        assert_eq!(rig.kernel.free(&env, a).unwrap_err(), VmError::InvalidHandle);

        // A recycled slot must not resurrect the old handle either.
        let b = rig
            .kernel
            .alloc(&env, 1, AllocAt::Anywhere, None, rw())
            .unwrap();
        assert_eq!(rig.kernel.free(&env, a).unwrap_err(), VmError::InvalidHandle);
        rig.kernel.free(&env, b).unwrap();
    }

    #[test]
    fn map_from_aliases_unaligned_scattered_source() {
        let rig = TestRig::new();
        let env = rig.env();
        let task = AddressSpace::new();

        // Two virtually adjacent pages in the task backed by deliberately
        // non-adjacent frames.
        let p1 = rig.frames.alloc_frames(1).unwrap();
        let _gap = rig.frames.alloc_frames(1).unwrap();
        let p2 = rig.frames.alloc_frames(1).unwrap();
        assert_ne!(p1 + PAGE_SIZE, p2);

        let v = VirtualAddress::new(0x10_0000);
        task.alloc(&env, 1, AllocAt::Fixed(v), Some(p1), rw())
            .unwrap();
        task.alloc(&env, 1, AllocAt::Fixed(v + PAGE_SIZE), Some(p2), rw())
            .unwrap();

        // A pattern straddling the page boundary.
        for i in 0..0x20u32 {
            let src = v + (PAGE_SIZE - 0x10) + i;
            let pa = task.translate(src).unwrap();
            rig.mem.write(pa, (0x40 + i) as u8);
        }

        let src_addr = v + (PAGE_SIZE - 0x10);
        let (alias_addr, alias) = rig
            .kernel
            .map_from(&env, &task, src_addr, 0x20, VmFlags::new())
            .unwrap();

        // 0x20 bytes from an unaligned start still straddle two pages.
        assert_eq!(alias.pages(), 2);
        assert_eq!(alias_addr.page_offset(), src_addr.page_offset());
        assert!(alias.phys().is_none(), "aliases are sharded");

        for i in 0..0x20u32 {
            let src_pa = task.translate(src_addr + i).unwrap();
            let dst_pa = rig.kernel.translate(alias_addr + i).unwrap();
            assert_eq!(src_pa, dst_pa, "alias resolves to the source frame");
            assert_eq!(rig.mem.read(dst_pa), (0x40 + i) as u8);
        }

        rig.kernel.free(&env, alias).unwrap();
        assert_bitmap_matches_ranges(&rig.kernel);
    }

    #[test]
    fn map_from_unmapped_source_fails_and_unwinds() {
        let rig = TestRig::new();
        let env = rig.env();
        let task = AddressSpace::new();

        let before = rig.kernel.stats();
        let err = rig
            .kernel
            .map_from(
                &env,
                &task,
                VirtualAddress::new(0x70_0000),
                PAGE_SIZE,
                VmFlags::new(),
            )
            .unwrap_err();
        assert_eq!(err, VmError::SourceUnmapped(VirtualAddress::new(0x70_0000)));
        assert_eq!(rig.kernel.stats(), before);
    }

    #[test]
    fn map_from_tolerates_gaps_when_asked() {
        let rig = TestRig::new();
        let env = rig.env();
        let task = AddressSpace::new();

        let v = VirtualAddress::new(0x10_0000);
        task.alloc(&env, 1, AllocAt::Fixed(v), None, rw()).unwrap();

        // Two pages requested, only the first exists in the source.
        let (alias_addr, alias) = rig
            .kernel
            .map_from(
                &env,
                &task,
                v,
                2 * PAGE_SIZE,
                VmFlags::new().with_tolerate_gaps(true),
            )
            .unwrap();
        assert_eq!(alias.pages(), 2, "virtual reservation covers the request");
        assert!(rig.kernel.translate(alias_addr).is_some());
        assert!(rig.kernel.translate(alias_addr + PAGE_SIZE).is_none());
        rig.kernel.free(&env, alias).unwrap();
    }

    #[test]
    fn map_from_user_only_refuses_kernel_pages() {
        let rig = TestRig::new();
        let env = rig.env();
        let task = AddressSpace::new();

        let v = VirtualAddress::new(0x20_0000);
        task.alloc(&env, 1, AllocAt::Fixed(v), None, rw()).unwrap();

        let err = rig
            .kernel
            .map_from(
                &env,
                &task,
                v,
                PAGE_SIZE,
                VmFlags::new().with_user_only(true),
            )
            .unwrap_err();
        assert_eq!(err, VmError::SourceNotUserAccessible(v));
    }

    #[test]
    fn alloc_many_finds_address_free_in_all_spaces() {
        let rig = TestRig::new();
        let env = rig.env();
        let other = AddressSpace::new();

        // Occupy different low runs so the intersection lies above both.
        let a = rig
            .kernel
            .alloc(&env, 2, AllocAt::Anywhere, None, rw())
            .unwrap();
        other
            .alloc(
                &env,
                2,
                AllocAt::Fixed(a.addr() + 2 * PAGE_SIZE),
                None,
                rw(),
            )
            .unwrap();

        let user_flags = rw().with_user(true);
        let virt = AddressSpace::alloc_many(
            &env,
            [&rig.kernel, &other],
            2,
            None,
            [rw(), user_flags],
        )
        .unwrap();

        let in_kernel = rig.kernel.range_at(virt).unwrap();
        let in_other = other.range_at(virt).unwrap();
        assert_eq!(in_kernel.addr(), virt);
        assert_eq!(in_other.addr(), virt);
        assert_eq!(in_kernel.phys(), in_other.phys(), "one shared backing");
        assert!(!in_kernel.flags().user());
        assert!(in_other.flags().user());
        assert_bitmap_matches_ranges(&rig.kernel);
        assert_bitmap_matches_ranges(&other);
    }

    #[test]
    fn copy_from_duplicates_bytes_into_new_frames() {
        let rig = TestRig::new();
        let env = rig.env();
        let parent = AddressSpace::new();
        let child = AddressSpace::new();

        let v = VirtualAddress::new(0x80_0000);
        let src = parent
            .alloc(&env, 2, AllocAt::Fixed(v), None, rw().with_fork_copy(true))
            .unwrap();
        for off in (0..2 * PAGE_SIZE).step_by(0x31) {
            let pa = parent.translate(v + off).unwrap();
            rig.mem.write(pa, (off % 251) as u8);
        }

        let copy = child.copy_from(&env, &parent, &src).unwrap();
        assert_eq!(copy.addr(), v, "copy lands at the source's address");
        assert_ne!(copy.phys(), src.phys(), "freshly allocated backing");
        assert_eq!(copy.flags(), src.flags());

        for off in (0..2 * PAGE_SIZE).step_by(0x31) {
            let pa = child.translate(v + off).unwrap();
            assert_eq!(rig.mem.read(pa), (off % 251) as u8);
        }

        // The kernel staging areas are gone again.
        assert_eq!(
            rig.kernel.stats().used,
            u64::from(PAGE_SIZE),
            "only the null page remains accounted"
        );
    }

    #[test]
    fn clone_from_copies_only_fork_ranges() {
        let rig = TestRig::new();
        let env = rig.env();
        let parent = AddressSpace::new();
        let child = AddressSpace::new();

        let keep = parent
            .alloc(
                &env,
                1,
                AllocAt::Fixed(VirtualAddress::new(0x10_0000)),
                None,
                rw().with_fork_copy(true),
            )
            .unwrap();
        let skip = parent
            .alloc(
                &env,
                1,
                AllocAt::Fixed(VirtualAddress::new(0x20_0000)),
                None,
                rw(),
            )
            .unwrap();

        child.clone_from(&env, &parent).unwrap();
        assert!(child.range_at(keep.addr()).is_some());
        assert!(child.range_at(skip.addr()).is_none());
    }

    #[test]
    fn translate_works_in_both_directions() {
        let rig = TestRig::new();
        let env = rig.env();

        let a = rig
            .kernel
            .alloc(&env, 2, AllocAt::Anywhere, None, rw())
            .unwrap();
        let phys = a.phys().unwrap();
        assert_eq!(rig.kernel.translate(a.addr() + 0x1234), Some(phys + 0x1234));
        assert_eq!(
            rig.kernel.translate_phys(phys + 0x1FFF),
            Some(a.addr() + 0x1FFF)
        );
        assert_eq!(rig.kernel.translate(a.addr() + a.size()), None);

        assert_eq!(
            rig.kernel.range_at_phys(phys + PAGE_SIZE).unwrap().addr(),
            a.addr()
        );
    }

    #[test]
    fn page_map_root_replays_recorded_ranges() {
        let rig = TestRig::new();
        let env = rig.env();
        let task = AddressSpace::new();

        // Ranges accumulate before any page table exists.
        let v = VirtualAddress::new(0x10_0000);
        let a = task.alloc(&env, 2, AllocAt::Fixed(v), None, rw()).unwrap();
        let (alias_addr, _alias) = task
            .map_from(&env, &rig.kernel, {
                let k = rig
                    .kernel
                    .alloc(&env, 1, AllocAt::Anywhere, None, rw())
                    .unwrap();
                k.addr()
            }, PAGE_SIZE, VmFlags::new())
            .unwrap();

        let root = task.page_map_root(&env).unwrap();
        let again = task.page_map_root(&env).unwrap();
        assert_eq!(root, again, "directory is built once");

        // The hardware tree now agrees with the bookkeeping.
        let aliased_phys = task.translate(alias_addr);
        let inner = task.inner.lock();
        let pm = inner.page_map.as_ref().unwrap();
        assert_eq!(
            pm.translate(&rig.mem, v + PAGE_SIZE),
            Some(a.phys().unwrap() + PAGE_SIZE)
        );
        assert_eq!(pm.translate(&rig.mem, alias_addr), aliased_phys);
    }

    #[test]
    fn teardown_returns_everything() {
        let rig = TestRig::new();
        let env = rig.env();
        let baseline = rig.frames.stats();

        let task = AddressSpace::new();
        task.alloc(&env, 3, AllocAt::Anywhere, None, rw().with_free_phys(true))
            .unwrap();
        task.alloc(
            &env,
            1,
            AllocAt::Fixed(VirtualAddress::new(0x44_0000)),
            None,
            rw().with_free_phys(true),
        )
        .unwrap();
        task.page_map_root(&env).unwrap();
        assert!(rig.frames.stats().used > baseline.used);

        task.teardown(&env).unwrap();
        assert_eq!(rig.frames.stats(), baseline);
        assert_eq!(task.stats().used, u64::from(PAGE_SIZE));
    }

    #[test]
    fn zero_size_requests_are_rejected() {
        let rig = TestRig::new();
        let env = rig.env();
        assert_eq!(
            rig.kernel
                .alloc(&env, 0, AllocAt::Anywhere, None, rw())
                .unwrap_err(),
            VmError::ZeroSize
        );
        assert_eq!(
            rig.kernel
                .map_from(&env, &rig.kernel, VirtualAddress::new(0x1000), 0, rw())
                .unwrap_err(),
            VmError::ZeroSize
        );
    }
}
