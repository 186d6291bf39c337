//! Spaces: region lists with an allocation and lifetime policy.
//!
//! - [`Space`] is the shared base: an intrusive doubly linked region list
//!   plus committed / live / capacity counters.
//! - [`LinearSpace`] bump-allocates; [`SemiSpace`] adds the age water line,
//!   [`SnapshotSpace`] is immortal.
//! - [`SparseSpace`] allocates from a free list and is swept by mark bitmap
//!   (old, non-movable and machine-code objects).
//! - [`HugeObjectSpace`] gives each object its own run of regions.

use std::sync::{
    Arc,
    atomic::{AtomicU32, AtomicUsize, Ordering},
};

use parking_lot::Mutex;

use crate::{
    FreeObjectList, HeapRegionAllocator, NO_REGION, Region, RegionFlags, RegionId,
};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpaceType {
    None = 0,
    Semi,
    Old,
    NonMovable,
    MachineCode,
    Huge,
    Snapshot,
}

impl From<u8> for SpaceType {
    fn from(raw: u8) -> Self {
        match raw {
            1 => Self::Semi,
            2 => Self::Old,
            3 => Self::NonMovable,
            4 => Self::MachineCode,
            5 => Self::Huge,
            6 => Self::Snapshot,
            _ => Self::None,
        }
    }
}

// ── Space base ────────────────────────────────────────────────────────

#[derive(Debug)]
struct RegionList {
    head: RegionId,
    tail: RegionId,
    len: usize,
}

impl Default for RegionList {
    fn default() -> Self {
        Self {
            head: NO_REGION,
            tail: NO_REGION,
            len: 0,
        }
    }
}

pub struct Space {
    ty: SpaceType,
    regions: Arc<HeapRegionAllocator>,
    list: Mutex<RegionList>,
    committed: AtomicUsize,
    live: AtomicUsize,
    initial_capacity: AtomicUsize,
    maximum_capacity: AtomicUsize,
    record_region: AtomicU32,
}

impl Space {
    pub fn new(
        ty: SpaceType,
        regions: Arc<HeapRegionAllocator>,
        initial_capacity: usize,
        maximum_capacity: usize,
    ) -> Self {
        Self {
            ty,
            regions,
            list: Mutex::new(RegionList::default()),
            committed: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
            initial_capacity: AtomicUsize::new(initial_capacity),
            maximum_capacity: AtomicUsize::new(maximum_capacity),
            record_region: AtomicU32::new(NO_REGION),
        }
    }

    #[inline(always)]
    pub fn space_type(&self) -> SpaceType {
        self.ty
    }

    #[inline(always)]
    pub fn allocator(&self) -> &HeapRegionAllocator {
        &self.regions
    }

    #[inline(always)]
    fn footprint(&self, region: &Region) -> usize {
        region.run_len().max(1) as usize * self.regions.region_size()
    }

    /// Appends `region` and accounts its footprint and used bytes.
    pub fn add_region(&self, region: &Region) {
        let mut list = self.list.lock();
        region.set_space_type(self.ty);
        region.prev.store(list.tail, Ordering::Relaxed);
        region.next.store(NO_REGION, Ordering::Relaxed);
        if list.tail == NO_REGION {
            list.head = region.id();
        } else {
            self.regions
                .region(list.tail)
                .next
                .store(region.id(), Ordering::Relaxed);
        }
        list.tail = region.id();
        list.len += 1;
        self.committed
            .fetch_add(self.footprint(region), Ordering::Relaxed);
        self.live
            .fetch_add(region.top() - region.begin(), Ordering::Relaxed);
    }

    /// Unlinks `region` and takes its footprint and used bytes off the counters.
    pub fn remove_region(&self, region: &Region) {
        let mut list = self.list.lock();
        debug_assert_eq!(region.space_type(), self.ty);
        let prev = region.prev.load(Ordering::Relaxed);
        let next = region.next.load(Ordering::Relaxed);
        if prev == NO_REGION {
            list.head = next;
        } else {
            self.regions.region(prev).next.store(next, Ordering::Relaxed);
        }
        if next == NO_REGION {
            list.tail = prev;
        } else {
            self.regions.region(next).prev.store(prev, Ordering::Relaxed);
        }
        list.len -= 1;
        if self.record_region.load(Ordering::Relaxed) == region.id() {
            self.record_region.store(prev, Ordering::Relaxed);
        }
        region.prev.store(NO_REGION, Ordering::Relaxed);
        region.next.store(NO_REGION, Ordering::Relaxed);
        self.committed
            .fetch_sub(self.footprint(region), Ordering::Relaxed);
        self.live
            .fetch_sub(region.top() - region.begin(), Ordering::Relaxed);
    }

    fn region_ids(&self) -> Vec<RegionId> {
        let list = self.list.lock();
        let mut ids = Vec::with_capacity(list.len);
        let mut cur = list.head;
        while cur != NO_REGION {
            ids.push(cur);
            cur = self.regions.region(cur).next.load(Ordering::Relaxed);
        }
        ids
    }

    /// Visits the regions in insertion order. The list is snapshotted first,
    /// so the visitor may add or remove regions.
    pub fn enumerate_regions(&self, mut visitor: impl FnMut(&Region)) {
        for id in self.region_ids() {
            visitor(self.regions.region(id));
        }
    }

    /// Visits regions from the head up to and including `end`. With
    /// `NO_REGION` every region is visited.
    pub fn enumerate_regions_until(&self, end: RegionId, mut visitor: impl FnMut(&Region)) {
        for id in self.region_ids() {
            visitor(self.regions.region(id));
            if id == end {
                break;
            }
        }
    }

    /// Remembers the current tail so later passes can skip regions added
    /// after this point.
    pub fn set_record_region(&self) {
        let tail = self.list.lock().tail;
        self.record_region.store(tail, Ordering::Relaxed);
    }

    pub fn record_region(&self) -> RegionId {
        self.record_region.load(Ordering::Relaxed)
    }

    pub fn clear_record_region(&self) {
        self.record_region.store(NO_REGION, Ordering::Relaxed);
    }

    /// Returns every region to the allocator.
    pub fn reclaim_regions(&self) {
        for id in self.region_ids() {
            let region = self.regions.region(id);
            self.remove_region(region);
            self.regions.free_region(region);
        }
        self.clear_record_region();
    }

    pub fn region_count(&self) -> usize {
        self.list.lock().len
    }

    #[inline(always)]
    pub fn committed_size(&self) -> usize {
        self.committed.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn live_size(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub(crate) fn increase_live(&self, bytes: usize) {
        self.live.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn decrease_live(&self, bytes: usize) {
        self.live.fetch_sub(bytes, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn initial_capacity(&self) -> usize {
        self.initial_capacity.load(Ordering::Relaxed)
    }

    pub fn set_initial_capacity(&self, capacity: usize) {
        self.initial_capacity.store(capacity, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn maximum_capacity(&self) -> usize {
        self.maximum_capacity.load(Ordering::Relaxed)
    }

    pub fn set_maximum_capacity(&self, capacity: usize) {
        self.maximum_capacity.store(capacity, Ordering::Relaxed);
    }

    /// Walks the objects of `[region.begin, limit)` in address order.
    pub fn iterate_region_objects(region: &Region, limit: usize, visitor: &mut dyn FnMut(usize)) {
        let mut cur = region.begin();
        while cur < limit {
            // SAFETY: regions are kept walkable; every gap holds a filler.
            let size = unsafe { object::object_size(cur) };
            debug_assert!(size > 0, "zero-sized object at 0x{cur:x}");
            if !unsafe { object::header_at(cur) }.is_free() {
                visitor(cur);
            }
            cur += size;
        }
    }
}

impl core::fmt::Debug for Space {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Space")
            .field("type", &self.ty)
            .field("regions", &self.region_count())
            .field("committed", &self.committed_size())
            .field("live", &self.live_size())
            .finish()
    }
}

// ── Linear spaces ─────────────────────────────────────────────────────

#[derive(Debug)]
struct Bump {
    region: RegionId,
    top: usize,
    end: usize,
}

/// Bump allocation over a growing list of regions.
#[derive(Debug)]
pub struct LinearSpace {
    space: Space,
    flags: RegionFlags,
    bump: Mutex<Bump>,
}

impl LinearSpace {
    fn new(space: Space, flags: RegionFlags) -> Self {
        Self {
            space,
            flags,
            bump: Mutex::new(Bump {
                region: NO_REGION,
                top: 0,
                end: 0,
            }),
        }
    }

    #[inline(always)]
    pub fn space(&self) -> &Space {
        &self.space
    }

    fn bump_in(&self, bump: &mut Bump, size: usize) -> Option<usize> {
        if bump.region == NO_REGION || bump.top + size > bump.end {
            return None;
        }
        let addr = bump.top;
        bump.top += size;
        self.space.allocator().region(bump.region).set_top(bump.top);
        self.space.increase_live(size);
        Some(addr)
    }

    /// Allocates from the current region only.
    pub fn allocate(&self, size: usize) -> Option<usize> {
        let mut bump = self.bump.lock();
        self.bump_in(&mut bump, size)
    }

    fn expand_locked(&self, bump: &mut Bump, limit: usize) -> bool {
        let region_size = self.space.allocator().region_size();
        if self.space.committed_size() + region_size > limit {
            return false;
        }
        let Some(region) = self.space.allocator().allocate_region(self.flags) else {
            return false;
        };
        self.space.add_region(region);
        bump.region = region.id();
        bump.top = region.begin();
        bump.end = region.end();
        true
    }

    /// Starts a fresh region if the committed size stays within `limit`.
    pub fn expand(&self, limit: usize) -> bool {
        let mut bump = self.bump.lock();
        self.expand_locked(&mut bump, limit)
    }

    /// Carves `size` bytes, growing up to `limit`.
    pub fn allocate_or_expand(&self, size: usize, limit: usize) -> Option<usize> {
        let mut bump = self.bump.lock();
        if let Some(addr) = self.bump_in(&mut bump, size) {
            return Some(addr);
        }
        if !self.expand_locked(&mut bump, limit) {
            return None;
        }
        self.bump_in(&mut bump, size)
    }

    /// Current allocation top, or 0 when no region is in use.
    pub fn top(&self) -> usize {
        let bump = self.bump.lock();
        if bump.region == NO_REGION { 0 } else { bump.top }
    }

    fn current_region(&self) -> RegionId {
        self.bump.lock().region
    }

    pub fn heap_object_size(&self) -> usize {
        self.space.live_size()
    }

    pub fn iterate_objects(&self, visitor: &mut dyn FnMut(usize)) {
        self.space.enumerate_regions(|r| Space::iterate_region_objects(r, r.top(), visitor));
    }

    /// Releases every region and forgets the bump state.
    pub fn reclaim(&self) {
        let mut bump = self.bump.lock();
        self.space.reclaim_regions();
        *bump = Bump {
            region: NO_REGION,
            top: 0,
            end: 0,
        };
    }
}

/// One half of the young generation.
///
/// Objects below the water line survived one collection already and are
/// promoted by the next.
#[derive(Debug)]
pub struct SemiSpace {
    linear: LinearSpace,
    water_line: AtomicUsize,
    survival_object_size: AtomicUsize,
    minimum_capacity: usize,
}

const GROW_OBJECT_SURVIVAL_RATE: f64 = 0.8;
const SHRINK_OBJECT_SURVIVAL_RATE: f64 = 0.2;
const SEMI_GROWING_FACTOR: usize = 2;

impl SemiSpace {
    pub fn new(regions: Arc<HeapRegionAllocator>, initial_capacity: usize, maximum_capacity: usize) -> Self {
        let space = Space::new(SpaceType::Semi, regions, initial_capacity, maximum_capacity);
        Self {
            linear: LinearSpace::new(space, RegionFlags::YOUNG),
            water_line: AtomicUsize::new(0),
            survival_object_size: AtomicUsize::new(0),
            minimum_capacity: initial_capacity,
        }
    }

    #[inline(always)]
    pub fn space(&self) -> &Space {
        self.linear.space()
    }

    /// Mutator allocation in the current region.
    #[inline(always)]
    pub fn allocate(&self, size: usize) -> Option<usize> {
        self.linear.allocate(size)
    }

    /// Takes a new region while the committed size is below the initial
    /// capacity, which is the young collection trigger.
    pub fn expand(&self) -> bool {
        self.linear.expand(self.space().initial_capacity())
    }

    /// Lets the space grow `extra` bytes past the trigger capacity while
    /// concurrent marking is still running.
    pub fn expand_overshoot(&self, extra: usize) -> bool {
        self.linear.expand(self.space().initial_capacity() + extra)
    }

    /// Copy destination during a collection, bounded by the maximum capacity.
    pub fn allocate_chunk(&self, size: usize) -> Option<usize> {
        self.linear
            .allocate_or_expand(size, self.space().maximum_capacity())
    }

    pub fn heap_object_size(&self) -> usize {
        self.linear.heap_object_size()
    }

    pub fn committed_size(&self) -> usize {
        self.space().committed_size()
    }

    pub fn top(&self) -> usize {
        self.linear.top()
    }

    pub fn water_line(&self) -> usize {
        self.water_line.load(Ordering::Relaxed)
    }

    /// Records the current top as the age mark. Called after each young
    /// collection on the space that received the survivors.
    pub fn set_water_line(&self) {
        let current = self.linear.current_region();
        let top = self.linear.top();
        self.water_line.store(top, Ordering::Relaxed);
        self.survival_object_size
            .store(self.heap_object_size(), Ordering::Relaxed);
        self.space().enumerate_regions(|r| {
            r.clear_flag(RegionFlags::HAS_AGE_MARK.with(RegionFlags::BELOW_AGE_MARK));
            if r.id() == current {
                r.set_flag(RegionFlags::HAS_AGE_MARK);
            } else {
                r.set_flag(RegionFlags::BELOW_AGE_MARK);
            }
        });
    }

    /// Whether `addr` in `region` already survived a collection.
    #[inline(always)]
    pub fn is_below_water_line(&self, region: &Region, addr: usize) -> bool {
        let flags = region.flags();
        flags.contains(RegionFlags::BELOW_AGE_MARK)
            || (flags.contains(RegionFlags::HAS_AGE_MARK) && addr < self.water_line())
    }

    pub fn survival_object_size(&self) -> usize {
        self.survival_object_size.load(Ordering::Relaxed)
    }

    pub fn allocated_size_since_gc(&self) -> usize {
        self.heap_object_size()
            .saturating_sub(self.survival_object_size())
    }

    /// Grows the trigger capacity when most objects survive and shrinks it
    /// when almost none do. Returns `true` if the capacity changed.
    pub fn adjust_capacity(&self, allocated_since_gc: usize, survived: usize) -> bool {
        let initial = self.space().initial_capacity();
        if (allocated_since_gc as f64)
            <= initial as f64 * GROW_OBJECT_SURVIVAL_RATE / SEMI_GROWING_FACTOR as f64
        {
            return false;
        }
        let rate = survived as f64 / allocated_since_gc as f64;
        if rate > GROW_OBJECT_SURVIVAL_RATE {
            let max = self.space().maximum_capacity();
            if initial >= max {
                return false;
            }
            self.space()
                .set_initial_capacity((initial * SEMI_GROWING_FACTOR).min(max));
            true
        } else if rate < SHRINK_OBJECT_SURVIVAL_RATE {
            if initial <= self.minimum_capacity {
                return false;
            }
            self.space()
                .set_initial_capacity((initial / SEMI_GROWING_FACTOR).max(self.minimum_capacity));
            true
        } else {
            false
        }
    }

    pub fn iterate_objects(&self, visitor: &mut dyn FnMut(usize)) {
        self.linear.iterate_objects(visitor);
    }

    pub fn reclaim(&self) {
        self.linear.reclaim();
        self.water_line.store(0, Ordering::Relaxed);
        self.survival_object_size.store(0, Ordering::Relaxed);
    }
}

/// Immortal objects loaded with the VM image. Never swept or moved; their
/// fields act as roots in full marks and through remembered sets otherwise.
#[derive(Debug)]
pub struct SnapshotSpace {
    linear: LinearSpace,
}

impl SnapshotSpace {
    pub fn new(regions: Arc<HeapRegionAllocator>, capacity: usize) -> Self {
        let space = Space::new(SpaceType::Snapshot, regions, capacity, capacity);
        Self {
            linear: LinearSpace::new(space, RegionFlags::SNAPSHOT),
        }
    }

    #[inline(always)]
    pub fn space(&self) -> &Space {
        self.linear.space()
    }

    pub fn allocate(&self, size: usize) -> Option<usize> {
        self.linear
            .allocate_or_expand(size, self.space().maximum_capacity())
    }

    pub fn heap_object_size(&self) -> usize {
        self.linear.heap_object_size()
    }

    pub fn iterate_objects(&self, visitor: &mut dyn FnMut(usize)) {
        self.linear.iterate_objects(visitor);
    }

    pub fn reclaim(&self) {
        self.linear.reclaim();
    }
}

// ── Sparse spaces ─────────────────────────────────────────────────────

/// Free-list space swept by mark bitmap.
#[derive(Debug)]
pub struct SparseSpace {
    space: Space,
    flags: RegionFlags,
    free_list: Mutex<FreeObjectList>,
    total_allocated: AtomicUsize,
    cset: Mutex<Vec<RegionId>>,
}

impl SparseSpace {
    pub fn new(
        ty: SpaceType,
        flags: RegionFlags,
        regions: Arc<HeapRegionAllocator>,
        initial_capacity: usize,
        maximum_capacity: usize,
    ) -> Self {
        Self {
            space: Space::new(ty, regions, initial_capacity, maximum_capacity),
            flags,
            free_list: Mutex::new(FreeObjectList::new()),
            total_allocated: AtomicUsize::new(0),
            cset: Mutex::new(Vec::new()),
        }
    }

    #[inline(always)]
    pub fn space(&self) -> &Space {
        &self.space
    }

    fn expand_locked(&self, free_list: &mut FreeObjectList) -> bool {
        let region_size = self.space.allocator().region_size();
        if self.space.committed_size() + region_size > self.space.maximum_capacity() {
            return false;
        }
        let Some(region) = self.space.allocator().allocate_region(self.flags) else {
            return false;
        };
        // The whole region is handed to the free list; the top stays at
        // `begin` so the live counter of the base is not used for sparse spaces.
        self.space.add_region(region);
        // SAFETY: a fresh region is unused memory owned by this space.
        unsafe { free_list.add(region.begin(), region.size()) };
        true
    }

    pub fn expand(&self) -> bool {
        let mut free_list = self.free_list.lock();
        self.expand_locked(&mut free_list)
    }

    /// Allocates from existing free ranges only.
    pub fn try_allocate(&self, size: usize) -> Option<usize> {
        let addr = self.free_list.lock().allocate(size)?;
        self.total_allocated.fetch_add(size, Ordering::Relaxed);
        Some(addr)
    }

    pub fn allocate(&self, size: usize) -> Option<usize> {
        let mut free_list = self.free_list.lock();
        let addr = match free_list.allocate(size) {
            Some(addr) => addr,
            None => {
                if !self.expand_locked(&mut free_list) {
                    return None;
                }
                free_list.allocate(size)?
            }
        };
        self.total_allocated.fetch_add(size, Ordering::Relaxed);
        Some(addr)
    }

    /// A chunk of `min..=preferred` bytes for a thread-local buffer.
    pub fn allocate_chunk(&self, min: usize, preferred: usize) -> Option<(usize, usize)> {
        let mut free_list = self.free_list.lock();
        let chunk = match free_list.allocate_chunk(min, preferred) {
            Some(chunk) => chunk,
            None => {
                if !self.expand_locked(&mut free_list) {
                    return None;
                }
                free_list.allocate_chunk(min, preferred)?
            }
        };
        self.total_allocated.fetch_add(chunk.1, Ordering::Relaxed);
        Some(chunk)
    }

    /// Returns an unused tail of a thread-local buffer.
    pub fn add_free(&self, start: usize, size: usize) {
        self.total_allocated.fetch_sub(size, Ordering::Relaxed);
        // SAFETY: the caller hands back memory it carved from this space and never used.
        unsafe { self.free_list.lock().add(start, size) };
    }

    pub fn heap_object_size(&self) -> usize {
        let free_list = self.free_list.lock();
        self.used_locked(&free_list)
    }

    pub fn committed_size(&self) -> usize {
        self.space.committed_size()
    }

    pub fn total_allocated_size(&self) -> usize {
        self.total_allocated.load(Ordering::Relaxed)
    }

    /// Whether `size` more bytes still fit under the allocation limit.
    pub fn can_expand(&self, size: usize) -> bool {
        self.heap_object_size() + size <= self.space.initial_capacity()
    }

    pub fn iterate_objects(&self, visitor: &mut dyn FnMut(usize)) {
        self.space
            .enumerate_regions(|r| Space::iterate_region_objects(r, r.end(), visitor));
    }

    fn used_locked(&self, free_list: &FreeObjectList) -> usize {
        self.space
            .committed_size()
            .saturating_sub(free_list.available() + free_list.wasted())
    }

    /// Rebuilds the free list from the mark bitmaps. Regions added after the
    /// record region were allocated black; their free ranges are collected
    /// again without sweeping. Returns the number of bytes freed.
    pub fn sweep(&self) -> usize {
        let mut free_list = self.free_list.lock();
        let before = self.used_locked(&free_list);
        free_list.reset();
        let record = self.space.record_region();
        let mut swept = 0;
        self.space.enumerate_regions_until(record, |region| {
            let live = Self::sweep_region(region, &mut free_list);
            region.set_live_bytes(live);
            region.set_flag(RegionFlags::HAS_LIVE_INFO);
            log::trace!("swept region {} live {live}", region.id());
            swept += 1;
        });
        let mut index = 0;
        self.space.enumerate_regions(|region| {
            if index >= swept {
                Self::collect_free_ranges(region, &mut free_list);
            }
            index += 1;
        });
        self.space.clear_record_region();
        before.saturating_sub(self.used_locked(&free_list))
    }

    fn collect_free_ranges(region: &Region, free_list: &mut FreeObjectList) {
        let mut cur = region.begin();
        while cur < region.end() {
            // SAFETY: sparse regions are walkable from begin to end.
            let header = unsafe { object::header_at(cur) };
            let size = header.size();
            if header.is_free() {
                // SAFETY: a filler is unused memory of this space.
                unsafe { free_list.add(cur, size) };
            }
            cur += size;
        }
    }

    fn sweep_region(region: &Region, free_list: &mut FreeObjectList) -> usize {
        let mut free = |from: usize, to: usize| {
            if from < to {
                region.clear_rsets_in_range(from, to);
                // SAFETY: no marked object overlaps [from, to).
                unsafe { free_list.add(from, to - from) };
            }
        };
        let mut cursor = region.begin();
        let mut live = 0;
        region.iterate_marked_objects(|addr| {
            free(cursor, addr);
            // SAFETY: marked addresses are object starts.
            let size = unsafe { object::object_size(addr) };
            live += size;
            cursor = addr + size;
        });
        free(cursor, region.end());
        live
    }

    /// Picks lightly populated regions for evacuation by the next partial
    /// collection. They leave the region list and their free ranges are
    /// detached so nothing new is allocated in them.
    pub fn select_cset(&self, min_regions: usize, max_regions: usize, most_alive_rate: f64) -> usize {
        let region_size = self.space.allocator().region_size();
        let threshold = (region_size as f64 * most_alive_rate) as usize;
        let mut candidates = Vec::new();
        self.space.enumerate_regions(|r| {
            if r.has_flag(RegionFlags::HAS_LIVE_INFO) && r.live_bytes() < threshold {
                candidates.push((r.live_bytes(), r.id()));
            }
        });
        if candidates.len() < min_regions {
            log::debug!(
                "cset skipped: {} candidate regions below minimum {min_regions}",
                candidates.len()
            );
            return 0;
        }
        candidates.sort_unstable();
        candidates.truncate(max_regions);
        let mut free_list = self.free_list.lock();
        let mut cset = self.cset.lock();
        for &(_, id) in &candidates {
            let region = self.space.allocator().region(id);
            free_list.detach_region(region.begin(), region.end());
            self.space.remove_region(region);
            region.set_flag(RegionFlags::IN_CSET);
            cset.push(id);
        }
        log::debug!("selected {} cset regions in {:?}", cset.len(), self.space.space_type());
        cset.len()
    }

    pub fn cset_regions(&self) -> Vec<RegionId> {
        self.cset.lock().clone()
    }

    pub fn cset_live_bytes(&self) -> usize {
        self.cset
            .lock()
            .iter()
            .map(|&id| self.space.allocator().region(id).live_bytes())
            .sum()
    }

    /// Frees the evacuated collection-set regions.
    pub fn reclaim_cset(&self) {
        let mut cset = self.cset.lock();
        for id in cset.drain(..) {
            self.space.allocator().free_region(self.space.allocator().region(id));
        }
    }

    /// Releases every region (used for the compaction target after the swap).
    pub fn reclaim(&self) {
        let mut free_list = self.free_list.lock();
        self.space.reclaim_regions();
        free_list.reset();
        self.total_allocated.store(0, Ordering::Relaxed);
    }
}

// ── Huge objects ──────────────────────────────────────────────────────

/// One object per run of regions; freed wholesale when unmarked.
#[derive(Debug)]
pub struct HugeObjectSpace {
    space: Space,
}

impl HugeObjectSpace {
    pub fn new(regions: Arc<HeapRegionAllocator>, maximum_capacity: usize) -> Self {
        Self {
            space: Space::new(SpaceType::Huge, regions, maximum_capacity, maximum_capacity),
        }
    }

    #[inline(always)]
    pub fn space(&self) -> &Space {
        &self.space
    }

    pub fn allocate(&self, size: usize) -> Option<usize> {
        let region_size = self.space.allocator().region_size();
        let count = size.div_ceil(region_size);
        if self.space.committed_size() + count * region_size > self.space.maximum_capacity() {
            return None;
        }
        let head = self
            .space
            .allocator()
            .allocate_run(count, RegionFlags::HUGE)?;
        let mut remaining = size;
        for region in self.space.allocator().run_of(head) {
            let used = remaining.min(region.end() - region.begin());
            region.set_top(region.begin() + used);
            remaining -= used;
        }
        self.space.add_region(head);
        // Only the head is linked into the space; count the tails here.
        self.space.increase_live(self.tail_bytes(head));
        Some(head.begin())
    }

    fn tail_bytes(&self, head: &Region) -> usize {
        self.space.allocator().run_of(head)[1..]
            .iter()
            .map(|r| r.top() - r.begin())
            .sum()
    }

    pub fn heap_object_size(&self) -> usize {
        self.space.live_size()
    }

    pub fn committed_size(&self) -> usize {
        self.space.committed_size()
    }

    pub fn iterate_objects(&self, visitor: &mut dyn FnMut(usize)) {
        self.space.enumerate_regions(|head| visitor(head.begin()));
    }

    /// Visits every region of every run, heads and tails.
    pub fn enumerate_all_regions(&self, visitor: &mut dyn FnMut(&Region)) {
        self.space.enumerate_regions(|head| {
            for r in self.space.allocator().run_of(head) {
                visitor(r);
            }
        });
    }

    /// Frees unmarked objects. Returns the freed footprint.
    pub fn sweep(&self) -> usize {
        let mut freed = 0;
        self.space.enumerate_regions(|head| {
            if !head.is_marked(head.begin()) {
                freed += head.run_len() as usize * self.space.allocator().region_size();
                self.space.decrease_live(self.tail_bytes(head));
                self.space.remove_region(head);
                self.space.allocator().free_region(head);
            }
        });
        freed
    }

    pub fn reclaim(&self) {
        self.space.reclaim_regions();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::{ObjectType, fields_allocation_size};

    const REGION: usize = 64 * 1024;

    fn allocator(regions: usize) -> Arc<HeapRegionAllocator> {
        Arc::new(HeapRegionAllocator::new(regions * REGION, REGION))
    }

    #[test]
    fn add_remove_adjust_counters() {
        let alloc = allocator(4);
        let space = Space::new(SpaceType::Old, alloc.clone(), REGION, 4 * REGION);
        let a = alloc.allocate_region(RegionFlags::OLD).unwrap();
        let b = alloc.allocate_region(RegionFlags::OLD).unwrap();
        space.add_region(a);
        space.add_region(b);
        assert_eq!(space.committed_size(), 2 * REGION);
        assert_eq!(space.region_count(), 2);
        space.remove_region(a);
        assert_eq!(space.committed_size(), REGION);
        let mut seen = Vec::new();
        space.enumerate_regions(|r| seen.push(r.id()));
        assert_eq!(seen, vec![b.id()]);
    }

    #[test]
    fn enumerate_stops_at_record_region() {
        let alloc = allocator(4);
        let space = Space::new(SpaceType::Old, alloc.clone(), REGION, 4 * REGION);
        for _ in 0..2 {
            space.add_region(alloc.allocate_region(RegionFlags::OLD).unwrap());
        }
        space.set_record_region();
        space.add_region(alloc.allocate_region(RegionFlags::OLD).unwrap());
        let mut count = 0;
        space.enumerate_regions_until(space.record_region(), |_| count += 1);
        assert_eq!(count, 2);
    }

    #[test]
    fn semi_space_expands_to_initial_capacity() {
        let alloc = allocator(8);
        let semi = SemiSpace::new(alloc, 2 * REGION, 4 * REGION);
        assert!(semi.allocate(32).is_none());
        assert!(semi.expand());
        assert!(semi.allocate(REGION - 32).is_some());
        assert!(semi.allocate(64).is_none());
        assert!(semi.expand());
        assert!(!semi.expand());
        assert_eq!(semi.committed_size(), 2 * REGION);
        assert!(semi.allocate(REGION).is_some());
        assert!(semi.allocate(32).is_none());
        // collections may copy up to the maximum
        assert!(semi.allocate_chunk(REGION).is_some());
        assert_eq!(semi.committed_size(), 3 * REGION);
        assert!(semi.allocate_chunk(REGION).is_some());
        assert!(semi.allocate_chunk(32).is_none());
        assert_eq!(semi.committed_size(), 4 * REGION);
    }

    #[test]
    fn water_line_splits_age() {
        let alloc = allocator(4);
        let semi = SemiSpace::new(alloc.clone(), 2 * REGION, 2 * REGION);
        assert!(semi.expand());
        let old = semi.allocate(64).unwrap();
        semi.set_water_line();
        let young = semi.allocate(64).unwrap();
        let region = alloc.region_of(old);
        assert!(semi.is_below_water_line(region, old));
        assert!(!semi.is_below_water_line(region, young));
    }

    #[test]
    fn sparse_sweep_frees_unmarked() {
        let alloc = allocator(4);
        let space = SparseSpace::new(SpaceType::Old, RegionFlags::OLD, alloc.clone(), REGION, 2 * REGION);
        let size = fields_allocation_size(2);
        let live = space.allocate(size).unwrap();
        let dead = space.allocate(size).unwrap();
        unsafe {
            object::init_object(live, ObjectType::Slots, size);
            object::init_object(dead, ObjectType::Slots, size);
        }
        alloc.region_of(live).mark(live);
        let used = space.heap_object_size();
        let freed = space.sweep();
        assert_eq!(freed, size);
        assert_eq!(space.heap_object_size(), used - size);
        assert_eq!(alloc.region_of(live).live_bytes(), size);
        let mut objects = Vec::new();
        space.iterate_objects(&mut |o| objects.push(o));
        assert_eq!(objects, vec![live]);
    }

    #[test]
    fn cset_takes_sparsest_regions() {
        let alloc = allocator(8);
        let space = SparseSpace::new(SpaceType::Old, RegionFlags::OLD, alloc.clone(), REGION, 8 * REGION);
        for _ in 0..3 {
            assert!(space.expand());
        }
        let mut ids = Vec::new();
        space.space().enumerate_regions(|r| ids.push(r.id()));
        for (i, &id) in ids.iter().enumerate() {
            let r = alloc.region(id);
            r.set_live_bytes(i * 1024);
            r.set_flag(RegionFlags::HAS_LIVE_INFO);
        }
        assert_eq!(space.select_cset(5, 16, 0.8), 0);
        assert_eq!(space.select_cset(1, 2, 0.8), 2);
        assert_eq!(space.cset_regions(), vec![ids[0], ids[1]]);
        assert!(alloc.region(ids[0]).in_cset());
        assert_eq!(space.committed_size(), REGION);
        space.reclaim_cset();
        assert_eq!(alloc.committed(), REGION);
    }

    #[test]
    fn huge_space_frees_unmarked_runs() {
        let alloc = allocator(8);
        let huge = HugeObjectSpace::new(alloc.clone(), 8 * REGION);
        let a = huge.allocate(REGION + 64).unwrap();
        let b = huge.allocate(REGION / 2).unwrap();
        assert_eq!(huge.committed_size(), 3 * REGION);
        alloc.region_of(b).mark(b);
        assert_eq!(huge.sweep(), 2 * REGION);
        assert_eq!(alloc.committed(), REGION);
        assert!(!alloc.region_of(a).has_flag(RegionFlags::HUGE));
    }

    #[test]
    fn huge_run_tops_stay_inside_their_regions() {
        let alloc = allocator(8);
        let huge = HugeObjectSpace::new(alloc.clone(), 8 * REGION);
        let size = REGION + REGION / 2;
        let a = huge.allocate(size).unwrap();
        let run = alloc.run_of(alloc.region_of(a));
        assert_eq!(run.len(), 2);
        assert_eq!(run[0].top(), run[0].end());
        assert_eq!(run[1].top(), run[1].begin() + REGION / 2);
        assert_eq!(huge.heap_object_size(), size);
        assert_eq!(huge.sweep(), 2 * REGION);
        assert_eq!(huge.heap_object_size(), 0);
    }
}
