//! Regions and the region allocator.
//!
//! The heap reserves one region-aligned mapping up front and carves it into
//! equally sized regions. Every region has a side-table entry holding its
//! flags, allocation top, mark bitmap and the two remembered sets. Huge
//! objects take a run of consecutive regions; the head carries the object,
//! every region of the run keeps its own remembered sets.

use std::sync::atomic::{AtomicU8, AtomicU32, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::{GcBitset, SpaceType, system::{self, AlignedMapping}};

pub type RegionId = u32;
pub const NO_REGION: RegionId = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct RegionFlags(pub u32);

impl RegionFlags {
    pub const NONE: Self = Self(0);
    pub const YOUNG: Self = Self(1 << 0);
    pub const OLD: Self = Self(1 << 1);
    pub const NON_MOVABLE: Self = Self(1 << 2);
    pub const HUGE: Self = Self(1 << 3);
    pub const MACHINE_CODE: Self = Self(1 << 4);
    pub const SNAPSHOT: Self = Self(1 << 5);
    /// Part of the current partial-GC collection set.
    pub const IN_CSET: Self = Self(1 << 6);
    /// Contains the semi-space water line.
    pub const HAS_AGE_MARK: Self = Self(1 << 7);
    /// Lies entirely below the semi-space water line.
    pub const BELOW_AGE_MARK: Self = Self(1 << 8);
    /// Objects in this region move during the running collection.
    pub const EVACUATING: Self = Self(1 << 9);
    /// `live_bytes` was computed by the last sweep.
    pub const HAS_LIVE_INFO: Self = Self(1 << 10);

    #[inline(always)]
    pub const fn contains(self, flag: Self) -> bool {
        self.0 & flag.0 == flag.0
    }

    #[inline(always)]
    pub const fn intersects(self, flag: Self) -> bool {
        self.0 & flag.0 != 0
    }

    #[inline(always)]
    pub const fn with(self, flag: Self) -> Self {
        Self(self.0 | flag.0)
    }

    #[inline(always)]
    pub const fn without(self, flag: Self) -> Self {
        Self(self.0 & !flag.0)
    }
}

pub struct Region {
    id: RegionId,
    begin: usize,
    end: usize,
    flags: AtomicU32,
    space: AtomicU8,
    top: AtomicUsize,
    live_bytes: AtomicUsize,
    run_len: AtomicU32,
    pub(crate) prev: AtomicU32,
    pub(crate) next: AtomicU32,
    mark_bitmap: GcBitset,
    old_to_new: GcBitset,
    cross_region: GcBitset,
}

impl Region {
    fn new(id: RegionId, begin: usize, size: usize) -> Self {
        let bits = size / object::WORD_SIZE;
        Self {
            id,
            begin,
            end: begin + size,
            flags: AtomicU32::new(0),
            space: AtomicU8::new(SpaceType::None as u8),
            top: AtomicUsize::new(begin),
            live_bytes: AtomicUsize::new(0),
            run_len: AtomicU32::new(0),
            prev: AtomicU32::new(NO_REGION),
            next: AtomicU32::new(NO_REGION),
            mark_bitmap: GcBitset::new(bits),
            old_to_new: GcBitset::new(bits),
            cross_region: GcBitset::new(bits),
        }
    }

    #[inline(always)]
    pub fn id(&self) -> RegionId {
        self.id
    }

    #[inline(always)]
    pub fn begin(&self) -> usize {
        self.begin
    }

    #[inline(always)]
    pub fn end(&self) -> usize {
        self.end
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.end - self.begin
    }

    #[inline(always)]
    pub fn contains(&self, addr: usize) -> bool {
        (self.begin..self.end).contains(&addr)
    }

    #[inline(always)]
    fn bit(&self, addr: usize) -> usize {
        debug_assert!(self.contains(addr), "0x{addr:x} outside region {}", self.id);
        (addr - self.begin) / object::WORD_SIZE
    }

    #[inline(always)]
    fn addr_of(&self, bit: usize) -> usize {
        self.begin + bit * object::WORD_SIZE
    }

    // ── flags ──────────────────────────────────────────────────────

    #[inline(always)]
    pub fn flags(&self) -> RegionFlags {
        RegionFlags(self.flags.load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn has_flag(&self, flag: RegionFlags) -> bool {
        self.flags().contains(flag)
    }

    #[inline(always)]
    pub fn set_flag(&self, flag: RegionFlags) {
        self.flags.fetch_or(flag.0, Ordering::AcqRel);
    }

    #[inline(always)]
    pub fn clear_flag(&self, flag: RegionFlags) {
        self.flags.fetch_and(!flag.0, Ordering::AcqRel);
    }

    #[inline(always)]
    pub fn is_young(&self) -> bool {
        self.has_flag(RegionFlags::YOUNG)
    }

    #[inline(always)]
    pub fn in_cset(&self) -> bool {
        self.has_flag(RegionFlags::IN_CSET)
    }

    #[inline(always)]
    pub fn is_evacuating(&self) -> bool {
        self.has_flag(RegionFlags::EVACUATING)
    }

    #[inline(always)]
    pub fn is_snapshot(&self) -> bool {
        self.has_flag(RegionFlags::SNAPSHOT)
    }

    /// Young or in the collection set: objects here are copied by a partial GC.
    #[inline(always)]
    pub fn is_young_or_cset(&self) -> bool {
        self.flags().intersects(RegionFlags::YOUNG.with(RegionFlags::IN_CSET))
    }

    pub fn space_type(&self) -> SpaceType {
        SpaceType::from(self.space.load(Ordering::Acquire))
    }

    pub(crate) fn set_space_type(&self, space: SpaceType) {
        self.space.store(space as u8, Ordering::Release);
    }

    // ── allocation bookkeeping ─────────────────────────────────────

    /// End of the allocated part for linearly allocated regions.
    #[inline(always)]
    pub fn top(&self) -> usize {
        self.top.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub(crate) fn set_top(&self, top: usize) {
        debug_assert!(top >= self.begin && top <= self.end);
        self.top.store(top, Ordering::Release);
    }

    #[inline(always)]
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub(crate) fn set_live_bytes(&self, bytes: usize) {
        self.live_bytes.store(bytes, Ordering::Relaxed);
    }

    /// Number of regions in a huge-object run headed by this region.
    #[inline(always)]
    pub fn run_len(&self) -> u32 {
        self.run_len.load(Ordering::Relaxed)
    }

    // ── mark bitmap ────────────────────────────────────────────────

    /// Marks the object at `addr`. Returns `true` for the first marker.
    #[inline(always)]
    pub fn atomic_mark(&self, addr: usize) -> bool {
        self.mark_bitmap.atomic_test_and_set(self.bit(addr))
    }

    #[inline(always)]
    pub fn mark(&self, addr: usize) {
        self.mark_bitmap.set(self.bit(addr));
    }

    #[inline(always)]
    pub fn is_marked(&self, addr: usize) -> bool {
        self.mark_bitmap.test(self.bit(addr))
    }

    pub fn clear_mark_bitmap(&self) {
        self.mark_bitmap.clear_all();
    }

    pub fn mark_bitmap_is_clear(&self) -> bool {
        self.mark_bitmap.is_clear()
    }

    /// Visits every marked object start in address order.
    pub fn iterate_marked_objects(&self, mut visitor: impl FnMut(usize)) {
        self.mark_bitmap.iterate(|bit| visitor(self.addr_of(bit)));
    }

    // ── remembered sets ────────────────────────────────────────────

    #[inline(always)]
    pub fn insert_old_to_new(&self, slot: usize) {
        self.old_to_new.set(self.bit(slot));
    }

    #[inline(always)]
    pub fn has_old_to_new(&self, slot: usize) -> bool {
        self.old_to_new.test(self.bit(slot))
    }

    /// Visits recorded slots; entries for which `visitor` returns `false` are dropped.
    pub fn iterate_old_to_new(&self, mut visitor: impl FnMut(usize) -> bool) {
        self.old_to_new.iterate_and_retain(|bit| visitor(self.addr_of(bit)));
    }

    pub fn clear_old_to_new(&self) {
        self.old_to_new.clear_all();
    }

    pub fn old_to_new_count(&self) -> usize {
        self.old_to_new.count()
    }

    #[inline(always)]
    pub fn insert_cross_region(&self, slot: usize) {
        self.cross_region.set(self.bit(slot));
    }

    pub fn iterate_cross_region(&self, mut visitor: impl FnMut(usize)) {
        self.cross_region.iterate(|bit| visitor(self.addr_of(bit)));
    }

    pub fn clear_cross_region(&self) {
        self.cross_region.clear_all();
    }

    /// Drops remembered-set entries for slots in `[from, to)`, which is about
    /// to become free memory.
    pub fn clear_rsets_in_range(&self, from: usize, to: usize) {
        if from >= to {
            return;
        }
        let (a, b) = (self.bit(from), (to - self.begin) / object::WORD_SIZE);
        self.old_to_new.clear_range(a, b);
        self.cross_region.clear_range(a, b);
    }

    fn reset(&self) {
        self.flags.store(0, Ordering::Release);
        self.set_space_type(SpaceType::None);
        self.top.store(self.begin, Ordering::Release);
        self.live_bytes.store(0, Ordering::Relaxed);
        self.run_len.store(0, Ordering::Relaxed);
        self.prev.store(NO_REGION, Ordering::Relaxed);
        self.next.store(NO_REGION, Ordering::Relaxed);
        self.mark_bitmap.clear_all();
        self.old_to_new.clear_all();
        self.cross_region.clear_all();
    }
}

impl core::fmt::Debug for Region {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Region")
            .field("id", &self.id)
            .field("begin", &format_args!("0x{:x}", self.begin))
            .field("space", &self.space_type())
            .field("flags", &self.flags())
            .field("live", &self.live_bytes())
            .finish()
    }
}

// ── Region allocator ──────────────────────────────────────────────────

/// Owns the reserved heap range and hands out regions.
pub struct HeapRegionAllocator {
    mapping: AlignedMapping,
    region_size: usize,
    regions: Box<[Region]>,
    free: Mutex<Vec<bool>>,
    committed: AtomicUsize,
}

impl HeapRegionAllocator {
    pub fn new(max_heap_size: usize, region_size: usize) -> Self {
        let mapping = system::map_aligned(max_heap_size, region_size)
            .unwrap_or_else(|| panic!("failed to reserve {max_heap_size} bytes of heap"));
        let count = max_heap_size / region_size;
        let regions = (0..count)
            .map(|i| Region::new(i as RegionId, mapping.start() + i * region_size, region_size))
            .collect();
        log::debug!(
            "reserved heap at 0x{:x} with {count} regions of {region_size} bytes",
            mapping.start()
        );
        Self {
            mapping,
            region_size,
            regions,
            free: Mutex::new(vec![true; count]),
            committed: AtomicUsize::new(0),
        }
    }

    #[inline(always)]
    pub fn region_size(&self) -> usize {
        self.region_size
    }

    #[inline(always)]
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Total size of regions currently handed out.
    #[inline(always)]
    pub fn committed(&self) -> usize {
        self.committed.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn contains(&self, addr: usize) -> bool {
        (self.mapping.start()..self.mapping.end()).contains(&addr)
    }

    #[inline(always)]
    pub fn region(&self, id: RegionId) -> &Region {
        &self.regions[id as usize]
    }

    /// The region containing `addr`.
    #[inline(always)]
    pub fn region_of(&self, addr: usize) -> &Region {
        debug_assert!(self.contains(addr), "0x{addr:x} is not a heap address");
        &self.regions[(addr - self.mapping.start()) / self.region_size]
    }

    pub fn allocate_region(&self, flags: RegionFlags) -> Option<&Region> {
        let index = {
            let mut free = self.free.lock();
            let index = free.iter().position(|&f| f)?;
            free[index] = false;
            index
        };
        let region = &self.regions[index];
        region.flags.store(flags.0, Ordering::Release);
        self.committed.fetch_add(self.region_size, Ordering::Relaxed);
        Some(region)
    }

    /// Allocates `count` consecutive regions. Returns the head.
    pub fn allocate_run(&self, count: usize, flags: RegionFlags) -> Option<&Region> {
        debug_assert!(count > 0);
        let start = {
            let mut free = self.free.lock();
            let start = free.windows(count).position(|w| w.iter().all(|&f| f))?;
            free[start..start + count].fill(false);
            start
        };
        for region in &self.regions[start..start + count] {
            region.flags.store(flags.0, Ordering::Release);
        }
        let head = &self.regions[start];
        head.run_len.store(count as u32, Ordering::Relaxed);
        self.committed
            .fetch_add(count * self.region_size, Ordering::Relaxed);
        Some(head)
    }

    /// Returns a region (or a whole huge run when given its head) to the pool.
    ///
    /// Marks and remembered sets are cleared here so a reused region never
    /// carries stale entries into the next cycle.
    pub fn free_region(&self, region: &Region) {
        let count = region.run_len().max(1) as usize;
        let start = region.id as usize;
        for r in &self.regions[start..start + count] {
            r.reset();
        }
        self.free.lock()[start..start + count].fill(true);
        self.committed
            .fetch_sub(count * self.region_size, Ordering::Relaxed);
    }

    pub fn free_region_count(&self) -> usize {
        self.free.lock().iter().filter(|&&f| f).count()
    }

    /// Regions making up the run headed by `head` (just `head` for normal regions).
    pub fn run_of(&self, head: &Region) -> &[Region] {
        let count = head.run_len().max(1) as usize;
        &self.regions[head.id as usize..head.id as usize + count]
    }
}

impl core::fmt::Debug for HeapRegionAllocator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HeapRegionAllocator")
            .field("start", &format_args!("0x{:x}", self.mapping.start()))
            .field("regions", &self.regions.len())
            .field("committed", &self.committed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGION: usize = 64 * 1024;

    #[test]
    fn regions_are_aligned_and_found_by_address() {
        let alloc = HeapRegionAllocator::new(8 * REGION, REGION);
        let r = alloc.allocate_region(RegionFlags::YOUNG).unwrap();
        assert_eq!(r.begin() % REGION, 0);
        assert!(r.is_young());
        assert_eq!(alloc.region_of(r.begin() + 100).id(), r.id());
        assert_eq!(alloc.committed(), REGION);
    }

    #[test]
    fn free_region_clears_side_tables() {
        let alloc = HeapRegionAllocator::new(4 * REGION, REGION);
        let r = alloc.allocate_region(RegionFlags::OLD).unwrap();
        r.mark(r.begin());
        r.insert_old_to_new(r.begin() + 16);
        r.insert_cross_region(r.begin() + 24);
        alloc.free_region(r);
        assert!(r.mark_bitmap_is_clear());
        assert_eq!(r.old_to_new_count(), 0);
        assert_eq!(r.flags(), RegionFlags::NONE);
        assert_eq!(alloc.committed(), 0);
        assert_eq!(alloc.free_region_count(), 4);
    }

    #[test]
    fn huge_runs_are_contiguous() {
        let alloc = HeapRegionAllocator::new(8 * REGION, REGION);
        let single = alloc.allocate_region(RegionFlags::OLD).unwrap();
        let head = alloc.allocate_run(3, RegionFlags::HUGE).unwrap();
        assert_eq!(head.run_len(), 3);
        assert_eq!(alloc.run_of(head).len(), 3);
        assert_eq!(alloc.region_of(head.begin() + 2 * REGION + 8).id(), head.id() + 2);
        alloc.free_region(head);
        assert_eq!(alloc.free_region_count(), 7);
        alloc.free_region(single);
        assert!(alloc.allocate_run(8, RegionFlags::HUGE).is_some());
    }

    #[test]
    fn rsets_cleared_in_range() {
        let alloc = HeapRegionAllocator::new(2 * REGION, REGION);
        let r = alloc.allocate_region(RegionFlags::OLD).unwrap();
        for off in [16, 24, 32, 40] {
            r.insert_old_to_new(r.begin() + off);
        }
        r.clear_rsets_in_range(r.begin() + 24, r.begin() + 40);
        let mut seen = Vec::new();
        r.iterate_old_to_new(|slot| {
            seen.push(slot - r.begin());
            true
        });
        assert_eq!(seen, vec![16, 40]);
    }
}
