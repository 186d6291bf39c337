//! Generational region heap.
//!
//! [`HeapInner`] owns every space, the work manager, the concurrent marker
//! and the GC task pool. It routes allocation requests, runs the write
//! barrier, decides which collection to run and adapts the allocation
//! limits afterwards. [`Heap`] is the cheaply clonable handle the VM holds;
//! posted GC tasks keep their own clone alive.
//!
//! The heap serves one mutator at a time, which always uses work-manager
//! thread index [`MAIN_THREAD_INDEX`]. GC workers use indices from 1.
//!
//! Consumers provide:
//! - [`RootProvider`]s that report root slots at collection time.
//! - Objects laid out by the `object` crate, whose slots the collector can
//!   enumerate on its own.

use std::{
    cell::RefCell,
    ops::Deref,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
    },
    time::Instant,
};

use parking_lot::{Condvar, Mutex, RwLock};

use object::{
    MIN_OBJECT_SIZE, ObjectSlot, ObjectType, SlotKind, Value, WORD_SIZE, align_to_word,
    field_slot, init_object,
};

use crate::{
    CompressGcMarker, ConcurrentMarker, EvacuationWork, Evacuator, GcKind, GcStats,
    GlobalHandles, HeapRegionAllocator, HeapSettings, HugeObjectSpace, Marker, MemController,
    MemGrowingType, NonMovableMarker, Region, RegionFlags, Root, RootProvider, SemiGcMarker,
    SemiSpace, SnapshotSpace, Space, SpaceType, SparseSpace, TaskPool, WorkManager,
    mem_controller::AllocationSample,
};

/// The mutator's index into the work manager.
pub const MAIN_THREAD_INDEX: u32 = 0;

/// Semi-space growth allowed past the trigger while a concurrent mark runs,
/// in regions.
const SEMI_OVERSHOOT_REGIONS: usize = 4;

// ── Public API types ──────────────────────────────────────────────────

/// The collection a caller asks for; the heap maps it onto a [`GcKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerGcType {
    Young,
    Old,
    Full,
}

/// What the running (or next) mark traces.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkType {
    /// Young objects only; old-to-new sets act as roots.
    Young = 0,
    /// The whole heap; the old generation is swept afterwards.
    Full = 1,
}

/// Work handed to GC worker threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParallelGcTaskPhase {
    SemiHandleGlobalPool,
    OldHandleGlobalPool,
    CompressHandleGlobalPool,
    ConcurrentHandleGlobalPool,
    EvacuateRegions,
    UpdateReferences,
}

impl ParallelGcTaskPhase {
    fn is_marking(self) -> bool {
        !matches!(self, Self::EvacuateRegions | Self::UpdateReferences)
    }
}

// ── Heap ──────────────────────────────────────────────────────────────

pub struct HeapInner {
    pub settings: HeapSettings,
    regions: Arc<HeapRegionAllocator>,
    semi: [SemiSpace; 2],
    active_semi: AtomicU8,
    /// The inactive half is the compaction target of a full collection.
    old: [SparseSpace; 2],
    active_old: AtomicU8,
    non_movable: SparseSpace,
    machine_code: SparseSpace,
    huge: HugeObjectSpace,
    snapshot: SnapshotSpace,

    pub(crate) work_manager: WorkManager,
    pub(crate) concurrent_marker: ConcurrentMarker,
    pub(crate) evacuation: EvacuationWork,
    mem_controller: Mutex<MemController>,
    stats: Mutex<GcStats>,
    task_pool: TaskPool,

    gc_lock: Mutex<()>,
    roots: RwLock<Vec<Arc<dyn RootProvider>>>,
    global_handles: Arc<GlobalHandles>,

    mark_type: AtomicU8,
    /// Set while a concurrent mark runs; enables the marking barrier and
    /// black allocation.
    marking: AtomicBool,
    concurrent_marking_enabled: AtomicBool,
    disable_concurrent_mark_requested: AtomicBool,
    full_gc_requested: AtomicBool,
    old_space_limit_adjusted: AtomicBool,
    global_space_alloc_limit: AtomicUsize,
    memory_growing: AtomicU8,

    running_tasks: Mutex<usize>,
    tasks_finished: Condvar,
    max_mark_tasks: AtomicUsize,
    max_evacuate_tasks: AtomicUsize,

    pub(crate) promoted_size: AtomicUsize,
    pub(crate) semi_copied_size: AtomicUsize,
    destroyed: AtomicBool,
    self_ref: Weak<HeapInner>,
}

impl HeapInner {
    fn new(settings: HeapSettings, self_ref: Weak<HeapInner>) -> Self {
        settings.validate().expect("Invalid Heap Settings");

        let regions = Arc::new(HeapRegionAllocator::new(
            settings.max_heap_size,
            settings.region_size,
        ));
        let semi = || {
            SemiSpace::new(
                regions.clone(),
                settings.semi_space_initial_capacity,
                settings.semi_space_max_capacity,
            )
        };
        let old = || {
            SparseSpace::new(
                SpaceType::Old,
                RegionFlags::OLD,
                regions.clone(),
                settings.old_space_initial_capacity,
                settings.old_space_max_capacity,
            )
        };
        let semi = [semi(), semi()];
        let old = [old(), old()];
        let non_movable = SparseSpace::new(
            SpaceType::NonMovable,
            RegionFlags::NON_MOVABLE,
            regions.clone(),
            settings.non_movable_space_capacity,
            settings.non_movable_space_capacity,
        );
        let machine_code = SparseSpace::new(
            SpaceType::MachineCode,
            RegionFlags::MACHINE_CODE,
            regions.clone(),
            settings.machine_code_space_capacity,
            settings.machine_code_space_capacity,
        );
        let huge = HugeObjectSpace::new(regions.clone(), settings.old_space_max_capacity);
        let snapshot = SnapshotSpace::new(regions.clone(), settings.snapshot_space_capacity);

        let workers = settings.parallel_gc_threads;
        let task_pool = TaskPool::new(workers).expect("spawn gc worker threads");
        let global_handles = Arc::new(GlobalHandles::new());
        let global_limit = settings.max_heap_size - settings.semi_space_initial_capacity;

        log::info!(
            "heap initialized: max {} semi {}..{} old {}..{} non-movable {} machine code {} \
             snapshot {} global limit {global_limit} gc threads {workers}",
            settings.max_heap_size,
            settings.semi_space_initial_capacity,
            settings.semi_space_max_capacity,
            settings.old_space_initial_capacity,
            settings.old_space_max_capacity,
            settings.non_movable_space_capacity,
            settings.machine_code_space_capacity,
            settings.snapshot_space_capacity,
        );

        let roots: Vec<Arc<dyn RootProvider>> = vec![global_handles.clone()];
        Self {
            regions,
            semi,
            active_semi: AtomicU8::new(0),
            old,
            active_old: AtomicU8::new(0),
            non_movable,
            machine_code,
            huge,
            snapshot,
            work_manager: WorkManager::new(workers + 1, settings.work_node_capacity),
            concurrent_marker: ConcurrentMarker::new(),
            evacuation: EvacuationWork::default(),
            mem_controller: Mutex::new(MemController::new(settings.min_growing_step)),
            stats: Mutex::new(GcStats::default()),
            task_pool,
            gc_lock: Mutex::new(()),
            roots: RwLock::new(roots),
            global_handles,
            mark_type: AtomicU8::new(MarkType::Young as u8),
            marking: AtomicBool::new(false),
            concurrent_marking_enabled: AtomicBool::new(settings.concurrent_marking),
            disable_concurrent_mark_requested: AtomicBool::new(false),
            full_gc_requested: AtomicBool::new(false),
            old_space_limit_adjusted: AtomicBool::new(false),
            global_space_alloc_limit: AtomicUsize::new(global_limit),
            memory_growing: AtomicU8::new(MemGrowingType::HighThroughput as u8),
            running_tasks: Mutex::new(0),
            tasks_finished: Condvar::new(),
            max_mark_tasks: AtomicUsize::new(settings.max_mark_tasks()),
            max_evacuate_tasks: AtomicUsize::new(workers),
            promoted_size: AtomicUsize::new(0),
            semi_copied_size: AtomicUsize::new(0),
            destroyed: AtomicBool::new(false),
            self_ref,
            settings,
        }
    }

    /// Waits for background work, stops the workers and releases every
    /// region. Only the first call does anything.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.concurrent_marker.wait_marking_finished();
        self.wait_running_task_finished();
        self.task_pool.shutdown();
        self.set_marking(false);
        for semi in &self.semi {
            semi.reclaim();
        }
        for old in &self.old {
            old.reclaim_cset();
            old.reclaim();
        }
        self.non_movable.reclaim();
        self.machine_code.reclaim();
        self.huge.reclaim();
        self.snapshot.reclaim();
        log::debug!("heap destroyed");
    }

    // ── spaces ──────────────────────────────────────────────────────

    #[inline(always)]
    pub fn region_allocator(&self) -> &HeapRegionAllocator {
        &self.regions
    }

    #[inline(always)]
    pub fn region_of(&self, addr: usize) -> &Region {
        self.regions.region_of(addr)
    }

    /// Where the mutator allocates young objects.
    #[inline(always)]
    pub fn active_semi_space(&self) -> &SemiSpace {
        &self.semi[self.active_semi.load(Ordering::Acquire) as usize]
    }

    /// The evacuated half during a collection; empty otherwise.
    #[inline(always)]
    pub fn inactive_semi_space(&self) -> &SemiSpace {
        &self.semi[1 - self.active_semi.load(Ordering::Acquire) as usize]
    }

    #[inline(always)]
    pub fn old_space(&self) -> &SparseSpace {
        &self.old[self.active_old.load(Ordering::Acquire) as usize]
    }

    #[inline(always)]
    pub fn compress_space(&self) -> &SparseSpace {
        &self.old[1 - self.active_old.load(Ordering::Acquire) as usize]
    }

    pub fn non_movable_space(&self) -> &SparseSpace {
        &self.non_movable
    }

    pub fn machine_code_space(&self) -> &SparseSpace {
        &self.machine_code
    }

    pub fn huge_object_space(&self) -> &HugeObjectSpace {
        &self.huge
    }

    pub fn snapshot_space(&self) -> &SnapshotSpace {
        &self.snapshot
    }

    /// Makes the empty semi space the allocation target. The old active
    /// space becomes the from-space of the running collection.
    pub(crate) fn swap_semi_spaces(&self) {
        let from = self.active_semi.load(Ordering::Acquire) as usize;
        let to = &self.semi[1 - from];
        debug_assert_eq!(to.space().region_count(), 0, "to-space is not empty");
        to.space()
            .set_initial_capacity(self.semi[from].space().initial_capacity());
        self.active_semi.fetch_xor(1, Ordering::AcqRel);
    }

    /// Makes the compaction target the old space.
    pub(crate) fn swap_old_spaces(&self) {
        let old = self.old_space().space();
        let compress = self.compress_space().space();
        compress.set_initial_capacity(old.initial_capacity());
        compress.set_maximum_capacity(old.maximum_capacity());
        self.active_old.fetch_xor(1, Ordering::AcqRel);
    }

    /// Every old, non-movable, machine-code and huge region (tails
    /// included), plus the collection set.
    pub(crate) fn enumerate_non_young_regions(&self, visitor: &mut dyn FnMut(&Region)) {
        self.old_space().space().enumerate_regions(&mut *visitor);
        for id in self.old_space().cset_regions() {
            visitor(self.regions.region(id));
        }
        self.non_movable.space().enumerate_regions(&mut *visitor);
        self.machine_code.space().enumerate_regions(&mut *visitor);
        self.huge.enumerate_all_regions(visitor);
    }

    pub(crate) fn enumerate_snapshot_regions(&self, visitor: &mut dyn FnMut(&Region)) {
        self.snapshot.space().enumerate_regions(visitor);
    }

    // ── sizes and statistics ────────────────────────────────────────

    pub fn heap_object_size(&self) -> usize {
        self.active_semi_space().heap_object_size()
            + self.old_space().heap_object_size()
            + self.non_movable.heap_object_size()
            + self.machine_code.heap_object_size()
            + self.huge.heap_object_size()
            + self.snapshot.heap_object_size()
    }

    pub fn committed_size(&self) -> usize {
        self.active_semi_space().committed_size()
            + self.old_space().committed_size()
            + self.non_movable.committed_size()
            + self.machine_code.committed_size()
            + self.huge.committed_size()
            + self.snapshot.space().committed_size()
    }

    pub fn global_space_alloc_limit(&self) -> usize {
        self.global_space_alloc_limit.load(Ordering::Relaxed)
    }

    pub fn gc_stats(&self) -> GcStats {
        self.stats.lock().clone()
    }

    pub(crate) fn record_stats(&self, record: impl FnOnce(&mut GcStats)) {
        record(&mut self.stats.lock());
    }

    pub fn print_statistic_result(&self) {
        self.stats.lock().print_statistic_result();
    }

    /// Logs the occupancy of every space; at error level when `is_error`.
    pub fn print_heap_statistic_result(&self, is_error: bool) {
        let level = if is_error { log::Level::Error } else { log::Level::Debug };
        let line = |name: &str, space: &Space, live: usize| {
            log::log!(
                level,
                "  {name:<12} regions {:>5} committed {:>10} live {live:>10} capacity {:>10} / {:>10}",
                space.region_count(),
                space.committed_size(),
                space.initial_capacity(),
                space.maximum_capacity(),
            );
        };
        log::log!(level, "heap statistics:");
        let semi = self.active_semi_space();
        line("semi", semi.space(), semi.heap_object_size());
        line("old", self.old_space().space(), self.old_space().heap_object_size());
        line("non-movable", self.non_movable.space(), self.non_movable.heap_object_size());
        line("machine-code", self.machine_code.space(), self.machine_code.heap_object_size());
        line("huge", self.huge.space(), self.huge.heap_object_size());
        line("snapshot", self.snapshot.space(), self.snapshot.heap_object_size());
        log::log!(
            level,
            "  total committed {} live {} global limit {} free regions {}",
            self.committed_size(),
            self.heap_object_size(),
            self.global_space_alloc_limit(),
            self.regions.free_region_count()
        );
    }

    // ── roots ───────────────────────────────────────────────────────

    pub fn global_handles(&self) -> &GlobalHandles {
        &self.global_handles
    }

    pub fn add_root_provider(&self, provider: Arc<dyn RootProvider>) {
        self.roots.write().push(provider);
    }

    pub fn remove_root_provider(&self, provider: &Arc<dyn RootProvider>) {
        self.roots.write().retain(|p| !Arc::ptr_eq(p, provider));
    }

    /// Visits every root slot. Ranges are expanded slot by slot.
    pub(crate) fn visit_roots(&self, visitor: &mut dyn FnMut(ObjectSlot)) {
        let visitor = RefCell::new(visitor);
        for provider in self.roots.read().iter() {
            provider.visit_roots(
                &mut |_: Root, slot| (**visitor.borrow_mut())(slot),
                &mut |_: Root, start, end| {
                    let mut visit = visitor.borrow_mut();
                    let mut cur = start.address();
                    while cur < end.address() {
                        (**visit)(ObjectSlot(cur));
                        cur += WORD_SIZE;
                    }
                },
            );
        }
    }

    pub(crate) fn sweep_weak_roots(&self, resolve: &dyn Fn(usize) -> Option<usize>) {
        for provider in self.roots.read().iter() {
            provider.sweep_weak_roots(resolve);
        }
    }

    // ── mark state ──────────────────────────────────────────────────

    #[inline(always)]
    pub fn mark_type(&self) -> MarkType {
        match self.mark_type.load(Ordering::Acquire) {
            0 => MarkType::Young,
            _ => MarkType::Full,
        }
    }

    pub(crate) fn set_mark_type(&self, mark_type: MarkType) {
        self.mark_type.store(mark_type as u8, Ordering::Release);
    }

    #[inline(always)]
    pub fn is_full_mark(&self) -> bool {
        self.mark_type() == MarkType::Full
    }

    #[inline(always)]
    pub fn is_marking(&self) -> bool {
        self.marking.load(Ordering::Acquire)
    }

    pub(crate) fn set_marking(&self, marking: bool) {
        self.marking.store(marking, Ordering::Release);
    }

    pub fn is_concurrent_marking_enabled(&self) -> bool {
        self.concurrent_marking_enabled.load(Ordering::Acquire)
    }

    pub fn concurrent_marker(&self) -> &ConcurrentMarker {
        &self.concurrent_marker
    }

    /// Resets the work manager and clears the mark bitmaps the coming mark
    /// will fill. A full mark also picks the collection set and drops the
    /// cross-region sets. Sweep boundaries are recorded for every sparse
    /// space so regions added while marking are left alone.
    pub(crate) fn prepare_marking(&self) {
        self.work_manager.initialize();
        let full = self.is_full_mark();
        if full && self.old_space().cset_regions().is_empty() {
            self.old_space().select_cset(
                self.settings.min_cset_regions,
                self.settings.max_cset_regions,
                self.settings.most_alive_rate,
            );
        }
        self.active_semi_space()
            .space()
            .enumerate_regions(|r| r.clear_mark_bitmap());
        if full {
            self.enumerate_non_young_regions(&mut |r| {
                r.clear_mark_bitmap();
                r.clear_cross_region();
            });
            self.enumerate_snapshot_regions(&mut |r| r.clear_cross_region());
        }
        self.old_space().space().set_record_region();
        self.non_movable.space().set_record_region();
        self.machine_code.space().set_record_region();
        log::trace!("prepared {:?} mark", self.mark_type());
    }

    /// Where the object at `addr` lives after evacuation, or `None` if it
    /// is dead. With `marks_valid` unset the mark bitmaps of unmoved
    /// regions are ignored and such objects count as alive.
    pub(crate) fn resolve_weak(&self, addr: usize, marks_valid: bool) -> Option<usize> {
        let region = self.region_of(addr);
        if region.is_evacuating() {
            // SAFETY: evacuating regions still hold their from-space objects.
            return unsafe { object::MarkWord::load(addr) }.forwarding_address();
        }
        if region.is_young() || region.is_snapshot() || !marks_valid {
            return Some(addr);
        }
        region.is_marked(addr).then_some(addr)
    }

    // ── allocation ──────────────────────────────────────────────────

    #[inline(always)]
    fn object_size(size: usize) -> usize {
        align_to_word(size).max(MIN_OBJECT_SIZE)
    }

    fn finish_allocation(&self, addr: usize, object_type: ObjectType, size: usize) -> Value {
        // SAFETY: `addr` was just carved out of a space with room for `size` bytes.
        unsafe { init_object(addr, object_type, size) };
        if self.is_marking() {
            let region = self.region_of(addr);
            if !region.is_snapshot() {
                region.mark(addr);
            }
        }
        Value::from_addr(addr)
    }

    /// Allocates a young object, or a huge one at or above the huge
    /// threshold. Collects and retries when the young generation is full.
    pub fn allocate_young_or_huge(&self, object_type: ObjectType, size: usize) -> Value {
        let size = Self::object_size(size);
        if size >= self.settings.huge_object_threshold {
            return self.allocate_huge(object_type, size);
        }
        let addr = match self.active_semi_space().allocate(size) {
            Some(addr) => addr,
            None => self.allocate_young_slow(size),
        };
        self.finish_allocation(addr, object_type, size)
    }

    fn try_allocate_young(&self, size: usize) -> Option<usize> {
        let semi = self.active_semi_space();
        semi.allocate(size)
            .or_else(|| if semi.expand() { semi.allocate(size) } else { None })
    }

    fn allocate_young_slow(&self, size: usize) -> usize {
        let semi = self.active_semi_space();
        if semi.expand() {
            self.try_trigger_concurrent_marking();
            if let Some(addr) = self.active_semi_space().allocate(size) {
                return addr;
            }
        }
        if self.is_marking()
            && semi.expand_overshoot(self.settings.region_size * SEMI_OVERSHOOT_REGIONS)
        {
            if let Some(addr) = semi.allocate(size) {
                return addr;
            }
        }
        if self.concurrent_marker.is_marking_finished() {
            self.handle_marking_finished();
            if let Some(addr) = self.try_allocate_young(size) {
                return addr;
            }
        }
        self.collect_garbage(self.select_gc_type());
        if let Some(addr) = self.try_allocate_young(size) {
            return addr;
        }
        self.collect_garbage(TriggerGcType::Full);
        self.try_allocate_young(size)
            .unwrap_or_else(|| self.throw_out_of_memory_error(size, "allocate_young_or_huge"))
    }

    pub fn allocate_old_or_huge(&self, object_type: ObjectType, size: usize) -> Value {
        let size = Self::object_size(size);
        if size >= self.settings.huge_object_threshold {
            return self.allocate_huge(object_type, size);
        }
        let addr = self
            .old_space()
            .try_allocate(size)
            .or_else(|| {
                self.check_and_trigger_old_gc();
                self.old_space().allocate(size)
            })
            .or_else(|| {
                self.collect_garbage(TriggerGcType::Old);
                self.old_space().allocate(size)
            })
            .unwrap_or_else(|| self.throw_out_of_memory_error(size, "allocate_old_or_huge"));
        self.finish_allocation(addr, object_type, size)
    }

    pub fn allocate_non_movable(&self, object_type: ObjectType, size: usize) -> Value {
        let size = Self::object_size(size);
        if size >= self.settings.huge_object_threshold {
            return self.allocate_huge(object_type, size);
        }
        let addr = self
            .non_movable
            .allocate(size)
            .or_else(|| {
                self.collect_garbage(TriggerGcType::Old);
                self.non_movable.allocate(size)
            })
            .unwrap_or_else(|| self.throw_out_of_memory_error(size, "allocate_non_movable"));
        self.finish_allocation(addr, object_type, size)
    }

    pub fn allocate_machine_code(&self, size: usize) -> Value {
        let size = Self::object_size(size);
        let addr = self
            .machine_code
            .allocate(size)
            .or_else(|| {
                self.collect_garbage(TriggerGcType::Old);
                self.machine_code.allocate(size)
            })
            .unwrap_or_else(|| self.throw_out_of_memory_error(size, "allocate_machine_code"));
        self.finish_allocation(addr, ObjectType::Code, size)
    }

    pub fn allocate_huge(&self, object_type: ObjectType, size: usize) -> Value {
        let size = Self::object_size(size);
        let addr = self
            .huge
            .allocate(size)
            .or_else(|| {
                self.collect_garbage(TriggerGcType::Old);
                self.huge.allocate(size)
            })
            .unwrap_or_else(|| self.throw_out_of_memory_error(size, "allocate_huge"));
        self.finish_allocation(addr, object_type, size)
    }

    /// Immortal image objects. Never triggers a collection.
    pub fn allocate_snapshot(&self, object_type: ObjectType, size: usize) -> Value {
        let size = Self::object_size(size);
        let addr = self
            .snapshot
            .allocate(size)
            .unwrap_or_else(|| self.throw_out_of_memory_error(size, "allocate_snapshot"));
        self.finish_allocation(addr, object_type, size)
    }

    pub fn throw_out_of_memory_error(&self, size: usize, function: &str) -> ! {
        self.print_heap_statistic_result(true);
        log::error!("OOM when trying to allocate {size} bytes in {function}");
        panic!("out of memory: {size} bytes requested by {function}");
    }

    // ── field access ────────────────────────────────────────────────

    pub fn read_field(&self, holder: Value, index: usize) -> Value {
        debug_assert!(holder.is_object());
        field_slot(holder.addr(), index).load()
    }

    /// Stores `value` into field `index` of `holder`, then runs the barrier.
    pub fn write_field(&self, holder: Value, index: usize, value: Value) {
        debug_assert!(holder.is_object());
        let slot = field_slot(holder.addr(), index);
        slot.store(value);
        self.write_barrier(holder.addr(), slot, value);
    }

    /// Records old-to-new slots. While marking it also records slots that
    /// point into the collection set and shades the stored value.
    pub fn write_barrier(&self, holder: usize, slot: ObjectSlot, value: Value) {
        if !value.is_object() {
            return;
        }
        let holder_region = self.region_of(holder);
        let value_region = self.region_of(value.addr());
        if !holder_region.is_young() && value_region.is_young() {
            self.region_of(slot.address())
                .insert_old_to_new(slot.address());
        }
        if self.is_marking() {
            if value_region.in_cset() && !holder_region.is_young_or_cset() {
                self.region_of(slot.address())
                    .insert_cross_region(slot.address());
            }
            NonMovableMarker::new(self).mark_object(MAIN_THREAD_INDEX, value.addr());
        }
    }

    // ── collection policy ───────────────────────────────────────────

    /// Young while survivors still fit the old generation and the heap is
    /// under its global limit; old otherwise.
    pub fn select_gc_type(&self) -> TriggerGcType {
        if self.is_concurrent_marking_enabled() {
            return TriggerGcType::Young;
        }
        let survivors = self.active_semi_space().survival_object_size();
        if self.old_space().can_expand(survivors)
            && self.heap_object_size() <= self.global_space_alloc_limit()
        {
            TriggerGcType::Young
        } else {
            TriggerGcType::Old
        }
    }

    fn allocation_sample(&self) -> AllocationSample {
        AllocationSample {
            new_space_since_gc: self.active_semi_space().allocated_size_since_gc(),
            huge_object_size: self.huge.heap_object_size(),
            old_total_allocated: self.old_space().total_allocated_size(),
            non_movable_total_allocated: self.non_movable.total_allocated_size(),
            machine_code_total_allocated: self.machine_code.total_allocated_size(),
        }
    }

    pub fn collect_garbage(&self, gc_type: TriggerGcType) {
        let _guard = self.gc_lock.lock();
        let mut gc_type = gc_type;
        if self.settings.full_gc_every_old_gc && gc_type == TriggerGcType::Old {
            gc_type = TriggerGcType::Full;
        }
        if self.full_gc_requested.load(Ordering::Acquire) && self.concurrent_marker.is_ready() {
            gc_type = TriggerGcType::Full;
        }
        let original_new_space_size = self.active_semi_space().heap_object_size();
        self.promoted_size.store(0, Ordering::Relaxed);
        self.mem_controller
            .lock()
            .start_calculation(self.allocation_sample());
        log::debug!(
            "collect garbage {gc_type:?}: live {} committed {} limit {}",
            self.heap_object_size(),
            self.committed_size(),
            self.global_space_alloc_limit()
        );

        let kind = match gc_type {
            TriggerGcType::Young if !self.is_concurrent_marking_enabled() => GcKind::Young,
            TriggerGcType::Young => GcKind::Partial,
            TriggerGcType::Old => {
                if self.is_concurrent_marking_enabled()
                    && self.mark_type() == MarkType::Young
                    && self.check_ongoing_concurrent_marking()
                {
                    self.concurrent_marker.reset(self);
                }
                self.set_mark_type(MarkType::Full);
                GcKind::Partial
            }
            TriggerGcType::Full => {
                self.full_gc_requested.store(false, Ordering::Release);
                GcKind::Full
            }
        };
        let full_mark = kind == GcKind::Partial && self.is_full_mark();
        let mark_duration = self.concurrent_marker.duration_ms();
        kind.run_phases(self);

        let copied = self.active_semi_space().heap_object_size();
        self.semi_copied_size.store(copied, Ordering::Relaxed);
        if original_new_space_size > 0 {
            let promoted = self.promoted_size.load(Ordering::Relaxed);
            let rate = copied as f64 / original_new_space_size as f64
                + promoted as f64 / original_new_space_size as f64;
            self.mem_controller.lock().add_survival_rate(rate.min(1.0));
            self.adjust_old_space_limit();
        }

        self.mem_controller.lock().stop_calculation(
            kind,
            self.heap_object_size(),
            self.promoted_size.load(Ordering::Relaxed),
            self.huge.heap_object_size(),
            full_mark.then_some(mark_duration),
        );

        if kind == GcKind::Full || full_mark {
            self.recompute_limits();
            self.set_mark_type(MarkType::Young);
        }
        self.stats.lock().check_long_pause();
    }

    /// Shrinks the old and global limits towards what survived, until the
    /// first time a limit would have to grow.
    pub fn adjust_old_space_limit(&self) {
        if self.old_space_limit_adjusted.load(Ordering::Acquire) {
            return;
        }
        let survival = self.mem_controller.lock().average_survival_rate();
        let step = self.settings.min_growing_step;
        let old = self.old_space();
        let old_limit = old.space().initial_capacity();
        let new_old_limit = (old.heap_object_size() + step)
            .max((old_limit as f64 * survival) as usize)
            .max(self.settings.min_old_space_limit);
        if new_old_limit <= old_limit {
            old.space().set_initial_capacity(new_old_limit);
        } else {
            self.old_space_limit_adjusted.store(true, Ordering::Release);
        }

        let global_limit = self.global_space_alloc_limit();
        let new_global_limit =
            (self.heap_object_size() + step).max((global_limit as f64 * survival) as usize);
        if new_global_limit < global_limit {
            self.global_space_alloc_limit
                .store(new_global_limit, Ordering::Relaxed);
        }
        log::trace!(
            "old space limit {} global limit {} survival {survival:.2}",
            old.space().initial_capacity(),
            self.global_space_alloc_limit()
        );
    }

    /// Recomputes the old and global limits from mark-compact speed and
    /// old-generation allocation throughput.
    pub fn recompute_limits(&self) {
        let mut mc = self.mem_controller.lock();
        let gc_speed = mc.mark_compact_speed_per_ms();
        let mutator_speed = mc.current_old_space_allocation_throughput_per_ms(0.0);
        let factor = mc.calculate_growing_factor(gc_speed, mutator_speed, self.memory_growing_type());
        let old = self.old_space();
        let old_size = old.heap_object_size() + self.huge.heap_object_size();
        let new_space_capacity = self.active_semi_space().space().initial_capacity();
        let new_old_limit = mc.calculate_alloc_limit(
            old_size,
            self.settings.min_old_space_limit,
            old.space().maximum_capacity(),
            new_space_capacity,
            factor,
        );
        let new_global_limit = mc.calculate_alloc_limit(
            self.heap_object_size(),
            self.settings.old_space_initial_capacity,
            self.settings.max_heap_size - new_space_capacity,
            new_space_capacity,
            factor,
        );
        drop(mc);
        old.space().set_initial_capacity(new_old_limit);
        self.global_space_alloc_limit
            .store(new_global_limit, Ordering::Relaxed);
        log::debug!(
            "recomputed limits: factor {factor:.2} old {new_old_limit} global {new_global_limit}"
        );
    }

    pub fn check_and_trigger_old_gc(&self) {
        if self.heap_object_size() > self.global_space_alloc_limit()
            || !self.old_space().can_expand(0)
        {
            self.collect_garbage(TriggerGcType::Old);
        }
    }

    /// Brings a started concurrent mark to its end before a collection that
    /// needs a stable mark state. Returns `true` if there was one.
    pub fn check_ongoing_concurrent_marking(&self) -> bool {
        if self.concurrent_marker.is_ready() {
            return false;
        }
        if self.concurrent_marker.is_marking() {
            let start = Instant::now();
            NonMovableMarker::new(self).process_mark_stack(MAIN_THREAD_INDEX);
            self.concurrent_marker.wait_marking_finished();
            log::trace!("waited {:?} for concurrent marking", start.elapsed());
        }
        self.mem_controller.lock().record_after_concurrent_mark(
            self.is_full_mark(),
            self.concurrent_marker.marked_bytes(),
            self.concurrent_marker.duration_ms(),
        );
        if self.disable_concurrent_mark_requested.swap(false, Ordering::AcqRel) {
            self.concurrent_marking_enabled
                .store(false, Ordering::Release);
            log::info!("concurrent marking disabled after the running mark");
        }
        true
    }

    /// Starts a concurrent mark early enough that it can finish before the
    /// young or old limit is hit, judging by recent speeds. Without history
    /// it falls back to plain limit checks.
    pub fn try_trigger_concurrent_marking(&self) {
        if !self.is_concurrent_marking_enabled() || !self.concurrent_marker.is_ready() {
            return;
        }
        let region_size = self.settings.region_size as f64;
        let (old_alloc_speed, old_mark_speed, new_alloc_speed, new_mark_speed) = {
            let mc = self.mem_controller.lock();
            (
                mc.old_space_allocation_throughput_per_ms(),
                mc.full_space_concurrent_mark_speed_per_ms(),
                mc.new_space_allocation_throughput_per_ms(),
                mc.new_space_concurrent_mark_speed_per_ms(),
            )
        };

        let old_size = self.old_space().heap_object_size() + self.huge.heap_object_size();
        let global_size = self.heap_object_size();
        let old_limit = self.old_space().space().initial_capacity();
        let global_limit = self.global_space_alloc_limit();
        let over_limit = old_size >= old_limit || global_size >= global_limit;

        let mut full_mark_needed = false;
        let mut old_mark_duration = 0.0;
        let mut old_to_limit_duration = 0.0;
        if old_mark_speed == 0.0 || old_alloc_speed == 0.0 {
            if over_limit {
                log::debug!("first full mark triggered by limit");
                self.start_concurrent_mark(MarkType::Full);
                return;
            }
        } else {
            full_mark_needed = over_limit;
            old_to_limit_duration = (old_limit as f64 - old_size as f64) / old_alloc_speed;
            old_mark_duration = global_size as f64 / old_mark_speed;
            let old_remain = (old_to_limit_duration - old_mark_duration) * old_alloc_speed;
            if old_remain > 0.0 && old_remain < region_size {
                full_mark_needed = true;
            }
        }

        let semi = self.active_semi_space();
        let semi_trigger = semi.space().initial_capacity();
        if new_mark_speed == 0.0 || new_alloc_speed == 0.0 {
            if full_mark_needed {
                self.start_concurrent_mark(MarkType::Full);
            } else if semi.committed_size() >= semi_trigger * 3 / 4 {
                log::debug!("first young mark triggered by committed size");
                self.start_concurrent_mark(MarkType::Young);
            }
            return;
        }
        let new_to_limit_duration =
            (semi_trigger as f64 - semi.committed_size() as f64) / new_alloc_speed;
        let new_mark_duration = semi.heap_object_size() as f64 / new_mark_speed;
        let new_remain = (new_to_limit_duration - new_mark_duration) * new_alloc_speed;

        if full_mark_needed {
            if old_mark_duration < new_to_limit_duration
                && old_mark_duration < old_to_limit_duration
            {
                log::debug!("full mark triggered by speed");
                self.start_concurrent_mark(MarkType::Full);
            } else if over_limit {
                log::debug!("full mark triggered by limit");
                self.start_concurrent_mark(MarkType::Full);
            }
        } else if new_remain < region_size {
            log::debug!("young mark triggered by speed");
            self.start_concurrent_mark(MarkType::Young);
        }
    }

    fn start_concurrent_mark(&self, mark_type: MarkType) {
        self.set_mark_type(mark_type);
        self.trigger_concurrent_marking();
    }

    pub fn trigger_concurrent_marking(&self) {
        if self.is_concurrent_marking_enabled()
            && !self.full_gc_requested.load(Ordering::Acquire)
            && self.concurrent_marker.is_ready()
        {
            self.concurrent_marker.mark(self);
        }
    }

    pub fn wait_marking_finished(&self) {
        self.concurrent_marker.wait_marking_finished();
    }

    /// Runs the collection that consumes a finished concurrent mark.
    pub fn handle_marking_finished(&self) {
        if self.concurrent_marker.is_marking_finished() {
            self.collect_garbage(TriggerGcType::Young);
        }
    }

    /// Disabling while a mark runs takes effect once that mark is consumed.
    pub fn enable_concurrent_marking(&self, enable: bool) {
        if !enable && self.concurrent_marker.is_marking() {
            self.disable_concurrent_mark_requested
                .store(true, Ordering::Release);
            return;
        }
        self.disable_concurrent_mark_requested
            .store(false, Ordering::Release);
        self.concurrent_marking_enabled
            .store(enable, Ordering::Release);
        log::info!(
            "concurrent marking {}",
            if enable { "enabled" } else { "disabled" }
        );
    }

    /// The next collection that finds the marker idle becomes a full one.
    pub fn request_full_gc(&self) {
        self.full_gc_requested.store(true, Ordering::Release);
    }

    pub fn memory_growing_type(&self) -> MemGrowingType {
        match self.memory_growing.load(Ordering::Relaxed) {
            1 => MemGrowingType::Conservative,
            2 => MemGrowingType::Pressure,
            _ => MemGrowingType::HighThroughput,
        }
    }

    fn set_memory_growing_type(&self, growing: MemGrowingType) {
        self.memory_growing.store(growing as u8, Ordering::Relaxed);
    }

    /// Background mode grows conservatively, stops concurrent marking and
    /// runs GC work on at most one worker.
    pub fn change_gc_params(&self, in_background: bool) {
        let workers = self.settings.parallel_gc_threads;
        let pressure = self.memory_growing_type() == MemGrowingType::Pressure;
        if in_background {
            log::info!("heap switched to background");
            if !pressure {
                self.set_memory_growing_type(MemGrowingType::Conservative);
            }
            self.enable_concurrent_marking(false);
            self.max_mark_tasks.store(workers.min(1), Ordering::Relaxed);
            self.max_evacuate_tasks
                .store(workers.min(1), Ordering::Relaxed);
        } else {
            log::info!("heap switched to foreground");
            if !pressure {
                self.set_memory_growing_type(MemGrowingType::HighThroughput);
            }
            self.enable_concurrent_marking(self.settings.concurrent_marking);
            self.max_mark_tasks
                .store(self.settings.max_mark_tasks(), Ordering::Relaxed);
            self.max_evacuate_tasks.store(workers, Ordering::Relaxed);
        }
    }

    pub fn notify_memory_pressure(&self, in_high_memory_pressure: bool) {
        if in_high_memory_pressure {
            log::info!("heap under high memory pressure");
            self.set_memory_growing_type(MemGrowingType::Pressure);
        } else {
            log::info!("heap memory pressure relieved");
            self.set_memory_growing_type(MemGrowingType::Conservative);
            self.mem_controller.lock().reset_histories();
        }
    }

    // ── parallel tasks ──────────────────────────────────────────────

    /// Hands `phase` to an idle worker. Returns `false` when the caller has
    /// to do the work itself.
    pub(crate) fn post_parallel_gc_task(&self, phase: ParallelGcTaskPhase) -> bool {
        if !self.settings.parallel_gc {
            return false;
        }
        let limit = if phase.is_marking() {
            self.max_mark_tasks.load(Ordering::Relaxed)
        } else {
            self.max_evacuate_tasks.load(Ordering::Relaxed)
        };
        let Some(heap) = self.self_ref.upgrade() else {
            return false;
        };
        {
            let mut running = self.running_tasks.lock();
            if *running >= limit {
                return false;
            }
            *running += 1;
        }
        self.task_pool.post(Box::new(move |thread| {
            heap.run_parallel_task(phase, thread);
            heap.reduce_task_count();
        }));
        true
    }

    /// Posts the concurrent marking driver. It does not count as a running
    /// task. Returns `false` when there is no worker to run it.
    pub(crate) fn post_marking_driver(&self) -> bool {
        if self.task_pool.worker_count() == 0 {
            return false;
        }
        let Some(heap) = self.self_ref.upgrade() else {
            return false;
        };
        self.task_pool.post(Box::new(move |thread| {
            heap.concurrent_marker.run_driver(&heap, thread);
        }));
        true
    }

    fn run_parallel_task(&self, phase: ParallelGcTaskPhase, thread: u32) {
        log::trace!("gc worker {thread} runs {phase:?}");
        match phase {
            ParallelGcTaskPhase::SemiHandleGlobalPool => {
                SemiGcMarker::new(self).process_mark_stack(thread)
            }
            ParallelGcTaskPhase::OldHandleGlobalPool
            | ParallelGcTaskPhase::ConcurrentHandleGlobalPool => {
                NonMovableMarker::new(self).process_mark_stack(thread)
            }
            ParallelGcTaskPhase::CompressHandleGlobalPool => {
                CompressGcMarker::new(self).process_mark_stack(thread)
            }
            ParallelGcTaskPhase::EvacuateRegions => Evacuator::new(self).evacuate_regions(thread),
            ParallelGcTaskPhase::UpdateReferences => Evacuator::new(self).update_copies(thread),
        }
    }

    fn reduce_task_count(&self) {
        let mut running = self.running_tasks.lock();
        *running -= 1;
        if *running == 0 {
            self.tasks_finished.notify_all();
        }
    }

    pub fn wait_running_task_finished(&self) {
        let mut running = self.running_tasks.lock();
        while *running > 0 {
            self.tasks_finished.wait(&mut running);
        }
    }

    // ── queries ─────────────────────────────────────────────────────

    /// Whether `addr` lies in the used part of a region owned by a space.
    pub fn contain_object(&self, addr: usize) -> bool {
        if !self.regions.contains(addr) {
            return false;
        }
        let region = self.region_of(addr);
        match region.space_type() {
            SpaceType::None => region.in_cset(),
            SpaceType::Semi | SpaceType::Snapshot => addr < region.top(),
            _ => true,
        }
    }

    /// Whether `addr` is an object in a live region rather than free memory.
    pub fn is_alive(&self, addr: usize) -> bool {
        if !self.contain_object(addr) {
            return false;
        }
        // SAFETY: the address lies in the used part of a live region.
        !unsafe { object::header_at(addr) }.is_free()
    }

    /// Visits every object in every space, collection set included.
    pub fn iterate_over_objects(&self, visitor: &mut dyn FnMut(usize)) {
        self.active_semi_space().iterate_objects(visitor);
        self.old_space().iterate_objects(visitor);
        for id in self.old_space().cset_regions() {
            let region = self.regions.region(id);
            Space::iterate_region_objects(region, region.end(), visitor);
        }
        self.non_movable.iterate_objects(visitor);
        self.machine_code.iterate_objects(visitor);
        self.huge.iterate_objects(visitor);
        self.snapshot.iterate_objects(visitor);
    }

    /// Checks that every strong reference points at a live object and
    /// returns the number of broken ones.
    pub fn verify(&self) -> usize {
        self.concurrent_marker.wait_marking_finished();
        let mut failures = 0;
        self.iterate_over_objects(&mut |obj| {
            let mut check = |slot: ObjectSlot, kind: SlotKind| {
                let value = slot.load();
                if kind == SlotKind::Strong && value.is_object() && !self.is_alive(value.addr()) {
                    log::error!(
                        "object 0x{obj:x} slot 0x{:x} points at dead 0x{:x}",
                        slot.address(),
                        value.addr()
                    );
                    failures += 1;
                }
            };
            // SAFETY: spaces only report live object starts.
            unsafe { object::visit_object_slots(obj, &mut check) };
        });
        if failures > 0 {
            log::error!("heap verification found {failures} broken references");
        }
        failures
    }
}

// SAFETY: HeapInner only stores addresses into its own mapping; all shared
// state is atomic or behind locks.
unsafe impl Send for HeapInner {}
// SAFETY: see above.
unsafe impl Sync for HeapInner {}

impl Drop for HeapInner {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl core::fmt::Debug for HeapInner {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HeapInner")
            .field("committed", &self.committed_size())
            .field("live", &self.heap_object_size())
            .field("mark_type", &self.mark_type())
            .field("marking", &self.is_marking())
            .finish_non_exhaustive()
    }
}

/// Shared handle to a heap.
#[derive(Debug, Clone)]
pub struct Heap(Arc<HeapInner>);

impl Heap {
    /// Reserves the heap range and starts the GC workers.
    ///
    /// # Panics
    ///
    /// If `settings` are invalid or the range cannot be reserved.
    #[must_use]
    pub fn new(settings: HeapSettings) -> Self {
        Self(Arc::new_cyclic(|me| HeapInner::new(settings, me.clone())))
    }
}

impl Deref for Heap {
    type Target = HeapInner;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        GlobalHandle,
        evacuator::{CopyTarget, evacuate_object},
    };

    const KB: usize = 1024;
    const MB: usize = 1024 * KB;

    fn create_test_settings() -> HeapSettings {
        HeapSettings {
            region_size: 64 * KB,
            max_heap_size: 16 * MB,
            semi_space_initial_capacity: 256 * KB,
            semi_space_max_capacity: MB,
            old_space_initial_capacity: 4 * MB,
            old_space_max_capacity: 8 * MB,
            non_movable_space_capacity: MB,
            machine_code_space_capacity: 512 * KB,
            snapshot_space_capacity: 512 * KB,
            huge_object_threshold: 32 * KB,
            parallel_gc_threads: 2,
            concurrent_marking: false,
            parallel_gc: true,
            min_cset_regions: 1,
            max_cset_regions: 4,
            most_alive_rate: 0.8,
            work_node_capacity: 16,
            tlab_size: 4 * KB,
            full_gc_every_old_gc: false,
            min_growing_step: 256 * KB,
            min_old_space_limit: 512 * KB,
        }
    }

    fn test_heap() -> Heap {
        Heap::new(create_test_settings())
    }

    /// A young object with `fields` tagged fields, the first set to `tag`.
    fn young(heap: &Heap, fields: usize, tag: i64) -> Value {
        let obj = heap.allocate_young_or_huge(ObjectType::Slots, object::fields_allocation_size(fields));
        heap.write_field(obj, 0, Value::from_i64(tag));
        obj
    }

    fn old(heap: &Heap, fields: usize, tag: i64) -> Value {
        let obj = heap.allocate_old_or_huge(ObjectType::Slots, object::fields_allocation_size(fields));
        heap.write_field(obj, 0, Value::from_i64(tag));
        obj
    }

    fn tag(heap: &Heap, obj: Value) -> i64 {
        unsafe { heap.read_field(obj, 0).to_i64() }
    }

    fn root(heap: &Heap, value: Value) -> GlobalHandle {
        heap.global_handles().new_global_handle(value)
    }

    fn garbage(heap: &Heap, count: usize) {
        for i in 0..count {
            young(heap, 4, i as i64);
        }
    }

    /// Builds a rooted list of `len` young nodes: field 0 tag, field 1 next.
    fn rooted_list(heap: &Heap, len: usize) -> GlobalHandle {
        let head = root(heap, Value::UNDEFINED);
        for i in 0..len {
            let node = young(heap, 2, i as i64);
            heap.write_field(node, 1, head.get());
            head.set(node);
        }
        head
    }

    fn check_list(heap: &Heap, head: GlobalHandle, len: usize) {
        let mut cur = head.get();
        for i in (0..len).rev() {
            assert!(heap.is_alive(cur.addr()), "node {i} is dead");
            assert_eq!(tag(heap, cur), i as i64);
            cur = heap.read_field(cur, 1);
        }
        assert!(cur.is_undefined());
    }

    // ── allocation ────────────────────────────────────────────────────

    #[test]
    fn young_allocation_initializes_fields() {
        let heap = test_heap();
        let obj = heap.allocate_young_or_huge(ObjectType::Slots, object::fields_allocation_size(3));
        assert!(heap.region_of(obj.addr()).is_young());
        for i in 0..3 {
            assert!(heap.read_field(obj, i).is_undefined());
        }
        heap.write_field(obj, 2, Value::from_i64(-5));
        assert_eq!(unsafe { heap.read_field(obj, 2).to_i64() }, -5);
        assert!(heap.contain_object(obj.addr()));
    }

    #[test]
    fn large_requests_go_to_the_huge_space() {
        let heap = test_heap();
        let obj = heap.allocate_young_or_huge(ObjectType::ByteArray, 40 * KB);
        let region = heap.region_of(obj.addr());
        assert!(!region.is_young());
        assert!(region.has_flag(RegionFlags::HUGE));
        assert!(heap.huge_object_space().heap_object_size() >= 40 * KB);
    }

    #[test]
    fn non_young_spaces_allocate_in_their_regions() {
        let heap = test_heap();
        let nm = heap.allocate_non_movable(ObjectType::Slots, 32);
        let code = heap.allocate_machine_code(64);
        let snap = heap.allocate_snapshot(ObjectType::Slots, 32);
        assert_eq!(heap.region_of(nm.addr()).space_type(), SpaceType::NonMovable);
        assert_eq!(heap.region_of(code.addr()).space_type(), SpaceType::MachineCode);
        assert!(heap.region_of(snap.addr()).is_snapshot());
        assert_eq!(unsafe { object::object_type(code.addr()) }, ObjectType::Code);
    }

    // ── young collection ──────────────────────────────────────────────

    #[test]
    fn young_gc_copies_reachable_objects() {
        let heap = test_heap();
        let a = young(&heap, 2, 1);
        let b = young(&heap, 1, 7);
        heap.write_field(a, 1, b);
        let handle = root(&heap, a);
        garbage(&heap, 100);

        heap.collect_garbage(TriggerGcType::Young);

        let a = handle.get();
        assert!(heap.region_of(a.addr()).is_young());
        assert_eq!(tag(&heap, a), 1);
        assert_eq!(tag(&heap, heap.read_field(a, 1)), 7);
        assert_eq!(heap.verify(), 0);
        assert_eq!(heap.gc_stats().young.count, 1);
    }

    #[test]
    fn shared_referents_are_copied_once() {
        let heap = test_heap();
        let shared = young(&heap, 1, 3);
        let a = root(&heap, young(&heap, 2, 1));
        let b = root(&heap, young(&heap, 2, 2));
        heap.write_field(a.get(), 1, shared);
        heap.write_field(b.get(), 1, shared);

        heap.collect_garbage(TriggerGcType::Young);

        let from_a = heap.read_field(a.get(), 1);
        let from_b = heap.read_field(b.get(), 1);
        assert_eq!(from_a, from_b);
        assert_ne!(from_a.addr(), shared.addr());
        assert_eq!(tag(&heap, from_a), 3);
    }

    #[test]
    fn second_survival_promotes() {
        let heap = test_heap();
        let handle = root(&heap, young(&heap, 1, 9));
        heap.collect_garbage(TriggerGcType::Young);
        assert!(heap.region_of(handle.get().addr()).is_young());

        heap.collect_garbage(TriggerGcType::Young);
        let obj = handle.get();
        assert!(!heap.region_of(obj.addr()).is_young());
        assert_eq!(heap.region_of(obj.addr()).space_type(), SpaceType::Old);
        assert_eq!(tag(&heap, obj), 9);
        assert_eq!(heap.verify(), 0);
    }

    #[test]
    fn old_to_new_slots_keep_young_objects_alive() {
        let heap = test_heap();
        let holder = root(&heap, old(&heap, 2, 0));
        let child = young(&heap, 1, 42);
        heap.write_field(holder.get(), 1, child);
        assert!(heap.region_of(holder.get().addr()).old_to_new_count() > 0);

        heap.collect_garbage(TriggerGcType::Young);

        let child = heap.read_field(holder.get(), 1);
        assert!(heap.region_of(child.addr()).is_young());
        assert_eq!(tag(&heap, child), 42);
        assert_eq!(heap.verify(), 0);
    }

    #[test]
    fn snapshot_objects_act_as_roots() {
        let heap = test_heap();
        let snap = heap.allocate_snapshot(ObjectType::Slots, object::fields_allocation_size(1));
        heap.write_field(snap, 0, young(&heap, 1, 11));

        heap.collect_garbage(TriggerGcType::Young);
        heap.collect_garbage(TriggerGcType::Full);

        let child = heap.read_field(snap, 0);
        assert_eq!(tag(&heap, child), 11);
        assert_eq!(heap.verify(), 0);
    }

    #[test]
    fn allocation_pressure_triggers_collections() {
        let heap = test_heap();
        let head = rooted_list(&heap, 500);
        garbage(&heap, 20_000);
        assert!(heap.gc_stats().collection_count() > 0);
        check_list(&heap, head, 500);
        assert_eq!(heap.verify(), 0);
    }

    #[test]
    fn filling_the_young_generation_runs_one_young_gc() {
        let heap = test_heap();
        let keep = root(&heap, young(&heap, 1, 1));
        let mut before = 0;
        while heap.gc_stats().young.count == 0 {
            before = heap.active_semi_space().heap_object_size();
            young(&heap, 4, 0);
        }
        assert_eq!(heap.gc_stats().collection_count(), 1);
        assert!(heap.active_semi_space().heap_object_size() < before);
        assert_eq!(tag(&heap, keep.get()), 1);
    }

    // ── marking and copying races ─────────────────────────────────────

    #[test]
    fn contended_marking_enqueues_each_object_once() {
        let heap = Heap::new(HeapSettings {
            parallel_gc: false,
            ..create_test_settings()
        });
        let objects: Vec<usize> = (0..1000).map(|i| young(&heap, 1, i).addr()).collect();
        heap.prepare_marking();

        std::thread::scope(|s| {
            for thread in 0..3u32 {
                let (heap, objects) = (&heap, &objects);
                s.spawn(move || {
                    let marker = NonMovableMarker::new(heap);
                    for &obj in objects {
                        marker.mark_object(thread, obj);
                    }
                });
            }
        });

        let mut popped = 0;
        for thread in 0..3 {
            while heap.work_manager.pop(thread).is_some() {
                popped += 1;
            }
        }
        assert_eq!(popped, objects.len());
        assert!(objects.iter().all(|&o| heap.region_of(o).is_marked(o)));
    }

    #[test]
    fn racing_evacuations_agree_on_one_copy() {
        let heap = Heap::new(HeapSettings {
            parallel_gc: false,
            ..create_test_settings()
        });
        let objects: Vec<usize> = (0..500).map(|i| young(&heap, 1, i).addr()).collect();
        heap.swap_semi_spaces();
        heap.inactive_semi_space()
            .space()
            .enumerate_regions(|r| r.set_flag(RegionFlags::EVACUATING));

        let results: Vec<Vec<(usize, bool)>> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..3u32)
                .map(|thread| {
                    let (heap, objects) = (&heap, &objects);
                    s.spawn(move || {
                        objects
                            .iter()
                            .map(|&o| evacuate_object(heap, thread, o, CopyTarget::Young))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        for (i, &obj) in objects.iter().enumerate() {
            let winners = results.iter().filter(|r| r[i].1).count();
            assert_eq!(winners, 1, "object {i} copied {winners} times");
            let copy = results[0][i].0;
            assert!(results.iter().all(|r| r[i].0 == copy));
            assert_ne!(copy, obj);
            assert_eq!(tag(&heap, Value::from_addr(copy)), i as i64);
        }
    }

    #[test]
    fn mark_bitmaps_are_clear_when_the_next_mark_starts() {
        let heap = test_heap();
        let _kept = root(&heap, old(&heap, 1, 0));
        for i in 0..100 {
            old(&heap, 2, i);
        }
        heap.collect_garbage(TriggerGcType::Old);

        heap.set_mark_type(MarkType::Full);
        heap.prepare_marking();
        let mut clear = true;
        heap.enumerate_non_young_regions(&mut |r| clear &= r.mark_bitmap_is_clear());
        heap.active_semi_space()
            .space()
            .enumerate_regions(|r| clear &= r.mark_bitmap_is_clear());
        assert!(clear);
        heap.set_mark_type(MarkType::Young);
    }

    // ── weak references ───────────────────────────────────────────────

    fn weak_cell(heap: &Heap, referent: Value) -> GlobalHandle {
        let cell = heap.allocate_young_or_huge(ObjectType::WeakCell, object::fields_allocation_size(2));
        heap.write_field(cell, 0, referent);
        root(heap, cell)
    }

    #[test]
    fn weak_cells_follow_survivors_and_clear_dead_referents() {
        let heap = test_heap();
        let kept = root(&heap, young(&heap, 1, 5));
        let live_cell = weak_cell(&heap, kept.get());
        let dead_cell = weak_cell(&heap, young(&heap, 1, 6));

        heap.collect_garbage(TriggerGcType::Young);

        assert_eq!(heap.read_field(live_cell.get(), 0), kept.get());
        assert!(heap.read_field(dead_cell.get(), 0).is_undefined());
    }

    fn old_weak_cell(heap: &Heap, referent: Value) -> GlobalHandle {
        let cell = heap.allocate_old_or_huge(ObjectType::WeakCell, object::fields_allocation_size(2));
        heap.write_field(cell, 0, referent);
        root(heap, cell)
    }

    #[test]
    fn remembered_weak_slots_do_not_retain_young_referents() {
        let heap = test_heap();
        let cell = old_weak_cell(&heap, young(&heap, 1, 8));
        assert!(!heap.region_of(cell.get().addr()).is_young());
        assert!(heap.region_of(cell.get().addr()).old_to_new_count() > 0);

        heap.collect_garbage(TriggerGcType::Young);

        assert!(heap.read_field(cell.get(), 0).is_undefined());
        assert_eq!(heap.region_of(cell.get().addr()).old_to_new_count(), 0);
        assert_eq!(heap.verify(), 0);
    }

    #[test]
    fn remembered_weak_slots_follow_surviving_referents() {
        let heap = test_heap();
        let kept = root(&heap, young(&heap, 1, 4));
        let cell = old_weak_cell(&heap, kept.get());

        heap.collect_garbage(TriggerGcType::Young);

        let referent = heap.read_field(cell.get(), 0);
        assert_eq!(referent, kept.get());
        assert!(heap.region_of(referent.addr()).is_young());
        assert!(heap.region_of(cell.get().addr()).old_to_new_count() > 0);
        assert_eq!(tag(&heap, referent), 4);
    }

    #[test]
    fn weak_handles_are_cleared_by_full_gc() {
        let heap = test_heap();
        let kept = root(&heap, old(&heap, 1, 1));
        let weak_kept = heap.global_handles().new_weak_handle(kept.get());
        let weak_dead = heap.global_handles().new_weak_handle(old(&heap, 1, 2));

        heap.collect_garbage(TriggerGcType::Full);

        assert_eq!(weak_kept.get(), kept.get());
        assert!(weak_dead.get().is_undefined());
    }

    // ── old collections ───────────────────────────────────────────────

    #[test]
    fn partial_gc_with_full_mark_sweeps_old_garbage() {
        let heap = test_heap();
        let kept = root(&heap, old(&heap, 2, 1));
        let dead = old(&heap, 2, 2).addr();
        let young_child = young(&heap, 1, 3);
        heap.write_field(kept.get(), 1, young_child);

        heap.collect_garbage(TriggerGcType::Old);

        assert_eq!(heap.gc_stats().partial.count, 1);
        assert_eq!(heap.mark_type(), MarkType::Young);
        assert!(!heap.is_alive(dead));
        assert_eq!(tag(&heap, kept.get()), 1);
        assert_eq!(tag(&heap, heap.read_field(kept.get(), 1)), 3);
        assert_eq!(heap.verify(), 0);
    }

    #[test]
    fn full_gc_compacts_and_preserves_the_graph() {
        let heap = test_heap();
        let head = rooted_list(&heap, 200);
        heap.collect_garbage(TriggerGcType::Young);
        heap.collect_garbage(TriggerGcType::Young);
        for i in 0..2000 {
            old(&heap, 8, i);
        }
        let huge_dead = heap.allocate_huge(ObjectType::ByteArray, 40 * KB).addr();
        let huge_kept = root(&heap, heap.allocate_huge(ObjectType::Array, 40 * KB));
        let before = heap.old_space().heap_object_size();

        heap.collect_garbage(TriggerGcType::Full);

        assert!(heap.old_space().heap_object_size() < before);
        assert!(heap.old_space().cset_regions().is_empty());
        check_list(&heap, head, 200);
        assert!(!heap.is_alive(huge_dead));
        assert!(heap.is_alive(huge_kept.get().addr()));
        assert_eq!(heap.verify(), 0);
        assert_eq!(heap.gc_stats().full.count, 1);
    }

    #[test]
    fn non_movable_objects_survive_in_place() {
        let heap = test_heap();
        let nm = heap.allocate_non_movable(ObjectType::Slots, object::fields_allocation_size(1));
        let handle = root(&heap, nm);
        heap.write_field(nm, 0, young(&heap, 1, 4));
        let dead = heap.allocate_non_movable(ObjectType::Slots, 32).addr();

        heap.collect_garbage(TriggerGcType::Full);

        assert_eq!(handle.get(), nm);
        assert_eq!(tag(&heap, heap.read_field(nm, 0)), 4);
        assert!(!heap.is_alive(dead));
    }

    #[test]
    fn requested_full_gc_replaces_the_next_collection() {
        let heap = test_heap();
        heap.request_full_gc();
        heap.collect_garbage(TriggerGcType::Young);
        assert_eq!(heap.gc_stats().full.count, 1);
        assert_eq!(heap.gc_stats().young.count, 0);
    }

    // ── concurrent marking ────────────────────────────────────────────

    #[test]
    fn concurrent_mark_finishes_in_a_partial_pause() {
        let heap = Heap::new(HeapSettings {
            concurrent_marking: true,
            ..create_test_settings()
        });
        let head = rooted_list(&heap, 300);
        let holder = root(&heap, old(&heap, 2, 0));

        heap.trigger_concurrent_marking();
        // Stored while marking; the barrier must keep it alive.
        heap.write_field(holder.get(), 1, young(&heap, 1, 77));
        garbage(&heap, 50);
        heap.wait_marking_finished();
        assert!(heap.concurrent_marker().is_marking_finished());

        heap.handle_marking_finished();

        assert!(heap.concurrent_marker().is_ready());
        assert!(!heap.is_marking());
        assert_eq!(heap.gc_stats().partial.count, 1);
        check_list(&heap, head, 300);
        assert_eq!(tag(&heap, heap.read_field(holder.get(), 1)), 77);
        assert_eq!(heap.verify(), 0);
    }

    #[test]
    fn disabling_concurrent_marking_is_deferred() {
        let heap = Heap::new(HeapSettings {
            concurrent_marking: true,
            ..create_test_settings()
        });
        rooted_list(&heap, 50);
        heap.trigger_concurrent_marking();
        heap.enable_concurrent_marking(false);
        heap.collect_garbage(TriggerGcType::Young);
        heap.wait_marking_finished();
        assert!(heap.concurrent_marker().is_ready());
        assert!(!heap.is_concurrent_marking_enabled());
    }

    #[test]
    fn background_mode_changes_growing_type() {
        let heap = test_heap();
        heap.change_gc_params(true);
        assert_eq!(heap.memory_growing_type(), MemGrowingType::Conservative);
        heap.notify_memory_pressure(true);
        heap.change_gc_params(false);
        assert_eq!(heap.memory_growing_type(), MemGrowingType::Pressure);
        heap.notify_memory_pressure(false);
        assert_eq!(heap.memory_growing_type(), MemGrowingType::Conservative);
    }

    #[test]
    fn single_threaded_heap_collects_inline() {
        let heap = Heap::new(HeapSettings {
            parallel_gc_threads: 0,
            ..create_test_settings()
        });
        let head = rooted_list(&heap, 100);
        heap.collect_garbage(TriggerGcType::Young);
        heap.collect_garbage(TriggerGcType::Old);
        heap.collect_garbage(TriggerGcType::Full);
        check_list(&heap, head, 100);
        assert_eq!(heap.verify(), 0);
    }
}
