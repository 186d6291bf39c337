//! Collectors.
//!
//! Every collection runs the same four phases: initialize, mark, sweep and
//! finish. The [`GcKind`] picks the implementation:
//!
//! - [`YoungCollector`]: stop-the-world copying of the young generation.
//! - [`PartialCollector`]: finishes (or runs) a mark, then evacuates the
//!   young generation and, after a full mark, the collection set. A full
//!   mark also sweeps the old generation.
//! - [`FullCollector`]: compacts the young and old generations into fresh
//!   regions and sweeps the non-moving spaces.

use std::{
    sync::atomic::Ordering,
    time::{Duration, Instant},
};

use object::{ObjectSlot, Value};

use crate::{
    CompressGcMarker, HeapInner, MAIN_THREAD_INDEX, Marker, NonMovableMarker, Region,
    RegionFlags, RegionId, SemiGcMarker,
    evacuator::{Evacuator, forwarded, retire_tlabs, update_remembered_slot},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GcKind {
    Young,
    Partial,
    Full,
}

trait GcPhases {
    fn initialize(&mut self);
    fn mark(&mut self);
    fn sweep(&mut self);
    fn finish(&mut self, pause: Duration);
}

fn run(kind: GcKind, collector: &mut dyn GcPhases) {
    let start = Instant::now();
    let phase = |name: &str, f: &mut dyn FnMut()| {
        let t = Instant::now();
        f();
        log::trace!("{kind:?} {name} took {:?}", t.elapsed());
    };
    phase("initialize", &mut || collector.initialize());
    phase("mark", &mut || collector.mark());
    phase("sweep", &mut || collector.sweep());
    collector.finish(start.elapsed());
    log::debug!("{kind:?} gc pause {:?}", start.elapsed());
}

impl GcKind {
    pub(crate) fn run_phases(self, heap: &HeapInner) {
        match self {
            GcKind::Young => run(self, &mut YoungCollector::new(heap)),
            GcKind::Partial => run(self, &mut PartialCollector::new(heap)),
            GcKind::Full => run(self, &mut FullCollector::new(heap)),
        }
    }
}

// ── shared steps ──────────────────────────────────────────────────────

/// Runs helpers for `phase` next to the calling thread until the global
/// stack is empty.
fn drain_in_parallel<M: Marker>(heap: &HeapInner, marker: &M) {
    heap.work_manager.flush(MAIN_THREAD_INDEX);
    for _ in 0..heap.settings.max_mark_tasks().max(1) {
        if !heap.post_parallel_gc_task(M::PHASE) {
            break;
        }
    }
    marker.process_mark_stack(MAIN_THREAD_INDEX);
    heap.wait_running_task_finished();
    marker.process_mark_stack(MAIN_THREAD_INDEX);
    debug_assert!(!heap.work_manager.has_pending_work());
}

/// Clears weak slots whose referents died and redirects the others to
/// their copies, then lets root providers do the same for weak roots.
fn process_weak_references(heap: &HeapInner, marks_valid: bool) {
    let slots = heap.work_manager.take_weak_references();
    let mut cleared = 0;
    for slot in &slots {
        let value = slot.load();
        if !value.is_object() {
            continue;
        }
        match heap.resolve_weak(value.addr(), marks_valid) {
            Some(addr) => {
                if addr != value.addr() {
                    slot.store(Value::from_addr(addr));
                }
                if heap.region_of(addr).is_young() && !heap.region_of(slot.address()).is_young() {
                    heap.region_of(slot.address())
                        .insert_old_to_new(slot.address());
                }
            }
            None => {
                slot.store(Value::UNDEFINED);
                cleared += 1;
            }
        }
    }
    heap.sweep_weak_roots(&|addr| heap.resolve_weak(addr, marks_valid));
    log::trace!("processed {} weak slots, cleared {cleared}", slots.len());
}

fn flag_evacuating(heap: &HeapInner, regions: &[RegionId]) {
    for &id in regions {
        heap.region_allocator()
            .region(id)
            .set_flag(RegionFlags::EVACUATING);
    }
}

fn from_space_regions(heap: &HeapInner) -> Vec<RegionId> {
    let mut regions = Vec::new();
    heap.inactive_semi_space()
        .space()
        .enumerate_regions(|r| regions.push(r.id()));
    regions
}

/// Reclaims the from-space, sets the age mark of the survivors and lets
/// the young generation grow or shrink.
fn finish_young_generation(heap: &HeapInner, survived: usize) {
    let from = heap.inactive_semi_space();
    let allocated = from.allocated_size_since_gc();
    from.reclaim();
    let to = heap.active_semi_space();
    to.set_water_line();
    if to.adjust_capacity(allocated, survived) {
        from.space()
            .set_initial_capacity(to.space().initial_capacity());
        log::debug!(
            "semi space trigger capacity now {}",
            to.space().initial_capacity()
        );
    }
}

// ── young ─────────────────────────────────────────────────────────────

pub(crate) struct YoungCollector<'h> {
    heap: &'h HeapInner,
    alive: usize,
    promoted: usize,
}

impl<'h> YoungCollector<'h> {
    pub(crate) fn new(heap: &'h HeapInner) -> Self {
        Self {
            heap,
            alive: 0,
            promoted: 0,
        }
    }
}

impl GcPhases for YoungCollector<'_> {
    fn initialize(&mut self) {
        let heap = self.heap;
        heap.wait_running_task_finished();
        if heap.check_ongoing_concurrent_marking() {
            heap.concurrent_marker.reset(heap);
        }
        heap.work_manager.initialize();
        heap.swap_semi_spaces();
        flag_evacuating(heap, &from_space_regions(heap));
    }

    fn mark(&mut self) {
        let heap = self.heap;
        let marker = SemiGcMarker::new(heap);
        marker.process_roots(MAIN_THREAD_INDEX);
        marker.process_old_to_new(MAIN_THREAD_INDEX);
        marker.process_snapshot_rset(MAIN_THREAD_INDEX);
        drain_in_parallel(heap, &marker);
    }

    fn sweep(&mut self) {
        let heap = self.heap;
        process_weak_references(heap, false);
        retire_tlabs(heap, heap.old_space());
        (self.alive, self.promoted) = heap.work_manager.finish();
        heap.promoted_size.store(self.promoted, Ordering::Relaxed);
    }

    fn finish(&mut self, pause: Duration) {
        let heap = self.heap;
        finish_young_generation(heap, self.alive);
        let commit = heap.active_semi_space().committed_size();
        let (alive, promoted) = (self.alive, self.promoted);
        heap.record_stats(|s| s.record_young(pause, alive, promoted, commit));
    }
}

// ── partial ───────────────────────────────────────────────────────────

pub(crate) struct PartialCollector<'h> {
    heap: &'h HeapInner,
    full_mark: bool,
    committed_before: usize,
}

impl<'h> PartialCollector<'h> {
    pub(crate) fn new(heap: &'h HeapInner) -> Self {
        Self {
            heap,
            full_mark: heap.is_full_mark(),
            committed_before: heap.committed_size(),
        }
    }

    /// Redirects root slots and remembered slots to the copies.
    fn update_roots_and_rsets(&self) {
        let heap = self.heap;
        heap.visit_roots(&mut |slot: ObjectSlot| {
            let value = slot.load();
            if value.is_object() {
                let to = forwarded(heap, value.addr());
                if to != value.addr() {
                    slot.store(Value::from_addr(to));
                }
            }
        });
        let update_old_to_new = |region: &Region| {
            if region.is_evacuating() {
                return;
            }
            region.iterate_old_to_new(|slot| {
                update_remembered_slot(heap, ObjectSlot(slot))
                    .is_some_and(|to| heap.region_of(to).is_young())
            });
        };
        heap.enumerate_non_young_regions(&mut |r| update_old_to_new(r));
        heap.enumerate_snapshot_regions(&mut |r| update_old_to_new(r));
        if self.full_mark {
            let update_cross = |region: &Region| {
                if region.is_evacuating() {
                    return;
                }
                region.iterate_cross_region(|slot| {
                    update_remembered_slot(heap, ObjectSlot(slot));
                });
                region.clear_cross_region();
            };
            heap.enumerate_non_young_regions(&mut |r| update_cross(r));
            heap.enumerate_snapshot_regions(&mut |r| update_cross(r));
        }
    }
}

impl GcPhases for PartialCollector<'_> {
    fn initialize(&mut self) {
        let heap = self.heap;
        heap.wait_running_task_finished();
        if heap.concurrent_marker.is_ready() {
            heap.prepare_marking();
        }
    }

    fn mark(&mut self) {
        let heap = self.heap;
        if !heap.concurrent_marker.is_ready() {
            heap.concurrent_marker.remark(heap);
            return;
        }
        let marker = NonMovableMarker::new(heap);
        marker.process_roots(MAIN_THREAD_INDEX);
        if self.full_mark {
            marker.process_snapshot_objects(MAIN_THREAD_INDEX);
        } else {
            marker.process_old_to_new(MAIN_THREAD_INDEX);
            marker.process_snapshot_rset(MAIN_THREAD_INDEX);
        }
        drain_in_parallel(heap, &marker);
    }

    fn sweep(&mut self) {
        let heap = self.heap;
        heap.set_marking(false);
        heap.swap_semi_spaces();
        let mut regions = from_space_regions(heap);
        if self.full_mark {
            regions.extend(heap.old_space().cset_regions());
        }
        flag_evacuating(heap, &regions);

        let evacuator = Evacuator::new(heap);
        evacuator.evacuate(regions);
        retire_tlabs(heap, heap.old_space());
        evacuator.update_references();
        self.update_roots_and_rsets();
        process_weak_references(heap, self.full_mark);

        if self.full_mark {
            let old = heap.old_space().sweep();
            let non_movable = heap.non_movable_space().sweep();
            let machine_code = heap.machine_code_space().sweep();
            let huge = heap.huge_object_space().sweep();
            log::debug!(
                "swept old {old} non-movable {non_movable} machine code {machine_code} huge {huge}"
            );
        }
    }

    fn finish(&mut self, pause: Duration) {
        let heap = self.heap;
        let (_, promoted) = heap.work_manager.finish();
        heap.promoted_size.store(promoted, Ordering::Relaxed);
        if self.full_mark {
            heap.old_space().reclaim_cset();
        }
        let survived = heap.active_semi_space().heap_object_size();
        finish_young_generation(heap, survived);
        heap.concurrent_marker.reset(heap);

        let freed = self.committed_before.saturating_sub(heap.committed_size());
        let old_commit = heap.old_space().committed_size();
        let non_movable_commit = heap.non_movable_space().committed_size();
        heap.record_stats(|s| s.record_partial(pause, freed, old_commit, non_movable_commit));
    }
}

// ── full ──────────────────────────────────────────────────────────────

pub(crate) struct FullCollector<'h> {
    heap: &'h HeapInner,
    alive: usize,
    non_movable_freed: usize,
}

impl<'h> FullCollector<'h> {
    pub(crate) fn new(heap: &'h HeapInner) -> Self {
        Self {
            heap,
            alive: 0,
            non_movable_freed: 0,
        }
    }
}

impl GcPhases for FullCollector<'_> {
    fn initialize(&mut self) {
        let heap = self.heap;
        heap.wait_running_task_finished();
        if heap.check_ongoing_concurrent_marking() {
            heap.concurrent_marker.reset(heap);
        }
        heap.set_marking(false);
        heap.work_manager.initialize();
        heap.swap_semi_spaces();

        let mut regions = from_space_regions(heap);
        heap.old_space()
            .space()
            .enumerate_regions(|r| regions.push(r.id()));
        regions.extend(heap.old_space().cset_regions());
        flag_evacuating(heap, &regions);

        for space in [heap.non_movable_space(), heap.machine_code_space()] {
            space.space().enumerate_regions(|r| r.clear_mark_bitmap());
            space.space().set_record_region();
        }
        heap.huge_object_space()
            .enumerate_all_regions(&mut |r| r.clear_mark_bitmap());
        heap.compress_space()
            .space()
            .set_initial_capacity(heap.old_space().space().initial_capacity());
    }

    fn mark(&mut self) {
        let heap = self.heap;
        let marker = CompressGcMarker::new(heap);
        marker.process_roots(MAIN_THREAD_INDEX);
        marker.process_snapshot_objects(MAIN_THREAD_INDEX);
        drain_in_parallel(heap, &marker);
    }

    fn sweep(&mut self) {
        let heap = self.heap;
        process_weak_references(heap, true);
        self.non_movable_freed = heap.non_movable_space().sweep();
        heap.machine_code_space().sweep();
        heap.huge_object_space().sweep();
        retire_tlabs(heap, heap.compress_space());
        (self.alive, _) = heap.work_manager.finish();
    }

    fn finish(&mut self, pause: Duration) {
        let heap = self.heap;
        heap.swap_old_spaces();
        let previous = heap.compress_space();
        previous.reclaim_cset();
        previous.reclaim();
        heap.inactive_semi_space().reclaim();
        // Nothing young survives a full collection.
        let clear = |r: &Region| {
            r.clear_old_to_new();
            r.clear_cross_region();
        };
        heap.enumerate_non_young_regions(&mut |r| clear(r));
        heap.enumerate_snapshot_regions(&mut |r| clear(r));
        heap.active_semi_space().set_water_line();
        heap.promoted_size.store(self.alive, Ordering::Relaxed);

        let young_commit = heap.active_semi_space().committed_size();
        let old_commit = heap.old_space().committed_size();
        let non_movable_commit = heap.non_movable_space().committed_size();
        let (alive, nm_freed) = (self.alive, self.non_movable_freed);
        heap.record_stats(|s| {
            s.record_full(pause, alive, young_commit, old_commit, nm_freed, non_movable_commit)
        });
    }
}

