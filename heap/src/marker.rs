//! Markers: tracing strategies over the shared work manager.
//!
//! - [`NonMovableMarker`] only sets mark bits. It backs concurrent marking
//!   and the mark phase of partial collections.
//! - [`SemiGcMarker`] copies young objects as it reaches them (young
//!   stop-the-world collection).
//! - [`CompressGcMarker`] copies every movable object into the compaction
//!   target and marks the rest (full collection).

use object::{ObjectSlot, SlotKind, Value};

use crate::{
    HeapInner, ParallelGcTaskPhase, Region,
    evacuator::{CopyTarget, evacuate_object},
};

/// Whether a remembered-set entry stays after its slot was visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    KeepSlot,
    ClearSlot,
}

impl SlotStatus {
    #[inline(always)]
    fn keep(self) -> bool {
        self == Self::KeepSlot
    }
}

pub trait Marker {
    /// Task posted when this marker spills work to the global stack.
    const PHASE: ParallelGcTaskPhase;

    fn heap(&self) -> &HeapInner;

    /// Visits one root or remembered slot.
    fn mark_root(&self, thread: u32, slot: ObjectSlot) -> SlotStatus;

    fn scan_object(&self, thread: u32, obj: usize);

    fn push(&self, thread: u32, obj: usize) {
        if self.heap().work_manager.push(thread, obj) {
            self.heap().post_parallel_gc_task(Self::PHASE);
        }
    }

    fn process_roots(&self, thread: u32) {
        self.heap().visit_roots(&mut |slot| {
            self.mark_root(thread, slot);
        });
    }

    /// Treats recorded old-to-new slots of unmoved regions as roots.
    fn process_old_to_new(&self, thread: u32) {
        self.heap().enumerate_non_young_regions(&mut |region| {
            if !region.is_evacuating() {
                self.process_region_old_to_new(thread, region);
            }
        });
    }

    fn process_snapshot_rset(&self, thread: u32) {
        self.heap()
            .enumerate_snapshot_regions(&mut |region| self.process_region_old_to_new(thread, region));
    }

    fn process_region_old_to_new(&self, thread: u32, region: &Region) {
        region.iterate_old_to_new(|slot| {
            let slot = ObjectSlot(slot);
            // SAFETY: remembered slots are reference fields of objects in
            // regions the collection does not free.
            let status = match unsafe { object::slot_kind(slot) } {
                SlotKind::Weak => self.remember_weak(thread, slot),
                SlotKind::Strong => self.mark_root(thread, slot),
            };
            status.keep()
        });
    }

    /// Queues a remembered weak slot for resolution after marking. Weak
    /// processing re-records it if the referent is still young.
    fn remember_weak(&self, thread: u32, slot: ObjectSlot) -> SlotStatus {
        self.heap().work_manager.push_weak_reference(thread, slot);
        SlotStatus::ClearSlot
    }

    fn process_mark_stack(&self, thread: u32) {
        while let Some(obj) = self.heap().work_manager.pop(thread) {
            self.scan_object(thread, obj);
        }
    }
}

#[inline(always)]
fn add_alive(heap: &HeapInner, thread: u32, obj: usize) {
    // SAFETY: only scanned, fully initialized objects reach here.
    let size = unsafe { object::object_size(obj) };
    heap.work_manager.add_alive_size(thread, size);
}

// ── Non-movable marking ───────────────────────────────────────────────

pub struct NonMovableMarker<'h> {
    heap: &'h HeapInner,
}

impl<'h> NonMovableMarker<'h> {
    pub fn new(heap: &'h HeapInner) -> Self {
        Self { heap }
    }

    /// Grays `addr` if the current mark covers its region and nobody marked
    /// it yet. Snapshot objects are never marked.
    pub fn mark_object(&self, thread: u32, addr: usize) {
        let region = self.heap.region_of(addr);
        if region.is_snapshot() || (!region.is_young() && !self.heap.is_full_mark()) {
            return;
        }
        if region.atomic_mark(addr) {
            self.push(thread, addr);
        }
    }

    /// Scans every snapshot object as a root of a full mark.
    pub fn process_snapshot_objects(&self, thread: u32) {
        self.heap.snapshot_space().iterate_objects(&mut |obj| {
            self.visit_slots(thread, obj, false);
        });
    }

    fn visit_slots(&self, thread: u32, obj: usize, holder_moves: bool) {
        let heap = self.heap;
        let full = heap.is_full_mark();
        let mut visit = |slot: ObjectSlot, kind: SlotKind| {
            let value = slot.load();
            if !value.is_object() {
                return;
            }
            if kind == SlotKind::Weak {
                // Slots of moving holders are resolved when the copy is updated.
                if !holder_moves {
                    heap.work_manager.push_weak_reference(thread, slot);
                }
                return;
            }
            if full && !holder_moves && heap.region_of(value.addr()).in_cset() {
                heap.region_of(slot.address())
                    .insert_cross_region(slot.address());
            }
            self.mark_object(thread, value.addr());
        };
        // SAFETY: `obj` is a live object; its layout does not change while marking.
        unsafe { object::visit_object_slots(obj, &mut visit) };
    }
}

impl Marker for NonMovableMarker<'_> {
    const PHASE: ParallelGcTaskPhase = ParallelGcTaskPhase::OldHandleGlobalPool;

    fn heap(&self) -> &HeapInner {
        self.heap
    }

    /// Concurrent marking may race with the barrier inserting into the same
    /// remembered set, so slots are never dropped here.
    fn mark_root(&self, thread: u32, slot: ObjectSlot) -> SlotStatus {
        let value = slot.load();
        if value.is_object() {
            self.mark_object(thread, value.addr());
        }
        SlotStatus::KeepSlot
    }

    fn remember_weak(&self, thread: u32, slot: ObjectSlot) -> SlotStatus {
        self.heap.work_manager.push_weak_reference(thread, slot);
        SlotStatus::KeepSlot
    }

    fn scan_object(&self, thread: u32, obj: usize) {
        add_alive(self.heap, thread, obj);
        let holder_moves = self.heap.region_of(obj).is_young_or_cset();
        self.visit_slots(thread, obj, holder_moves);
    }
}

// ── Young copying ─────────────────────────────────────────────────────

pub struct SemiGcMarker<'h> {
    heap: &'h HeapInner,
}

impl<'h> SemiGcMarker<'h> {
    pub fn new(heap: &'h HeapInner) -> Self {
        Self { heap }
    }

    /// Copies a from-space object once: objects below the water line are
    /// promoted, the rest stay young while the to-space has room.
    fn evacuate(&self, thread: u32, addr: usize) -> usize {
        let region = self.heap.region_of(addr);
        let target = if self.heap.inactive_semi_space().is_below_water_line(region, addr) {
            CopyTarget::Old
        } else {
            CopyTarget::Young
        };
        let (to, first) = evacuate_object(self.heap, thread, addr, target);
        if first {
            self.push(thread, to);
        }
        to
    }

    /// The referent's address after this collection.
    fn process_slot(&self, thread: u32, slot: ObjectSlot, value: Value) -> usize {
        let addr = value.addr();
        if !self.heap.region_of(addr).is_evacuating() {
            return addr;
        }
        let to = self.evacuate(thread, addr);
        slot.store(Value::from_addr(to));
        to
    }
}

impl Marker for SemiGcMarker<'_> {
    const PHASE: ParallelGcTaskPhase = ParallelGcTaskPhase::SemiHandleGlobalPool;

    fn heap(&self) -> &HeapInner {
        self.heap
    }

    /// Entries survive only while they still point into the young generation.
    fn mark_root(&self, thread: u32, slot: ObjectSlot) -> SlotStatus {
        let value = slot.load();
        if !value.is_object() {
            return SlotStatus::ClearSlot;
        }
        let to = self.process_slot(thread, slot, value);
        if self.heap.region_of(to).is_young() {
            SlotStatus::KeepSlot
        } else {
            SlotStatus::ClearSlot
        }
    }

    fn scan_object(&self, thread: u32, obj: usize) {
        let heap = self.heap;
        add_alive(heap, thread, obj);
        let in_old = !heap.region_of(obj).is_young();
        let mut visit = |slot: ObjectSlot, kind: SlotKind| {
            let value = slot.load();
            if !value.is_object() {
                return;
            }
            if kind == SlotKind::Weak {
                heap.work_manager.push_weak_reference(thread, slot);
                return;
            }
            let to = self.process_slot(thread, slot, value);
            if in_old && heap.region_of(to).is_young() {
                heap.region_of(slot.address())
                    .insert_old_to_new(slot.address());
            }
        };
        // SAFETY: `obj` is a copy made by this collection.
        unsafe { object::visit_object_slots(obj, &mut visit) };
    }
}

// ── Full compaction ───────────────────────────────────────────────────

pub struct CompressGcMarker<'h> {
    heap: &'h HeapInner,
}

impl<'h> CompressGcMarker<'h> {
    pub fn new(heap: &'h HeapInner) -> Self {
        Self { heap }
    }

    /// Moves objects of evacuating regions and marks everything else.
    /// Returns the object's final address.
    fn mark_object(&self, thread: u32, addr: usize) -> usize {
        let region = self.heap.region_of(addr);
        if region.is_snapshot() {
            return addr;
        }
        if region.is_evacuating() {
            let (to, first) = evacuate_object(self.heap, thread, addr, CopyTarget::Compress);
            if first {
                self.push(thread, to);
            }
            return to;
        }
        if region.atomic_mark(addr) {
            self.push(thread, addr);
        }
        addr
    }

    /// Scans every snapshot object as a root.
    pub fn process_snapshot_objects(&self, thread: u32) {
        self.heap.snapshot_space().iterate_objects(&mut |obj| self.visit_slots(thread, obj));
    }

    fn visit_slots(&self, thread: u32, obj: usize) {
        let heap = self.heap;
        let mut visit = |slot: ObjectSlot, kind: SlotKind| {
            let value = slot.load();
            if !value.is_object() {
                return;
            }
            if kind == SlotKind::Weak {
                heap.work_manager.push_weak_reference(thread, slot);
                return;
            }
            let to = self.mark_object(thread, value.addr());
            if to != value.addr() {
                slot.store(Value::from_addr(to));
            }
        };
        // SAFETY: `obj` is a copy or an unmoved live object.
        unsafe { object::visit_object_slots(obj, &mut visit) };
    }
}

impl Marker for CompressGcMarker<'_> {
    const PHASE: ParallelGcTaskPhase = ParallelGcTaskPhase::CompressHandleGlobalPool;

    fn heap(&self) -> &HeapInner {
        self.heap
    }

    fn mark_root(&self, thread: u32, slot: ObjectSlot) -> SlotStatus {
        let value = slot.load();
        if value.is_object() {
            let to = self.mark_object(thread, value.addr());
            if to != value.addr() {
                slot.store(Value::from_addr(to));
            }
        }
        SlotStatus::ClearSlot
    }

    fn scan_object(&self, thread: u32, obj: usize) {
        add_alive(self.heap, thread, obj);
        self.visit_slots(thread, obj);
    }
}
