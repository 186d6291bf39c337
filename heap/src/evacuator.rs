//! Object copying.
//!
//! [`evacuate_object`] is shared by every moving phase: it places the copy
//! through the calling thread's TLABs and installs the forwarding pointer.
//! [`Evacuator`] drives the copy phase of a partial collection, where the
//! objects to move are already marked and each region has one owner.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;

use object::{MarkWord, ObjectSlot, SlotKind, Value};

use crate::{HeapInner, MAIN_THREAD_INDEX, ParallelGcTaskPhase, Region, RegionId, SparseSpace};

/// Where a copy is placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CopyTarget {
    /// The active semi space, falling back to the old space when full.
    Young,
    Old,
    /// The compaction target of a full collection.
    Compress,
}

fn allocate_young_copy(heap: &HeapInner, thread: u32, size: usize) -> Option<usize> {
    let tlab_size = heap.settings.tlab_size;
    let semi = heap.active_semi_space();
    if size > tlab_size / 2 {
        return semi.allocate_chunk(size);
    }
    let mut holder = heap.work_manager.holder(thread);
    if let Some(addr) = holder.young_tlab.allocate(size) {
        return Some(addr);
    }
    let start = semi.allocate_chunk(tlab_size)?;
    if let Some((tail, len)) = holder.young_tlab.take_remaining() {
        // SAFETY: the tail of a retired young TLAB is unused to-space memory.
        unsafe { object::init_free(tail, len) };
    }
    holder.young_tlab.reset(start, start + tlab_size);
    holder.young_tlab.allocate(size)
}

fn allocate_old_copy(heap: &HeapInner, thread: u32, size: usize, space: &SparseSpace) -> Option<usize> {
    let tlab_size = heap.settings.tlab_size;
    if size > tlab_size / 2 {
        return space.allocate(size);
    }
    let mut holder = heap.work_manager.holder(thread);
    if let Some(addr) = holder.old_tlab.allocate(size) {
        return Some(addr);
    }
    let (start, len) = space.allocate_chunk(size, tlab_size)?;
    if let Some((tail, rest)) = holder.old_tlab.take_remaining() {
        space.add_free(tail, rest);
    }
    holder.old_tlab.reset(start, start + len);
    holder.old_tlab.allocate(size)
}

fn allocate_copy(heap: &HeapInner, thread: u32, size: usize, target: CopyTarget) -> usize {
    let addr = match target {
        CopyTarget::Young => allocate_young_copy(heap, thread, size)
            .or_else(|| allocate_old_copy(heap, thread, size, heap.old_space())),
        CopyTarget::Old => allocate_old_copy(heap, thread, size, heap.old_space()),
        CopyTarget::Compress => allocate_old_copy(heap, thread, size, heap.compress_space()),
    };
    addr.unwrap_or_else(|| heap.throw_out_of_memory_error(size, "evacuate_object"))
}

/// Moves the object at `addr` unless another thread got there first.
///
/// The copy is made before the forwarding pointer is published; a thread
/// that loses the race turns its copy into a filler and follows the
/// winner. Returns the copy and whether this call created it. Copies
/// outside the young generation are marked so a following sweep keeps them.
pub(crate) fn evacuate_object(heap: &HeapInner, thread: u32, addr: usize, target: CopyTarget) -> (usize, bool) {
    loop {
        // SAFETY: `addr` is an object in an evacuating region, which stays
        // mapped until the collection finishes.
        let word = unsafe { MarkWord::load(addr) };
        if let Some(to) = word.forwarding_address() {
            return (to, false);
        }
        // SAFETY: as above.
        let size = unsafe { object::object_size(addr) };
        let to = allocate_copy(heap, thread, size, target);
        let hash = match word {
            MarkWord::Hashed(hash) => Some(hash),
            _ => None,
        };
        // SAFETY: `to` is fresh memory of `size` bytes; the source stays
        // unchanged apart from its mark word.
        unsafe { object::copy_object(addr, to, size, hash) };
        // SAFETY: as above.
        match unsafe { MarkWord::compare_exchange(addr, word, MarkWord::Forwarded(to)) } {
            Ok(()) => {
                let dest = heap.region_of(to);
                if !dest.is_young() {
                    dest.mark(to);
                    if heap.region_of(addr).is_young() {
                        heap.work_manager.holder(thread).promoted_size += size;
                    }
                }
                return (to, true);
            }
            Err(current) => {
                // SAFETY: the copy was never published.
                unsafe { object::init_free(to, size) };
                if let Some(winner) = current.forwarding_address() {
                    return (winner, false);
                }
            }
        }
    }
}

/// Hands every thread's unused TLAB tails back. Must run before references
/// are updated and before any sweep, so every region is walkable again.
pub(crate) fn retire_tlabs(heap: &HeapInner, old_target: &SparseSpace) {
    for thread in 0..heap.work_manager.thread_count() {
        let mut holder = heap.work_manager.holder(thread as u32);
        if let Some((tail, len)) = holder.young_tlab.take_remaining() {
            // SAFETY: unused to-space memory.
            unsafe { object::init_free(tail, len) };
        }
        if let Some((tail, len)) = holder.old_tlab.take_remaining() {
            old_target.add_free(tail, len);
        }
    }
}

/// Shared cursor state of the parallel copy and update phases.
#[derive(Debug, Default)]
pub struct EvacuationWork {
    regions: RwLock<Vec<RegionId>>,
    copies: RwLock<Vec<usize>>,
    cursor: AtomicUsize,
}

/// Copies claimed per cursor step in the update phase.
const UPDATE_CHUNK: usize = 64;

/// Copy and reference-update phases of a partial collection.
pub(crate) struct Evacuator<'h> {
    heap: &'h HeapInner,
}

impl<'h> Evacuator<'h> {
    pub(crate) fn new(heap: &'h HeapInner) -> Self {
        Self { heap }
    }

    fn post_helpers(&self, phase: ParallelGcTaskPhase) {
        for _ in 0..self.heap.settings.parallel_gc_threads {
            if !self.heap.post_parallel_gc_task(phase) {
                break;
            }
        }
    }

    /// Copies every marked object out of `regions`, which must already be
    /// flagged as evacuating, then gathers the copies for the update phase.
    pub(crate) fn evacuate(&self, regions: Vec<RegionId>) {
        let work = &self.heap.evacuation;
        log::trace!("evacuating {} regions", regions.len());
        *work.regions.write() = regions;
        work.cursor.store(0, Ordering::Release);
        self.post_helpers(ParallelGcTaskPhase::EvacuateRegions);
        self.evacuate_regions(MAIN_THREAD_INDEX);
        self.heap.wait_running_task_finished();

        let mut copies = Vec::new();
        for thread in 0..self.heap.work_manager.thread_count() {
            copies.append(&mut self.heap.work_manager.holder(thread as u32).evacuated);
        }
        log::trace!("evacuated {} objects", copies.len());
        *work.copies.write() = copies;
        work.regions.write().clear();
    }

    /// Claims regions until none are left.
    pub(crate) fn evacuate_regions(&self, thread: u32) {
        let work = &self.heap.evacuation;
        let regions = work.regions.read();
        loop {
            let index = work.cursor.fetch_add(1, Ordering::AcqRel);
            let Some(&id) = regions.get(index) else {
                break;
            };
            self.evacuate_region(thread, self.heap.region_allocator().region(id));
        }
    }

    fn evacuate_region(&self, thread: u32, region: &Region) {
        let heap = self.heap;
        let from_young = region.is_young();
        let from = heap.inactive_semi_space();
        let mut copies = Vec::new();
        region.iterate_marked_objects(|addr| {
            let target = if from_young && !from.is_below_water_line(region, addr) {
                CopyTarget::Young
            } else {
                CopyTarget::Old
            };
            let (to, _) = evacuate_object(heap, thread, addr, target);
            copies.push(to);
        });
        heap.work_manager.holder(thread).evacuated.append(&mut copies);
    }

    /// Updates the slots of every copy, in parallel.
    pub(crate) fn update_references(&self) {
        self.heap.evacuation.cursor.store(0, Ordering::Release);
        self.post_helpers(ParallelGcTaskPhase::UpdateReferences);
        self.update_copies(MAIN_THREAD_INDEX);
        self.heap.wait_running_task_finished();
        self.heap.evacuation.copies.write().clear();
    }

    /// Claims chunks of copies until none are left.
    pub(crate) fn update_copies(&self, _thread: u32) {
        let work = &self.heap.evacuation;
        let copies = work.copies.read();
        loop {
            let start = work.cursor.fetch_add(UPDATE_CHUNK, Ordering::AcqRel);
            if start >= copies.len() {
                break;
            }
            let end = (start + UPDATE_CHUNK).min(copies.len());
            for &obj in &copies[start..end] {
                self.update_object(obj);
            }
        }
    }

    fn update_object(&self, obj: usize) {
        let heap = self.heap;
        let in_old = !heap.region_of(obj).is_young();
        let marks_valid = heap.is_full_mark();
        let mut update = |slot: ObjectSlot, kind: SlotKind| {
            let value = slot.load();
            if !value.is_object() {
                return;
            }
            let target = match kind {
                SlotKind::Weak => match heap.resolve_weak(value.addr(), marks_valid) {
                    Some(addr) => addr,
                    None => {
                        slot.store(Value::UNDEFINED);
                        return;
                    }
                },
                SlotKind::Strong => forwarded(heap, value.addr()),
            };
            if target != value.addr() {
                slot.store(Value::from_addr(target));
            }
            if in_old && heap.region_of(target).is_young() {
                heap.region_of(slot.address())
                    .insert_old_to_new(slot.address());
            }
        };
        // SAFETY: `obj` is a fully initialized copy.
        unsafe { object::visit_object_slots(obj, &mut update) };
    }
}

/// The new address of a live object, or `addr` itself when it did not move.
pub(crate) fn forwarded(heap: &HeapInner, addr: usize) -> usize {
    if !heap.region_of(addr).is_evacuating() {
        return addr;
    }
    // SAFETY: evacuating regions keep their objects until the collection ends.
    let to = unsafe { MarkWord::load(addr) }.forwarding_address();
    debug_assert!(to.is_some(), "live object 0x{addr:x} was not evacuated");
    to.unwrap_or(addr)
}

/// Result of updating a remembered slot after evacuation: the referent's
/// current address, or `None` when the slot belongs to a dead holder.
pub(crate) fn update_remembered_slot(heap: &HeapInner, slot: ObjectSlot) -> Option<usize> {
    let value = slot.load();
    if !value.is_object() {
        return None;
    }
    let addr = value.addr();
    if !heap.region_of(addr).is_evacuating() {
        return Some(addr);
    }
    // SAFETY: as in `forwarded`.
    let to = unsafe { MarkWord::load(addr) }.forwarding_address()?;
    slot.store(Value::from_addr(to));
    Some(to)
}
