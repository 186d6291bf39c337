//! Allocation stress run: builds a linked list with periodic garbage and
//! drives every kind of collection over it.

use std::time::Instant;

use heap::{GcStats, Heap, HeapSettings, TriggerGcType};
use object::{ObjectType, Value};

#[derive(Debug, Clone)]
pub struct StressOptions {
    pub objects: usize,
    /// Every `live_every`-th object is kept alive.
    pub live_every: usize,
    pub concurrent: bool,
    pub settings: HeapSettings,
}

impl Default for StressOptions {
    fn default() -> Self {
        Self {
            objects: 200_000,
            live_every: 10,
            concurrent: true,
            settings: HeapSettings::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StressReport {
    pub allocated: usize,
    pub live_objects: usize,
    pub heap_object_size: usize,
    pub committed_size: usize,
    pub elapsed_ms: f64,
    pub stats: GcStats,
}

const NODE_FIELDS: usize = 2;

fn allocate_node(heap: &Heap, tag: usize, next: Value) -> Value {
    let node = heap.allocate_young_or_huge(ObjectType::Slots, object::fields_allocation_size(NODE_FIELDS));
    heap.write_field(node, 0, Value::from_i64(tag as i64));
    heap.write_field(node, 1, next);
    node
}

/// Walks the list from `head` and checks that tags strictly decrease.
fn count_live(heap: &Heap, head: Value) -> Result<usize, String> {
    let mut count = 0;
    let mut previous = i64::MAX;
    let mut cursor = head;
    while !cursor.is_undefined() {
        if !heap.is_alive(cursor.addr()) {
            return Err(format!("list node {count} at 0x{:x} is dead", cursor.addr()));
        }
        // SAFETY: field 0 of every node holds a small integer.
        let tag = unsafe { heap.read_field(cursor, 0).to_i64() };
        if tag >= previous {
            return Err(format!("list node {count} has tag {tag} after {previous}"));
        }
        previous = tag;
        count += 1;
        cursor = heap.read_field(cursor, 1);
    }
    Ok(count)
}

pub fn run(options: &StressOptions) -> Result<StressReport, String> {
    let settings = HeapSettings {
        concurrent_marking: options.concurrent,
        ..options.settings.clone()
    };
    settings.validate()?;
    let live_every = options.live_every.max(1);
    let heap = Heap::new(settings);
    let start = Instant::now();

    let head = heap.global_handles().new_global_handle(Value::UNDEFINED);
    let mut expected = 0;
    for i in 0..options.objects {
        if i % live_every == 0 {
            let node = allocate_node(&heap, i, head.get());
            head.set(node);
            expected += 1;
        } else {
            allocate_node(&heap, i, Value::UNDEFINED);
        }
    }
    log::debug!("allocated {} objects, {expected} reachable", options.objects);

    for gc_type in [TriggerGcType::Young, TriggerGcType::Old, TriggerGcType::Full] {
        heap.collect_garbage(gc_type);
        let live = count_live(&heap, head.get())?;
        if live != expected {
            return Err(format!("{gc_type:?} collection left {live} of {expected} list nodes"));
        }
    }
    let dead = heap.verify();
    if dead != 0 {
        return Err(format!("heap verification found {dead} bad references"));
    }

    heap.print_statistic_result();
    let report = StressReport {
        allocated: options.objects,
        live_objects: expected,
        heap_object_size: heap.heap_object_size(),
        committed_size: heap.committed_size(),
        elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
        stats: heap.gc_stats(),
    };
    heap.global_handles().dispose(head);
    heap.destroy();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KB: usize = 1024;
    const MB: usize = 1024 * KB;

    fn small_settings() -> HeapSettings {
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

    fn options(objects: usize, live_every: usize, concurrent: bool) -> StressOptions {
        StressOptions {
            objects,
            live_every,
            concurrent,
            settings: small_settings(),
        }
    }

    // ── runs ──

    #[test]
    fn keeps_every_reachable_node() {
        let report = run(&options(5_000, 10, false)).unwrap();
        assert_eq!(report.allocated, 5_000);
        assert_eq!(report.live_objects, 500);
        assert!(report.stats.young.count >= 1);
        assert!(report.stats.full.count >= 1);
        assert!(report.stats.collection_count() >= 3);
    }

    #[test]
    fn concurrent_marking_run() {
        let report = run(&options(5_000, 3, true)).unwrap();
        assert_eq!(report.live_objects, 1_667);
    }

    #[test]
    fn zero_live_every_keeps_everything() {
        let report = run(&options(100, 0, false)).unwrap();
        assert_eq!(report.live_objects, 100);
    }

    #[test]
    fn empty_run() {
        let report = run(&options(0, 1, false)).unwrap();
        assert_eq!(report.live_objects, 0);
    }

    // ── settings ──

    #[test]
    fn rejects_invalid_settings() {
        let mut bad = options(10, 1, false);
        bad.settings.region_size = 3;
        assert!(run(&bad).is_err());
    }
}
