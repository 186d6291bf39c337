use crate::OS_PAGE_SIZE;

const KB: usize = 1024;
const MB: usize = 1024 * KB;

/// Configuration of the region heap.
#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Size and alignment of a region. Multiple of the OS page size.
    pub region_size: usize,
    /// Reserved address range. Multiple of `region_size`.
    pub max_heap_size: usize,
    pub semi_space_initial_capacity: usize,
    pub semi_space_max_capacity: usize,
    pub old_space_initial_capacity: usize,
    pub old_space_max_capacity: usize,
    pub non_movable_space_capacity: usize,
    pub machine_code_space_capacity: usize,
    pub snapshot_space_capacity: usize,
    /// Objects at least this big get their own region run.
    pub huge_object_threshold: usize,
    /// GC worker threads. 0 runs all GC work on the calling thread.
    pub parallel_gc_threads: usize,
    pub concurrent_marking: bool,
    pub parallel_gc: bool,
    pub min_cset_regions: usize,
    pub max_cset_regions: usize,
    /// Regions at least this full of live bytes are never evacuated.
    pub most_alive_rate: f64,
    pub work_node_capacity: usize,
    pub tlab_size: usize,
    /// Turn every old collection into a compacting one.
    pub full_gc_every_old_gc: bool,
    /// Smallest step by which allocation limits grow.
    pub min_growing_step: usize,
    /// Floor for the recomputed old-space limit.
    pub min_old_space_limit: usize,
}

impl Default for HeapSettings {
    fn default() -> Self {
        let region_size = 256 * KB;
        let parallel_gc_threads = std::thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1))
            .unwrap_or(0)
            .min(7);
        Self {
            region_size,
            max_heap_size: 256 * MB,
            semi_space_initial_capacity: 2 * MB,
            semi_space_max_capacity: 16 * MB,
            old_space_initial_capacity: 16 * MB,
            old_space_max_capacity: 192 * MB,
            non_movable_space_capacity: 16 * MB,
            machine_code_space_capacity: 8 * MB,
            snapshot_space_capacity: 8 * MB,
            huge_object_threshold: region_size / 2,
            parallel_gc_threads,
            concurrent_marking: true,
            parallel_gc: true,
            min_cset_regions: 5,
            max_cset_regions: 16,
            most_alive_rate: 0.8,
            work_node_capacity: 256,
            tlab_size: 32 * KB,
            full_gc_every_old_gc: false,
            min_growing_step: 4 * MB,
            min_old_space_limit: 2 * MB,
        }
    }
}

impl HeapSettings {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.region_size == 0 || self.max_heap_size == 0 {
            return Err("sizes must be > 0");
        }
        if !self.region_size.is_power_of_two() || !self.region_size.is_multiple_of(OS_PAGE_SIZE) {
            return Err("region_size must be a power of two and page aligned");
        }
        if !self.max_heap_size.is_multiple_of(self.region_size) {
            return Err("max_heap_size must be a multiple of region_size");
        }
        if self.semi_space_initial_capacity < self.region_size
            || self.semi_space_initial_capacity > self.semi_space_max_capacity
        {
            return Err("semi space capacities must satisfy region_size <= initial <= max");
        }
        if self.old_space_initial_capacity > self.old_space_max_capacity {
            return Err("old space initial capacity exceeds its maximum");
        }
        let reserved = self.semi_space_max_capacity * 2
            + self.old_space_max_capacity
            + self.non_movable_space_capacity
            + self.machine_code_space_capacity
            + self.snapshot_space_capacity;
        if reserved > self.max_heap_size {
            return Err("space capacities exceed max_heap_size");
        }
        if self.huge_object_threshold == 0 || self.huge_object_threshold > self.region_size {
            return Err("huge_object_threshold must be in 1..=region_size");
        }
        if self.min_cset_regions > self.max_cset_regions {
            return Err("min_cset_regions exceeds max_cset_regions");
        }
        if !(0.0..=1.0).contains(&self.most_alive_rate) {
            return Err("most_alive_rate must be between 0.0 and 1.0");
        }
        if self.work_node_capacity == 0 {
            return Err("work_node_capacity must be > 0");
        }
        if self.tlab_size < object::MIN_OBJECT_SIZE || self.tlab_size > self.region_size {
            return Err("tlab_size must fit in a region");
        }
        Ok(())
    }

    /// Worker threads that may mark in parallel. One worker stays free for
    /// the concurrent marking driver.
    pub fn max_mark_tasks(&self) -> usize {
        self.parallel_gc_threads.saturating_sub(1)
    }
}
