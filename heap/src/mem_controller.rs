//! Allocation-limit and growth-factor policy.
//!
//! The controller keeps short histories of how fast the mutator allocates
//! and how fast the collector marks, and turns them into the old-space and
//! global limits that decide when the next old collection starts.

use std::time::Instant;

use crate::GcKind;

const RING_LENGTH: usize = 10;

/// Bytes processed and the milliseconds it took.
pub type BytesAndDuration = (usize, f64);

/// How aggressively limits grow after a collection.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemGrowingType {
    #[default]
    HighThroughput,
    Conservative,
    Pressure,
}

#[derive(Debug, Clone)]
pub struct RingBuffer<T, const N: usize> {
    items: [T; N],
    start: usize,
    len: usize,
}

impl<T: Copy + Default, const N: usize> Default for RingBuffer<T, N> {
    fn default() -> Self {
        Self {
            items: [T::default(); N],
            start: 0,
            len: 0,
        }
    }
}

impl<T: Copy, const N: usize> RingBuffer<T, N> {
    pub fn push(&mut self, item: T) {
        if self.len == N {
            self.items[self.start] = item;
            self.start = (self.start + 1) % N;
        } else {
            self.items[(self.start + self.len) % N] = item;
            self.len += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Folds from the newest entry to the oldest.
    pub fn fold<A>(&self, initial: A, mut f: impl FnMut(A, T) -> A) -> A {
        let mut acc = initial;
        for i in (0..self.len).rev() {
            acc = f(acc, self.items[(self.start + i) % N]);
        }
        acc
    }

    pub fn reset(&mut self) {
        self.start = 0;
        self.len = 0;
    }
}

type History = RingBuffer<BytesAndDuration, RING_LENGTH>;

/// Average throughput in bytes per millisecond, clamped to
/// `1..=1 GiB`. Entries older than `time_ms` of accumulated duration are
/// ignored when `time_ms` is non-zero. An empty history yields 0.
pub fn average_speed(buffer: &History, initial: BytesAndDuration, time_ms: f64) -> f64 {
    let (bytes, duration) = buffer.fold(initial, |acc, item| {
        if time_ms != 0.0 && acc.1 >= time_ms {
            acc
        } else {
            (acc.0 + item.0, acc.1 + item.1)
        }
    });
    if duration == 0.0 {
        return 0.0;
    }
    const MAX_SPEED: f64 = (1024 * 1024 * 1024) as f64;
    const MIN_SPEED: f64 = 1.0;
    (bytes as f64 / duration).clamp(MIN_SPEED, MAX_SPEED)
}

/// Allocation counters sampled at the start of a collection.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocationSample {
    pub new_space_since_gc: usize,
    pub huge_object_size: usize,
    pub old_total_allocated: usize,
    pub non_movable_total_allocated: usize,
    pub machine_code_total_allocated: usize,
}

#[derive(Debug)]
pub struct MemController {
    epoch: Instant,
    min_growing_step: usize,
    start_counter: u32,
    alloc_time_ms: f64,
    gc_start_ms: f64,
    alloc_duration_since_gc: f64,

    new_space_since_gc: usize,
    old_space_since_gc: usize,
    non_movable_since_gc: usize,
    code_since_gc: usize,

    old_accumulated: usize,
    non_movable_accumulated: usize,
    code_accumulated: usize,
    huge_since_gc_base: usize,

    new_space_allocations: History,
    old_space_allocations: History,
    non_movable_allocations: History,
    code_allocations: History,
    mark_compacts: History,
    concurrent_marks: History,
    semi_concurrent_marks: History,

    survival_rates: RingBuffer<f64, RING_LENGTH>,
    mark_compact_speed_cache: f64,
}

impl MemController {
    pub fn new(min_growing_step: usize) -> Self {
        Self {
            epoch: Instant::now(),
            min_growing_step,
            start_counter: 0,
            alloc_time_ms: 0.0,
            gc_start_ms: 0.0,
            alloc_duration_since_gc: 0.0,
            new_space_since_gc: 0,
            old_space_since_gc: 0,
            non_movable_since_gc: 0,
            code_since_gc: 0,
            old_accumulated: 0,
            non_movable_accumulated: 0,
            code_accumulated: 0,
            huge_since_gc_base: 0,
            new_space_allocations: History::default(),
            old_space_allocations: History::default(),
            non_movable_allocations: History::default(),
            code_allocations: History::default(),
            mark_compacts: History::default(),
            concurrent_marks: History::default(),
            semi_concurrent_marks: History::default(),
            survival_rates: RingBuffer::default(),
            mark_compact_speed_cache: 0.0,
        }
    }

    fn now_ms(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64() * 1000.0
    }

    /// Next limit for a space currently holding `current` bytes.
    pub fn calculate_alloc_limit(
        &self,
        current: usize,
        min: usize,
        max: usize,
        new_space_capacity: usize,
        factor: f64,
    ) -> usize {
        let grown = ((current as f64 * factor) as u64).max(current as u64 + self.min_growing_step as u64);
        let limit = grown + new_space_capacity as u64;
        let above_min = limit.max(min as u64);
        let half_to_max = (current as u64 + max as u64) / 2;
        above_min.min(half_to_max).min(max as u64) as usize
    }

    /// Growth factor from the ratio of marking speed to allocation speed,
    /// aiming at 97% mutator utilization.
    pub fn calculate_growing_factor(&self, gc_speed: f64, mutator_speed: f64, growing: MemGrowingType) -> f64 {
        let mut max_factor = 4.0;
        let mut min_factor = 1.3;
        const MINIMUM_FACTOR: f64 = 1.1;
        match growing {
            MemGrowingType::HighThroughput => {}
            MemGrowingType::Conservative => {
                min_factor = MINIMUM_FACTOR;
                max_factor = 2.0;
            }
            MemGrowingType::Pressure => return MINIMUM_FACTOR,
        }
        const TARGET_MUTATOR_UTILIZATION: f64 = 0.97;
        if gc_speed == 0.0 || mutator_speed == 0.0 {
            return max_factor;
        }
        let speed_ratio = gc_speed / mutator_speed;
        let a = speed_ratio * (1.0 - TARGET_MUTATOR_UTILIZATION);
        let b = a - TARGET_MUTATOR_UTILIZATION;
        let factor = if a < b * max_factor { a / b } else { max_factor };
        let factor = factor.min(max_factor).max(min_factor);
        log::trace!("growing factor gc {gc_speed:.1} mutator {mutator_speed:.1} -> {factor:.2}");
        factor
    }

    /// Samples allocation counters. Nested calls only count once.
    pub fn start_calculation(&mut self, sample: AllocationSample) {
        self.start_counter += 1;
        if self.start_counter != 1 {
            return;
        }
        let now = self.now_ms();
        self.gc_start_ms = now;
        let huge_since_gc = sample.huge_object_size.saturating_sub(self.huge_since_gc_base);
        let old = sample.old_total_allocated.saturating_sub(self.old_accumulated);
        let non_movable = sample
            .non_movable_total_allocated
            .saturating_sub(self.non_movable_accumulated);
        let code = sample
            .machine_code_total_allocated
            .saturating_sub(self.code_accumulated);

        self.alloc_duration_since_gc += now - self.alloc_time_ms;
        self.alloc_time_ms = now;
        self.old_accumulated = sample.old_total_allocated;
        self.non_movable_accumulated = sample.non_movable_total_allocated;
        self.code_accumulated = sample.machine_code_total_allocated;

        self.new_space_since_gc += sample.new_space_since_gc;
        self.old_space_since_gc += old + huge_since_gc;
        self.non_movable_since_gc += non_movable;
        self.code_since_gc += code;
    }

    /// Closes a sampling window opened by [`start_calculation`](Self::start_calculation).
    /// `full_mark_duration` is the concurrent mark time to add for a
    /// full-mark partial collection, `None` when the mark was young.
    pub fn stop_calculation(
        &mut self,
        kind: GcKind,
        heap_object_size: usize,
        promoted_size: usize,
        huge_object_size: usize,
        full_mark_duration: Option<f64>,
    ) {
        self.start_counter = self.start_counter.saturating_sub(1);
        if self.start_counter != 0 {
            return;
        }
        let end = self.now_ms();
        self.alloc_time_ms = end;
        let duration_since_gc = self.alloc_duration_since_gc;
        if duration_since_gc > 0.0 {
            self.old_space_since_gc += promoted_size;
            self.new_space_allocations
                .push((self.new_space_since_gc, duration_since_gc));
            self.old_space_allocations
                .push((self.old_space_since_gc, duration_since_gc));
            self.non_movable_allocations
                .push((self.non_movable_since_gc, duration_since_gc));
            self.code_allocations.push((self.code_since_gc, duration_since_gc));
        }
        self.alloc_duration_since_gc = 0.0;
        self.new_space_since_gc = 0;
        self.old_space_since_gc = 0;
        self.non_movable_since_gc = 0;
        self.code_since_gc = 0;
        self.huge_since_gc_base = huge_object_size;

        let duration = end - self.gc_start_ms;
        match (kind, full_mark_duration) {
            (GcKind::Full, _) => self.mark_compacts.push((heap_object_size, duration)),
            (_, Some(mark)) => self.mark_compacts.push((heap_object_size, duration + mark)),
            _ => {}
        }
    }

    pub fn record_after_concurrent_mark(&mut self, full: bool, marked_bytes: usize, duration_ms: f64) {
        if full {
            self.concurrent_marks.push((marked_bytes, duration_ms));
        } else {
            self.semi_concurrent_marks.push((marked_bytes, duration_ms));
        }
    }

    pub fn mark_compact_speed_per_ms(&mut self) -> f64 {
        self.mark_compact_speed_cache = average_speed(&self.mark_compacts, (0, 0.0), 0.0);
        self.mark_compact_speed_cache.max(0.0)
    }

    pub fn current_old_space_allocation_throughput_per_ms(&self, time_ms: f64) -> f64 {
        average_speed(
            &self.old_space_allocations,
            (self.old_space_since_gc, self.alloc_duration_since_gc),
            time_ms,
        )
    }

    pub fn new_space_allocation_throughput_per_ms(&self) -> f64 {
        average_speed(&self.new_space_allocations, (0, 0.0), 0.0)
    }

    pub fn old_space_allocation_throughput_per_ms(&self) -> f64 {
        average_speed(&self.old_space_allocations, (0, 0.0), 0.0)
    }

    pub fn new_space_concurrent_mark_speed_per_ms(&self) -> f64 {
        average_speed(&self.semi_concurrent_marks, (0, 0.0), 0.0)
    }

    pub fn full_space_concurrent_mark_speed_per_ms(&self) -> f64 {
        average_speed(&self.concurrent_marks, (0, 0.0), 0.0)
    }

    pub fn add_survival_rate(&mut self, rate: f64) {
        self.survival_rates.push(rate);
    }

    /// Mean of the recorded survival rates, 1.0 before the first sample.
    pub fn average_survival_rate(&self) -> f64 {
        if self.survival_rates.is_empty() {
            return 1.0;
        }
        let sum = self.survival_rates.fold(0.0, |acc, r| acc + r);
        sum / self.survival_rates.len() as f64
    }

    /// Forgets throughput history, used when memory pressure changes.
    pub fn reset_histories(&mut self) {
        self.survival_rates.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: usize = 1024 * 1024;

    // ── limits ───────────────────────────────────────────────────────

    #[test]
    fn alloc_limit_grows_by_at_least_the_step() {
        let mc = MemController::new(4 * MB);
        // 10MB * 1.1 = 11MB, step wins: 14MB + 2MB new space
        let limit = mc.calculate_alloc_limit(10 * MB, 2 * MB, 256 * MB, 2 * MB, 1.1);
        assert_eq!(limit, 16 * MB);
    }

    #[test]
    fn alloc_limit_is_capped_halfway_to_max() {
        let mc = MemController::new(4 * MB);
        let limit = mc.calculate_alloc_limit(100 * MB, 2 * MB, 128 * MB, 2 * MB, 4.0);
        assert_eq!(limit, 114 * MB);
    }

    #[test]
    fn alloc_limit_respects_minimum() {
        let mc = MemController::new(MB);
        let limit = mc.calculate_alloc_limit(0, 8 * MB, 256 * MB, 0, 2.0);
        assert_eq!(limit, 8 * MB);
    }

    // ── growing factor ───────────────────────────────────────────────

    #[test]
    fn growing_factor_defaults_to_max_without_history() {
        let mc = MemController::new(MB);
        assert_eq!(mc.calculate_growing_factor(0.0, 10.0, MemGrowingType::HighThroughput), 4.0);
        assert_eq!(mc.calculate_growing_factor(10.0, 0.0, MemGrowingType::Conservative), 2.0);
        assert_eq!(mc.calculate_growing_factor(10.0, 10.0, MemGrowingType::Pressure), 1.1);
    }

    #[test]
    fn growing_factor_stays_in_range() {
        let mc = MemController::new(MB);
        for (gc, mutator) in [(1000.0, 1.0), (100.0, 1.0), (10.0, 1.0), (1.0, 100.0)] {
            let f = mc.calculate_growing_factor(gc, mutator, MemGrowingType::HighThroughput);
            assert!((1.3..=4.0).contains(&f), "factor {f} for {gc}/{mutator}");
        }
        // slow collector relative to the mutator pins the maximum
        assert_eq!(mc.calculate_growing_factor(10.0, 1.0, MemGrowingType::HighThroughput), 4.0);
        // very fast collector: a/b approaches 1, clamped up to the minimum
        let fast = mc.calculate_growing_factor(1_000_000.0, 1.0, MemGrowingType::HighThroughput);
        assert_eq!(fast, 1.3);
    }

    // ── speeds ───────────────────────────────────────────────────────

    #[test]
    fn average_speed_of_empty_history_is_zero() {
        assert_eq!(average_speed(&History::default(), (0, 0.0), 0.0), 0.0);
    }

    #[test]
    fn average_speed_is_clamped() {
        let mut h = History::default();
        h.push((1, 1000.0));
        assert_eq!(average_speed(&h, (0, 0.0), 0.0), 1.0);
        h.reset();
        h.push((usize::MAX / 2, 1.0));
        assert_eq!(average_speed(&h, (0, 0.0), 0.0), (1024 * 1024 * 1024) as f64);
    }

    #[test]
    fn ring_buffer_keeps_latest_entries() {
        let mut r: RingBuffer<u32, 3> = RingBuffer::default();
        for i in 0..5 {
            r.push(i);
        }
        assert_eq!(r.len(), 3);
        assert_eq!(r.fold(Vec::new(), |mut v, x| {
            v.push(x);
            v
        }), vec![4, 3, 2]);
    }

    #[test]
    fn survival_rate_average() {
        let mut mc = MemController::new(MB);
        assert_eq!(mc.average_survival_rate(), 1.0);
        mc.add_survival_rate(0.2);
        mc.add_survival_rate(0.4);
        assert!((mc.average_survival_rate() - 0.3).abs() < 1e-9);
    }

    #[test]
    fn nested_calculation_windows_count_once() {
        let mut mc = MemController::new(MB);
        mc.start_calculation(AllocationSample::default());
        mc.start_calculation(AllocationSample::default());
        mc.stop_calculation(GcKind::Full, MB, 0, 0, None);
        assert!(mc.mark_compacts.is_empty());
        mc.stop_calculation(GcKind::Full, MB, 0, 0, None);
        assert_eq!(mc.mark_compacts.len(), 1);
    }
}
