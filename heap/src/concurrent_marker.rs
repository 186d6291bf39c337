//! Concurrent marking.
//!
//! The mutator scans the roots, then a driver task on a GC worker drains
//! the mark stack together with helper tasks while the mutator runs on.
//! Objects allocated meanwhile are born marked and the write barrier
//! shades every stored reference; roots are rescanned at remark.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::{HeapInner, MAIN_THREAD_INDEX, Marker, NonMovableMarker, ParallelGcTaskPhase};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerState {
    Ready,
    Marking,
    Finished,
}

#[derive(Debug)]
struct MarkerInner {
    state: MarkerState,
    started: Option<Instant>,
    duration: Duration,
    marked_bytes: usize,
}

#[derive(Debug)]
pub struct ConcurrentMarker {
    inner: Mutex<MarkerInner>,
    finished: Condvar,
}

impl Default for ConcurrentMarker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConcurrentMarker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MarkerInner {
                state: MarkerState::Ready,
                started: None,
                duration: Duration::ZERO,
                marked_bytes: 0,
            }),
            finished: Condvar::new(),
        }
    }

    pub fn state(&self) -> MarkerState {
        self.inner.lock().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == MarkerState::Ready
    }

    pub fn is_marking(&self) -> bool {
        self.state() == MarkerState::Marking
    }

    pub fn is_marking_finished(&self) -> bool {
        self.state() == MarkerState::Finished
    }

    /// Wall time of the last finished concurrent phase.
    pub fn duration_ms(&self) -> f64 {
        self.inner.lock().duration.as_secs_f64() * 1000.0
    }

    pub fn marked_bytes(&self) -> usize {
        self.inner.lock().marked_bytes
    }

    /// Starts a mark of the heap's current mark type. Runs on the mutator.
    pub fn mark(&self, heap: &HeapInner) {
        {
            let mut inner = self.inner.lock();
            if inner.state != MarkerState::Ready {
                return;
            }
            inner.state = MarkerState::Marking;
            inner.started = Some(Instant::now());
        }
        log::debug!("concurrent {:?} mark started", heap.mark_type());
        heap.prepare_marking();
        heap.set_marking(true);

        let marker = NonMovableMarker::new(heap);
        marker.process_roots(MAIN_THREAD_INDEX);
        if heap.is_full_mark() {
            marker.process_snapshot_objects(MAIN_THREAD_INDEX);
        } else {
            marker.process_old_to_new(MAIN_THREAD_INDEX);
            marker.process_snapshot_rset(MAIN_THREAD_INDEX);
        }
        heap.work_manager.flush(MAIN_THREAD_INDEX);

        if !heap.post_marking_driver() {
            self.run_driver(heap, MAIN_THREAD_INDEX);
        }
    }

    /// Drains the mark stack with helpers, then publishes the result.
    pub(crate) fn run_driver(&self, heap: &HeapInner, thread: u32) {
        let marker = NonMovableMarker::new(heap);
        for _ in 0..heap.settings.max_mark_tasks() {
            if !heap.post_parallel_gc_task(ParallelGcTaskPhase::ConcurrentHandleGlobalPool) {
                break;
            }
        }
        marker.process_mark_stack(thread);
        heap.wait_running_task_finished();
        marker.process_mark_stack(thread);

        let marked_bytes = heap.work_manager.alive_size();
        let mut inner = self.inner.lock();
        inner.duration = inner.started.take().map_or(Duration::ZERO, |s| s.elapsed());
        inner.marked_bytes = marked_bytes;
        inner.state = MarkerState::Finished;
        log::debug!(
            "concurrent mark finished in {:.3}ms, marked {marked_bytes} bytes",
            inner.duration.as_secs_f64() * 1000.0
        );
        drop(inner);
        self.finished.notify_all();
    }

    pub fn wait_marking_finished(&self) {
        let mut inner = self.inner.lock();
        while inner.state == MarkerState::Marking {
            self.finished.wait(&mut inner);
        }
    }

    /// Finishes the mark inside a pause: drains what the barrier queued,
    /// rescans the roots and drains again until nothing is left gray.
    pub fn remark(&self, heap: &HeapInner) {
        let start = Instant::now();
        heap.check_ongoing_concurrent_marking();
        let marker = NonMovableMarker::new(heap);
        marker.process_roots(MAIN_THREAD_INDEX);
        if !heap.is_full_mark() {
            marker.process_old_to_new(MAIN_THREAD_INDEX);
            marker.process_snapshot_rset(MAIN_THREAD_INDEX);
        }
        heap.work_manager.flush(MAIN_THREAD_INDEX);
        for _ in 0..heap.settings.max_mark_tasks() {
            if !heap.post_parallel_gc_task(ParallelGcTaskPhase::OldHandleGlobalPool) {
                break;
            }
        }
        marker.process_mark_stack(MAIN_THREAD_INDEX);
        heap.wait_running_task_finished();
        marker.process_mark_stack(MAIN_THREAD_INDEX);
        log::debug!("remark took {:?}", start.elapsed());
    }

    /// Forgets the current mark. The caller must have waited for it.
    pub fn reset(&self, heap: &HeapInner) {
        let mut inner = self.inner.lock();
        debug_assert_ne!(inner.state, MarkerState::Marking, "reset while marking");
        inner.state = MarkerState::Ready;
        inner.started = None;
        heap.set_marking(false);
    }
}
