use parking_lot::{Condvar, Mutex};
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

/// A unit of GC work. The argument is the worker's thread index, which
/// selects its [`WorkNodeHolder`](crate::WorkNodeHolder). Index 0 is
/// reserved for the mutator, so workers start at 1.
pub type Task = Box<dyn FnOnce(u32) + Send + 'static>;

struct Shared {
    queue: Mutex<VecDeque<Task>>,
    has_work: Condvar,
    should_stop: AtomicBool,
}

/// Fixed set of named GC worker threads fed from one queue.
pub struct TaskPool {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskPool {
    /// Spawns `workers` threads. A pool of zero workers accepts no tasks;
    /// callers run the work inline instead.
    pub fn new(workers: usize) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            has_work: Condvar::new(),
            should_stop: AtomicBool::new(false),
        });
        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let me = shared.clone();
            let thread_id = i as u32 + 1;
            let handle = thread::Builder::new()
                .name(format!("gc-worker-{thread_id}"))
                .spawn(move || worker_loop(&me, thread_id))?;
            handles.push(handle);
        }
        log::debug!("gc task pool started with {workers} workers");
        Ok(Self {
            shared,
            handles: Mutex::new(handles),
        })
    }

    pub fn worker_count(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn post(&self, task: Task) {
        self.shared.queue.lock().push_back(task);
        self.shared.has_work.notify_one();
    }

    /// Stops the workers after the queue drains. A worker dropping the
    /// last reference to the pool is not joined.
    pub fn shutdown(&self) {
        self.shared.should_stop.store(true, Ordering::Release);
        self.shared.has_work.notify_all();
        let current = thread::current().id();
        for handle in self.handles.lock().drain(..) {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl core::fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TaskPool")
            .field("workers", &self.worker_count())
            .field("queued", &self.shared.queue.lock().len())
            .finish()
    }
}

fn worker_loop(shared: &Shared, thread_id: u32) {
    loop {
        let task = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(task) = queue.pop_front() {
                    break task;
                }
                if shared.should_stop.load(Ordering::Acquire) {
                    return;
                }
                shared.has_work.wait(&mut queue);
            }
        };
        task(thread_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn runs_posted_tasks_on_worker_ids() {
        let pool = TaskPool::new(3).unwrap();
        let done = Arc::new((Mutex::new(Vec::new()), Condvar::new()));
        for _ in 0..12 {
            let done = done.clone();
            pool.post(Box::new(move |id| {
                done.0.lock().push(id);
                done.1.notify_one();
            }));
        }
        let mut ids = done.0.lock();
        while ids.len() < 12 {
            done.1.wait(&mut ids);
        }
        assert!(ids.iter().all(|&id| (1..=3).contains(&id)));
    }

    #[test]
    fn shutdown_drains_queue() {
        let count = Arc::new(AtomicUsize::new(0));
        {
            let pool = TaskPool::new(2).unwrap();
            for _ in 0..50 {
                let count = count.clone();
                pool.post(Box::new(move |_| {
                    count.fetch_add(1, Ordering::Relaxed);
                }));
            }
        }
        assert_eq!(count.load(Ordering::Relaxed), 50);
    }
}
