//! Distribution of gray objects between GC threads.
//!
//! Each thread owns an inbound and an outbound [`WorkNode`]. Full inbound
//! nodes move to a lock-protected global stack as a whole, so threads only
//! contend once per node rather than once per object. Nodes come from a
//! generation-tagged pool and are recycled, not freed, until the heap dies.

use parking_lot::{Mutex, MutexGuard};

use object::ObjectSlot;

use crate::Tlab;

/// Index of a pooled node plus the generation it was handed out in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeId {
    slot: u32,
    generation: u32,
}

/// A fixed-capacity batch of gray objects.
#[derive(Debug)]
pub struct WorkNode {
    id: NodeId,
    objects: Vec<usize>,
}

impl WorkNode {
    #[inline(always)]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[inline(always)]
    fn is_full(&self) -> bool {
        self.objects.len() == self.objects.capacity()
    }
}

#[derive(Debug)]
struct NodePool {
    buffers: Vec<Option<Vec<usize>>>,
    generations: Vec<u32>,
    free: Vec<u32>,
    capacity: usize,
}

impl NodePool {
    fn allocate(&mut self) -> WorkNode {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.buffers.push(Some(Vec::with_capacity(self.capacity)));
                self.generations.push(0);
                (self.buffers.len() - 1) as u32
            }
        };
        let objects = self.buffers[slot as usize]
            .take()
            .unwrap_or_else(|| Vec::with_capacity(self.capacity));
        WorkNode {
            id: NodeId {
                slot,
                generation: self.generations[slot as usize],
            },
            objects,
        }
    }

    fn release(&mut self, mut node: WorkNode) {
        let slot = node.id.slot as usize;
        debug_assert_eq!(
            self.generations[slot], node.id.generation,
            "work node released twice"
        );
        self.generations[slot] = self.generations[slot].wrapping_add(1);
        node.objects.clear();
        self.buffers[slot] = Some(node.objects);
        self.free.push(node.id.slot);
    }
}

/// Per-thread marking state.
#[derive(Debug)]
pub struct WorkNodeHolder {
    in_node: Option<WorkNode>,
    out_node: Option<WorkNode>,
    pub weak_queue: Vec<ObjectSlot>,
    pub alive_size: usize,
    pub promoted_size: usize,
    pub young_tlab: Tlab,
    pub old_tlab: Tlab,
    /// Copies made by this thread during a partial collection.
    pub evacuated: Vec<usize>,
}

impl WorkNodeHolder {
    fn new() -> Self {
        Self {
            in_node: None,
            out_node: None,
            weak_queue: Vec::new(),
            alive_size: 0,
            promoted_size: 0,
            young_tlab: Tlab::default(),
            old_tlab: Tlab::default(),
            evacuated: Vec::new(),
        }
    }
}

pub struct WorkManager {
    holders: Box<[Mutex<WorkNodeHolder>]>,
    global: Mutex<Vec<WorkNode>>,
    pool: Mutex<NodePool>,
}

impl WorkManager {
    /// `threads` counts the mutator (index 0) plus every GC worker.
    pub fn new(threads: usize, node_capacity: usize) -> Self {
        assert!(node_capacity > 0, "work nodes must hold at least one object");
        Self {
            holders: (0..threads).map(|_| Mutex::new(WorkNodeHolder::new())).collect(),
            global: Mutex::new(Vec::new()),
            pool: Mutex::new(NodePool {
                buffers: Vec::new(),
                generations: Vec::new(),
                free: Vec::new(),
                capacity: node_capacity,
            }),
        }
    }

    #[inline(always)]
    pub fn thread_count(&self) -> usize {
        self.holders.len()
    }

    #[inline(always)]
    pub fn holder(&self, thread: u32) -> MutexGuard<'_, WorkNodeHolder> {
        self.holders[thread as usize].lock()
    }

    /// Resets every holder for a new marking phase. Work left over from an
    /// abandoned mark is dropped.
    pub fn initialize(&self) {
        let stale: Vec<WorkNode> = self.global.lock().drain(..).collect();
        {
            let mut pool = self.pool.lock();
            for node in stale {
                pool.release(node);
            }
        }
        for holder in self.holders.iter() {
            let mut guard = holder.lock();
            let h = &mut *guard;
            for node in [&mut h.in_node, &mut h.out_node] {
                match node {
                    Some(n) => n.objects.clear(),
                    None => *node = Some(self.pool.lock().allocate()),
                }
            }
            h.weak_queue.clear();
            h.alive_size = 0;
            h.promoted_size = 0;
            h.evacuated.clear();
        }
    }

    /// Queues `obj` for `thread`. Returns `true` when a full node was moved
    /// to the global stack, i.e. when idle threads could help.
    pub fn push(&self, thread: u32, obj: usize) -> bool {
        let mut h = self.holder(thread);
        let node = match h.in_node.as_mut() {
            Some(node) => node,
            None => h.in_node.insert(self.pool.lock().allocate()),
        };
        node.objects.push(obj);
        if !node.is_full() {
            return false;
        }
        let fresh = self.pool.lock().allocate();
        if let Some(full) = h.in_node.replace(fresh) {
            self.global.lock().push(full);
        }
        true
    }

    /// Takes the next gray object for `thread`. `None` means the thread's
    /// nodes and the global stack are all empty.
    pub fn pop(&self, thread: u32) -> Option<usize> {
        let mut h = self.holder(thread);
        let h = &mut *h;
        if let Some(obj) = h.out_node.as_mut().and_then(|n| n.objects.pop()) {
            return Some(obj);
        }
        if h.in_node.as_ref().is_some_and(|n| !n.is_empty()) {
            std::mem::swap(&mut h.in_node, &mut h.out_node);
            return h.out_node.as_mut().and_then(|n| n.objects.pop());
        }
        let node = self.global.lock().pop()?;
        if let Some(empty) = h.out_node.replace(node) {
            self.pool.lock().release(empty);
        }
        h.out_node.as_mut().and_then(|n| n.objects.pop())
    }

    /// Moves `thread`'s pending objects to the global stack so other
    /// threads can take them.
    pub fn flush(&self, thread: u32) {
        let mut guard = self.holder(thread);
        let h = &mut *guard;
        let mut global = self.global.lock();
        let mut pool = self.pool.lock();
        for node in [&mut h.in_node, &mut h.out_node] {
            if node.as_ref().is_some_and(|n| !n.is_empty()) {
                if let Some(full) = node.replace(pool.allocate()) {
                    global.push(full);
                }
            }
        }
    }

    pub fn push_weak_reference(&self, thread: u32, slot: ObjectSlot) {
        self.holder(thread).weak_queue.push(slot);
    }

    /// Collects the weak slots recorded by every thread.
    pub fn take_weak_references(&self) -> Vec<ObjectSlot> {
        let mut all = Vec::new();
        for holder in self.holders.iter() {
            all.append(&mut holder.lock().weak_queue);
        }
        all
    }

    pub fn add_alive_size(&self, thread: u32, size: usize) {
        self.holder(thread).alive_size += size;
    }

    /// Bytes scanned so far by every thread, without resetting.
    pub fn alive_size(&self) -> usize {
        self.holders.iter().map(|h| h.lock().alive_size).sum()
    }

    /// Whether any gray object is still queued anywhere.
    pub fn has_pending_work(&self) -> bool {
        if !self.global.lock().is_empty() {
            return true;
        }
        self.holders.iter().any(|holder| {
            let h = holder.lock();
            h.in_node.as_ref().is_some_and(|n| !n.is_empty())
                || h.out_node.as_ref().is_some_and(|n| !n.is_empty())
        })
    }

    /// Sums the per-thread alive and promoted sizes of the finished phase.
    pub fn finish(&self) -> (usize, usize) {
        debug_assert!(!self.has_pending_work(), "finishing with gray objects left");
        let mut alive = 0;
        let mut promoted = 0;
        for holder in self.holders.iter() {
            let mut h = holder.lock();
            alive += h.alive_size;
            promoted += h.promoted_size;
            h.alive_size = 0;
            h.promoted_size = 0;
            h.evacuated.clear();
            h.weak_queue.clear();
        }
        (alive, promoted)
    }

    /// Nodes currently checked out of the pool: one in and one out node per
    /// initialized thread plus whatever sits on the global stack.
    pub fn pooled_nodes(&self) -> usize {
        let pool = self.pool.lock();
        pool.buffers.len() - pool.free.len()
    }
}

impl core::fmt::Debug for WorkManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkManager")
            .field("threads", &self.holders.len())
            .field("global_nodes", &self.global.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_is_lifo_per_thread() {
        let wm = WorkManager::new(1, 4);
        wm.initialize();
        for obj in [8, 16, 24] {
            assert!(!wm.push(0, obj));
        }
        assert_eq!(wm.pop(0), Some(24));
        assert_eq!(wm.pop(0), Some(16));
        assert_eq!(wm.pop(0), Some(8));
        assert_eq!(wm.pop(0), None);
    }

    #[test]
    fn full_node_spills_to_global_stack() {
        let wm = WorkManager::new(2, 2);
        wm.initialize();
        assert!(!wm.push(0, 8));
        assert!(wm.push(0, 16));
        // the other thread can now take the whole node
        let mut taken = vec![wm.pop(1).unwrap(), wm.pop(1).unwrap()];
        taken.sort();
        assert_eq!(taken, vec![8, 16]);
        assert_eq!(wm.pop(1), None);
        assert_eq!(wm.pop(0), None);
    }

    #[test]
    fn flush_hands_local_work_to_others() {
        let wm = WorkManager::new(2, 8);
        wm.initialize();
        wm.push(0, 8);
        wm.flush(0);
        assert!(wm.has_pending_work());
        assert_eq!(wm.pop(1), Some(8));
        assert!(!wm.has_pending_work());
    }

    #[test]
    fn nodes_are_recycled() {
        let wm = WorkManager::new(1, 1);
        wm.initialize();
        for round in 0..10 {
            wm.push(0, 8 * (round + 1));
            assert!(wm.pop(0).is_some());
        }
        // in + out + a handful in flight, not one node per spill
        assert!(wm.pooled_nodes() <= 3);
    }

    #[test]
    fn initialize_drops_abandoned_work() {
        let wm = WorkManager::new(2, 2);
        wm.initialize();
        wm.push(0, 8);
        wm.push(0, 16);
        wm.push(1, 24);
        wm.initialize();
        assert!(!wm.has_pending_work());
        assert_eq!(wm.pop(0), None);
        assert_eq!(wm.pooled_nodes(), 4);
    }

    #[test]
    fn finish_sums_thread_sizes() {
        let wm = WorkManager::new(3, 4);
        wm.initialize();
        wm.add_alive_size(0, 16);
        wm.add_alive_size(2, 32);
        wm.holder(1).promoted_size = 8;
        assert_eq!(wm.finish(), (48, 8));
    }

    #[test]
    fn parallel_drain_sees_every_object_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let wm = WorkManager::new(5, 16);
        wm.initialize();
        for i in 1..=1000 {
            wm.push(0, i * 8);
        }
        wm.flush(0);
        let sum = AtomicUsize::new(0);
        let count = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for t in 1..5u32 {
                let (wm, sum, count) = (&wm, &sum, &count);
                s.spawn(move || {
                    while let Some(obj) = wm.pop(t) {
                        sum.fetch_add(obj, Ordering::Relaxed);
                        count.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
        });
        assert_eq!(count.load(Ordering::Relaxed), 1000);
        assert_eq!(sum.load(Ordering::Relaxed), 8 * 1000 * 1001 / 2);
    }
}
