//! Root enumeration and VM-level handle storage.

use std::sync::atomic::AtomicU64;

use parking_lot::Mutex;

use object::{ObjectSlot, Value};

/// Where a root slot lives, reported alongside every slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Root {
    Frame,
    Global,
    Handle,
    Other,
}

/// Consumers implement this to expose their roots to the collector.
///
/// Slots may be rewritten in place while objects move, so every reported
/// slot must stay valid until the visit returns.
pub trait RootProvider: Send + Sync {
    fn visit_roots(
        &self,
        visitor: &mut dyn FnMut(Root, ObjectSlot),
        range_visitor: &mut dyn FnMut(Root, ObjectSlot, ObjectSlot),
    );

    /// Called once per collection with the weak-root callback: it returns
    /// the (possibly moved) address of a surviving object, or `None` if the
    /// referent died. Entries for dead objects must be dropped or cleared.
    fn sweep_weak_roots(&self, _resolve: &dyn Fn(usize) -> Option<usize>) {}
}

const CHUNK_CELLS: usize = 64;

struct HandleChunk {
    cells: [AtomicU64; CHUNK_CELLS],
}

impl HandleChunk {
    fn new() -> Box<Self> {
        Box::new(Self {
            cells: std::array::from_fn(|_| AtomicU64::new(Value::UNDEFINED.raw())),
        })
    }

    fn slot(&self, index: usize) -> ObjectSlot {
        ObjectSlot(&self.cells[index] as *const AtomicU64 as usize)
    }
}

#[derive(Default)]
struct HandleStorage {
    chunks: Vec<Box<HandleChunk>>,
    free: Vec<ObjectSlot>,
    live: usize,
}

impl HandleStorage {
    fn acquire(&mut self, value: Value) -> ObjectSlot {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                let chunk = HandleChunk::new();
                // hand out low cells first
                self.free.extend((1..CHUNK_CELLS).rev().map(|i| chunk.slot(i)));
                let slot = chunk.slot(0);
                self.chunks.push(chunk);
                slot
            }
        };
        slot.store(value);
        self.live += 1;
        slot
    }

    fn release(&mut self, slot: ObjectSlot) {
        debug_assert!(self.owns(slot), "handle from another storage");
        slot.store(Value::UNDEFINED);
        self.free.push(slot);
        self.live -= 1;
    }

    fn owns(&self, slot: ObjectSlot) -> bool {
        self.chunks.iter().any(|c| {
            let start = c.slot(0).address();
            (start..start + CHUNK_CELLS * 8).contains(&slot.address())
        })
    }
}

/// A handle into [`GlobalHandles`]. Copyable; stays valid until disposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalHandle {
    slot: ObjectSlot,
    weak: bool,
}

impl GlobalHandle {
    #[inline(always)]
    pub fn get(self) -> Value {
        self.slot.load()
    }

    #[inline(always)]
    pub fn set(self, value: Value) {
        self.slot.store(value);
    }

    #[inline(always)]
    pub fn is_weak(self) -> bool {
        self.weak
    }
}

/// VM-wide strong and weak handles. Strong handles are roots; weak handles
/// are cleared or relocated through the weak-root callback.
#[derive(Default)]
pub struct GlobalHandles {
    strong: Mutex<HandleStorage>,
    weak: Mutex<HandleStorage>,
}

impl GlobalHandles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_global_handle(&self, value: Value) -> GlobalHandle {
        GlobalHandle {
            slot: self.strong.lock().acquire(value),
            weak: false,
        }
    }

    pub fn new_weak_handle(&self, value: Value) -> GlobalHandle {
        GlobalHandle {
            slot: self.weak.lock().acquire(value),
            weak: true,
        }
    }

    pub fn dispose(&self, handle: GlobalHandle) {
        if handle.weak {
            self.weak.lock().release(handle.slot);
        } else {
            self.strong.lock().release(handle.slot);
        }
    }

    pub fn strong_count(&self) -> usize {
        self.strong.lock().live
    }

    pub fn weak_count(&self) -> usize {
        self.weak.lock().live
    }
}

impl RootProvider for GlobalHandles {
    fn visit_roots(
        &self,
        _visitor: &mut dyn FnMut(Root, ObjectSlot),
        range_visitor: &mut dyn FnMut(Root, ObjectSlot, ObjectSlot),
    ) {
        let strong = self.strong.lock();
        for chunk in &strong.chunks {
            let start = chunk.slot(0);
            range_visitor(Root::Handle, start, ObjectSlot(start.address() + CHUNK_CELLS * 8));
        }
    }

    fn sweep_weak_roots(&self, resolve: &dyn Fn(usize) -> Option<usize>) {
        let weak = self.weak.lock();
        for chunk in &weak.chunks {
            for i in 0..CHUNK_CELLS {
                let slot = chunk.slot(i);
                let value = slot.load();
                if !value.is_object() {
                    continue;
                }
                match resolve(value.addr()) {
                    Some(addr) if addr != value.addr() => slot.store(Value::from_addr(addr)),
                    Some(_) => {}
                    None => slot.store(Value::UNDEFINED),
                }
            }
        }
    }
}

impl core::fmt::Debug for GlobalHandles {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GlobalHandles")
            .field("strong", &self.strong_count())
            .field("weak", &self.weak_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strong_handles_are_reported_as_ranges() {
        let handles = GlobalHandles::new();
        let a = handles.new_global_handle(Value::from_i64(1));
        let _b = handles.new_global_handle(Value::from_i64(2));
        let mut seen = Vec::new();
        handles.visit_roots(&mut |_, _| unreachable!(), &mut |root, start, end| {
            assert_eq!(root, Root::Handle);
            let mut cur = start.address();
            while cur < end.address() {
                let v = ObjectSlot(cur).load();
                if !v.is_undefined() {
                    seen.push(v);
                }
                cur += 8;
            }
        });
        assert_eq!(seen, vec![Value::from_i64(1), Value::from_i64(2)]);
        handles.dispose(a);
        assert_eq!(handles.strong_count(), 1);
    }

    #[test]
    fn disposed_cells_are_reused() {
        let handles = GlobalHandles::new();
        let a = handles.new_weak_handle(Value::from_i64(7));
        handles.dispose(a);
        let b = handles.new_weak_handle(Value::from_i64(8));
        assert_eq!(a.slot, b.slot);
        assert_eq!(b.get(), Value::from_i64(8));
    }

    #[test]
    fn weak_sweep_clears_and_relocates() {
        let handles = GlobalHandles::new();
        let dead = handles.new_weak_handle(Value::from_addr(0x1000));
        let moved = handles.new_weak_handle(Value::from_addr(0x2000));
        let kept = handles.new_weak_handle(Value::from_addr(0x3000));
        handles.sweep_weak_roots(&|addr| match addr {
            0x1000 => None,
            0x2000 => Some(0x5000),
            other => Some(other),
        });
        assert!(dead.get().is_undefined());
        assert_eq!(moved.get(), Value::from_addr(0x5000));
        assert_eq!(kept.get(), Value::from_addr(0x3000));
    }
}
