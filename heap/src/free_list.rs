//! Segregated free lists for the sparse (mark-sweep) spaces.

use object::{MIN_OBJECT_SIZE, WORD_SIZE};

/// Ranges up to this size get an exact-size bucket.
const SMALL_LIMIT: usize = 256;
const SMALL_BUCKETS: usize = SMALL_LIMIT / WORD_SIZE - 1;
const LARGE_BUCKETS: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeRange {
    start: usize,
    size: usize,
}

/// Free memory of one space, bucketed by size.
///
/// Every range handed to [`FreeObjectList::add`] is plugged with a `Free`
/// filler so the owning region stays walkable object by object.
#[derive(Debug)]
pub struct FreeObjectList {
    buckets: Vec<Vec<FreeRange>>,
    available: usize,
    wasted: usize,
}

#[inline(always)]
fn bucket_index(size: usize) -> usize {
    if size <= SMALL_LIMIT {
        size / WORD_SIZE - 2
    } else {
        let log = (usize::BITS - 1 - size.leading_zeros()) as usize;
        (SMALL_BUCKETS + log - 8).min(SMALL_BUCKETS + LARGE_BUCKETS - 1)
    }
}

impl Default for FreeObjectList {
    fn default() -> Self {
        Self::new()
    }
}

impl FreeObjectList {
    pub fn new() -> Self {
        Self {
            buckets: vec![Vec::new(); SMALL_BUCKETS + LARGE_BUCKETS],
            available: 0,
            wasted: 0,
        }
    }

    /// Bytes that can still be handed out.
    #[inline(always)]
    pub fn available(&self) -> usize {
        self.available
    }

    /// Bytes lost to fragments too small to allocate from.
    #[inline(always)]
    pub fn wasted(&self) -> usize {
        self.wasted
    }

    /// Gives `[start, start + size)` back to the list.
    ///
    /// # Safety
    ///
    /// The range must be unused, writable heap memory owned by this space.
    pub unsafe fn add(&mut self, start: usize, size: usize) {
        if size == 0 {
            return;
        }
        unsafe { object::init_free(start, size) };
        if size < MIN_OBJECT_SIZE {
            self.wasted += size;
            return;
        }
        self.buckets[bucket_index(size)].push(FreeRange { start, size });
        self.available += size;
    }

    /// Takes `size` bytes from the list. The remainder of the chosen range
    /// goes back to the list.
    pub fn allocate(&mut self, size: usize) -> Option<usize> {
        debug_assert!(size >= MIN_OBJECT_SIZE && size.is_multiple_of(WORD_SIZE));
        let first = bucket_index(size);
        for index in first..self.buckets.len() {
            let bucket = &mut self.buckets[index];
            let Some(pos) = bucket.iter().rposition(|r| r.size >= size) else {
                continue;
            };
            let range = bucket.swap_remove(pos);
            self.available -= range.size;
            let rest = range.size - size;
            if rest > 0 {
                // SAFETY: the tail of a free range is still unused.
                unsafe { self.add(range.start + size, rest) };
            }
            return Some(range.start);
        }
        None
    }

    /// Takes the largest range of at most `max` bytes and at least `min`
    /// bytes, for thread-local allocation buffers.
    pub fn allocate_chunk(&mut self, min: usize, max: usize) -> Option<(usize, usize)> {
        if let Some(start) = self.allocate(max) {
            return Some((start, max));
        }
        let index = bucket_index(min);
        let mut best: Option<(usize, usize)> = None;
        for (b, bucket) in self.buckets.iter().enumerate().skip(index) {
            for (i, r) in bucket.iter().enumerate() {
                if r.size >= min && best.is_none_or(|(bb, bi)| self.buckets[bb][bi].size < r.size) {
                    best = Some((b, i));
                }
            }
        }
        let (b, i) = best?;
        let range = self.buckets[b].swap_remove(i);
        self.available -= range.size;
        Some((range.start, range.size))
    }

    /// Drops every range inside `[begin, end)`. Used when a region leaves
    /// the space (collection set, release).
    pub fn detach_region(&mut self, begin: usize, end: usize) -> usize {
        let mut removed = 0;
        for bucket in &mut self.buckets {
            bucket.retain(|r| {
                let inside = r.start >= begin && r.start < end;
                if inside {
                    removed += r.size;
                }
                !inside
            });
        }
        self.available -= removed;
        removed
    }

    pub fn reset(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        self.available = 0;
        self.wasted = 0;
    }

    pub fn reset_wasted(&mut self) {
        self.wasted = 0;
    }
}
