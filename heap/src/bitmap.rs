use std::sync::atomic::{AtomicU64, Ordering};

const BITS_PER_WORD: usize = 64;

/// Fixed-size bitset over atomic words.
///
/// Marking and remembered-set insertion race between threads, so every
/// mutation is an atomic read-modify-write on the containing word.
pub struct GcBitset {
    words: Box<[AtomicU64]>,
    bits: usize,
}

impl GcBitset {
    pub fn new(bits: usize) -> Self {
        let words = bits.div_ceil(BITS_PER_WORD);
        Self {
            words: (0..words).map(|_| AtomicU64::new(0)).collect(),
            bits,
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.bits
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    #[inline(always)]
    fn locate(&self, bit: usize) -> (&AtomicU64, u64) {
        debug_assert!(bit < self.bits, "bit {bit} out of range {}", self.bits);
        (&self.words[bit / BITS_PER_WORD], 1u64 << (bit % BITS_PER_WORD))
    }

    /// Sets `bit`. Returns `true` if this call flipped it from 0 to 1.
    #[inline(always)]
    pub fn atomic_test_and_set(&self, bit: usize) -> bool {
        let (word, mask) = self.locate(bit);
        if word.load(Ordering::Relaxed) & mask != 0 {
            return false;
        }
        word.fetch_or(mask, Ordering::AcqRel) & mask == 0
    }

    #[inline(always)]
    pub fn set(&self, bit: usize) {
        let (word, mask) = self.locate(bit);
        word.fetch_or(mask, Ordering::AcqRel);
    }

    #[inline(always)]
    pub fn test(&self, bit: usize) -> bool {
        let (word, mask) = self.locate(bit);
        word.load(Ordering::Acquire) & mask != 0
    }

    #[inline(always)]
    pub fn clear(&self, bit: usize) {
        let (word, mask) = self.locate(bit);
        word.fetch_and(!mask, Ordering::AcqRel);
    }

    pub fn clear_all(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }

    /// Clears bits `[from, to)`.
    pub fn clear_range(&self, from: usize, to: usize) {
        debug_assert!(from <= to && to <= self.bits);
        let mut bit = from;
        while bit < to {
            let index = bit / BITS_PER_WORD;
            let offset = bit % BITS_PER_WORD;
            let count = (BITS_PER_WORD - offset).min(to - bit);
            let mask = if count == BITS_PER_WORD {
                u64::MAX
            } else {
                ((1u64 << count) - 1) << offset
            };
            self.words[index].fetch_and(!mask, Ordering::AcqRel);
            bit += count;
        }
    }

    pub fn is_clear(&self) -> bool {
        self.words.iter().all(|w| w.load(Ordering::Acquire) == 0)
    }

    pub fn count(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Acquire).count_ones() as usize)
            .sum()
    }

    /// Visits set bits in ascending order.
    ///
    /// Each word is snapshotted once, so bits set concurrently in a word
    /// that was already visited are not reported.
    pub fn iterate(&self, mut visitor: impl FnMut(usize)) {
        for (index, word) in self.words.iter().enumerate() {
            let mut bits = word.load(Ordering::Acquire);
            while bits != 0 {
                let offset = bits.trailing_zeros() as usize;
                visitor(index * BITS_PER_WORD + offset);
                bits &= bits - 1;
            }
        }
    }

    /// Visits set bits and clears the ones for which `visitor` returns `false`.
    pub fn iterate_and_retain(&self, mut visitor: impl FnMut(usize) -> bool) {
        for (index, word) in self.words.iter().enumerate() {
            let mut bits = word.load(Ordering::Acquire);
            let mut dropped = 0u64;
            while bits != 0 {
                let offset = bits.trailing_zeros() as usize;
                if !visitor(index * BITS_PER_WORD + offset) {
                    dropped |= 1u64 << offset;
                }
                bits &= bits - 1;
            }
            if dropped != 0 {
                word.fetch_and(!dropped, Ordering::AcqRel);
            }
        }
    }
}

impl core::fmt::Debug for GcBitset {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GcBitset")
            .field("bits", &self.bits)
            .field("set", &self.count())
            .finish()
    }
}
