use std::sync::atomic::{AtomicU64, Ordering};

const FORWARD_TAG: u64 = 0b01;
const HASH_TAG: u64 = 0b10;
const TAG_MASK: u64 = 0b11;

/// The second word of every object (except one-word free fillers).
///
/// Evacuation installs `Forwarded` with a compare-and-swap; exactly one
/// thread wins and every loser must follow the winner's address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkWord {
    Uninitialized,
    Forwarded(usize),
    Hashed(u32),
}

impl MarkWord {
    #[inline(always)]
    pub const fn encode(self) -> u64 {
        match self {
            MarkWord::Uninitialized => 0,
            MarkWord::Forwarded(addr) => addr as u64 | FORWARD_TAG,
            MarkWord::Hashed(hash) => ((hash as u64) << 2) | HASH_TAG,
        }
    }

    #[inline(always)]
    pub const fn decode(raw: u64) -> Self {
        match raw & TAG_MASK {
            FORWARD_TAG => MarkWord::Forwarded((raw & !TAG_MASK) as usize),
            HASH_TAG => MarkWord::Hashed((raw >> 2) as u32),
            _ => MarkWord::Uninitialized,
        }
    }

    #[inline(always)]
    pub const fn forwarding_address(self) -> Option<usize> {
        match self {
            MarkWord::Forwarded(addr) => Some(addr),
            _ => None,
        }
    }

    /// # Safety
    ///
    /// `obj` must be the address of an initialized object of at least two words.
    #[inline(always)]
    unsafe fn cell<'a>(obj: usize) -> &'a AtomicU64 {
        unsafe { &*((obj + crate::MARK_WORD_OFFSET) as *const AtomicU64) }
    }

    /// # Safety
    ///
    /// `obj` must be the address of an initialized object of at least two words.
    #[inline(always)]
    pub unsafe fn load(obj: usize) -> Self {
        let raw = unsafe { Self::cell(obj) }.load(Ordering::Acquire);
        Self::decode(raw)
    }

    /// # Safety
    ///
    /// `obj` must be the address of an initialized object of at least two words.
    #[inline(always)]
    pub unsafe fn store(obj: usize, word: MarkWord) {
        unsafe { Self::cell(obj) }.store(word.encode(), Ordering::Release);
    }

    /// Returns `Ok(())` when `current` was replaced, `Err(actual)` otherwise.
    ///
    /// # Safety
    ///
    /// `obj` must be the address of an initialized object of at least two words.
    #[inline(always)]
    pub unsafe fn compare_exchange(obj: usize, current: MarkWord, new: MarkWord) -> Result<(), MarkWord> {
        unsafe { Self::cell(obj) }
            .compare_exchange(current.encode(), new.encode(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(Self::decode)
    }

    /// Returns the identity hash of `obj`, installing `candidate` if none is set yet.
    ///
    /// # Safety
    ///
    /// `obj` must be a live, non-forwarded object.
    pub unsafe fn hash_or_install(obj: usize, candidate: u32) -> u32 {
        match unsafe { Self::compare_exchange(obj, MarkWord::Uninitialized, MarkWord::Hashed(candidate)) } {
            Ok(()) => candidate,
            Err(MarkWord::Hashed(hash)) => hash,
            Err(other) => unreachable!("hash requested on {other:?}"),
        }
    }
}
