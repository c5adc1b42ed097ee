#![allow(clippy::arithmetic_side_effects)]

// atomic bitset of devices with unhandled readiness.
//
// notifiers only ever set bits (fetch_or); the drain loop clears a bit
// (fetch_and) right before serving that device. a set that lands after the
// clear survives and is seen on a later cycle.

use std::sync::atomic::{AtomicU64, Ordering};

const WORD_BITS: usize = 64;

pub struct PendingSet {
    words: Box<[AtomicU64]>,
    capacity: usize,
}

impl PendingSet {
    pub fn new(capacity: usize) -> Self {
        let n_words = capacity.div_ceil(WORD_BITS).max(1);
        Self {
            words: (0..n_words).map(|_| AtomicU64::new(0)).collect(),
            capacity,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// mark `index` pending. returns whether it already was.
    #[inline]
    pub fn set(&self, index: usize) -> bool {
        debug_assert!(index < self.capacity);
        let mask = 1u64 << (index % WORD_BITS);
        self.words[index / WORD_BITS].fetch_or(mask, Ordering::Release) & mask != 0
    }

    /// clear `index`, returning whether it was set
    #[inline]
    pub fn clear(&self, index: usize) -> bool {
        debug_assert!(index < self.capacity);
        let mask = 1u64 << (index % WORD_BITS);
        self.words[index / WORD_BITS].fetch_and(!mask, Ordering::AcqRel) & mask != 0
    }

    #[inline]
    pub fn is_set(&self, index: usize) -> bool {
        let mask = 1u64 << (index % WORD_BITS);
        self.words[index / WORD_BITS].load(Ordering::Acquire) & mask != 0
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| w.load(Ordering::Acquire) == 0)
    }

    /// append every set index to `out`, lowest first. bits are left set.
    pub fn collect_set(&self, out: &mut Vec<usize>) {
        for (word_idx, word) in self.words.iter().enumerate() {
            let mut bits = word.load(Ordering::Acquire);
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                out.push(word_idx * WORD_BITS + bit);
                bits &= bits - 1;
            }
        }
    }
}
