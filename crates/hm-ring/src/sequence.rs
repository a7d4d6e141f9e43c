//! Sequence counters.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Sequences start one below the first valid slot.
pub const INITIAL_SEQUENCE: i64 = -1;

/// A 64-bit monotonic sequence counter, padded to its own cache line so
/// producer and consumer counters never false-share.
#[repr(align(128))]
#[derive(Debug)]
pub struct Sequence {
    value: AtomicI64,
}

impl Sequence {
    pub fn new(initial: i64) -> Self {
        Self {
            value: AtomicI64::new(initial),
        }
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Release);
    }

    pub fn compare_and_set(&self, expected: i64, new: i64) -> bool {
        self.value
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Advance to `value` unless another thread already moved past it.
    pub fn advance_to(&self, value: i64) {
        let mut current = self.get();
        while current < value {
            match self.value.compare_exchange_weak(
                current,
                value,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }
}

impl Default for Sequence {
    fn default() -> Self {
        Self::new(INITIAL_SEQUENCE)
    }
}

/// Minimum over a set of gating sequences, or `fallback` when empty.
pub fn min_sequence(sequences: &[Arc<Sequence>], fallback: i64) -> i64 {
    sequences
        .iter()
        .map(|s| s.get())
        .min()
        .unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_to_never_goes_backwards() {
        let seq = Sequence::new(5);
        seq.advance_to(3);
        assert_eq!(seq.get(), 5);
        seq.advance_to(9);
        assert_eq!(seq.get(), 9);
    }

    #[test]
    fn min_sequence_falls_back_when_empty() {
        assert_eq!(min_sequence(&[], 42), 42);
        let seqs = vec![Arc::new(Sequence::new(7)), Arc::new(Sequence::new(3))];
        assert_eq!(min_sequence(&seqs, 42), 3);
    }
}
