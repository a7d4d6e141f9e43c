//! Producer-side sequencing: slot claim and publish.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::sequence::{min_sequence, Sequence, INITIAL_SEQUENCE};
use crate::wait::WaitStrategy;

/// Claim/publish protocol shared by single- and multi-producer variants.
///
/// Producers call `next` to reserve sequences, fill the corresponding slots,
/// then `publish`. Consumers only ever observe sequences confirmed by
/// `highest_published`, so a reserved-but-unwritten slot is never readable.
pub trait Sequencer: Send + Sync {
    /// Reserve `n` sequences, spinning while the ring lacks capacity.
    /// Returns the highest reserved sequence.
    fn next(&self, n: usize) -> i64;

    /// Reserve `n` sequences without waiting. `None` when the ring is full.
    fn try_next(&self, n: usize) -> Option<i64>;

    /// Make `lo..=hi` visible to consumers.
    fn publish(&self, lo: i64, hi: i64);

    /// Highest published sequence in `lower..=available` such that every
    /// sequence up to the returned value is readable.
    fn highest_published(&self, lower: i64, available: i64) -> i64;

    fn cursor(&self) -> Arc<Sequence>;

    fn add_gating_sequence(&self, sequence: Arc<Sequence>);

    fn remove_gating_sequence(&self, sequence: &Arc<Sequence>) -> bool;

    fn capacity(&self) -> usize;

    fn remaining_capacity(&self) -> i64;
}

fn gating_minimum(gating: &RwLock<Vec<Arc<Sequence>>>, fallback: i64) -> i64 {
    min_sequence(&gating.read(), fallback)
}

/// Sequencer for exactly one producer thread. `next`/`try_next`/`publish`
/// must only ever be called from that thread; consumers may share freely.
pub struct SingleProducerSequencer {
    cursor: Arc<Sequence>,
    next_value: AtomicI64,
    cached_gating: AtomicI64,
    gating: RwLock<Vec<Arc<Sequence>>>,
    wait_strategy: Arc<dyn WaitStrategy>,
    capacity: usize,
}

impl SingleProducerSequencer {
    pub fn new(capacity: usize, wait_strategy: Arc<dyn WaitStrategy>) -> Self {
        assert!(
            capacity.is_power_of_two() && capacity > 0,
            "ring capacity must be a power of two"
        );
        Self {
            cursor: Arc::new(Sequence::default()),
            next_value: AtomicI64::new(INITIAL_SEQUENCE),
            cached_gating: AtomicI64::new(INITIAL_SEQUENCE),
            gating: RwLock::new(Vec::new()),
            wait_strategy,
            capacity,
        }
    }

    fn has_capacity(&self, claimed: i64, n: usize) -> bool {
        let wrap_point = claimed + n as i64 - self.capacity as i64;
        if wrap_point <= self.cached_gating.load(Ordering::Acquire) {
            return true;
        }
        let min = gating_minimum(&self.gating, claimed);
        self.cached_gating.store(min, Ordering::Release);
        wrap_point <= min
    }
}

impl Sequencer for SingleProducerSequencer {
    fn next(&self, n: usize) -> i64 {
        debug_assert!(n > 0 && n <= self.capacity);
        let claimed = self.next_value.load(Ordering::Relaxed);
        while !self.has_capacity(claimed, n) {
            std::hint::spin_loop();
        }
        let next = claimed + n as i64;
        self.next_value.store(next, Ordering::Relaxed);
        next
    }

    fn try_next(&self, n: usize) -> Option<i64> {
        debug_assert!(n > 0 && n <= self.capacity);
        let claimed = self.next_value.load(Ordering::Relaxed);
        if !self.has_capacity(claimed, n) {
            return None;
        }
        let next = claimed + n as i64;
        self.next_value.store(next, Ordering::Relaxed);
        Some(next)
    }

    fn publish(&self, _lo: i64, hi: i64) {
        self.cursor.set(hi);
        self.wait_strategy.signal_all();
    }

    fn highest_published(&self, _lower: i64, available: i64) -> i64 {
        // Single producer publishes in order: the cursor is the truth.
        available
    }

    fn cursor(&self) -> Arc<Sequence> {
        Arc::clone(&self.cursor)
    }

    fn add_gating_sequence(&self, sequence: Arc<Sequence>) {
        self.gating.write().push(sequence);
    }

    fn remove_gating_sequence(&self, sequence: &Arc<Sequence>) -> bool {
        let mut gating = self.gating.write();
        let before = gating.len();
        gating.retain(|s| !Arc::ptr_eq(s, sequence));
        gating.len() != before
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn remaining_capacity(&self) -> i64 {
        let consumed = gating_minimum(&self.gating, self.cursor.get());
        let produced = self.next_value.load(Ordering::Relaxed);
        self.capacity as i64 - (produced - consumed)
    }
}

/// Sequencer safe for concurrent producers.
///
/// Claims advance a shared counter by CAS; publishes mark per-slot
/// availability with the wrap generation (`sequence >> log2(capacity)`), so
/// a consumer observing the cursor at `k` can tell a published slot from a
/// reservation that has not been written yet.
pub struct MultiProducerSequencer {
    cursor: Arc<Sequence>,
    claim: Sequence,
    cached_gating: AtomicI64,
    gating: RwLock<Vec<Arc<Sequence>>>,
    available: Box<[AtomicI64]>,
    index_mask: usize,
    index_shift: u32,
    wait_strategy: Arc<dyn WaitStrategy>,
    capacity: usize,
}

impl MultiProducerSequencer {
    pub fn new(capacity: usize, wait_strategy: Arc<dyn WaitStrategy>) -> Self {
        assert!(
            capacity.is_power_of_two() && capacity > 0,
            "ring capacity must be a power of two"
        );
        let available = (0..capacity)
            .map(|_| AtomicI64::new(-1))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            cursor: Arc::new(Sequence::default()),
            claim: Sequence::default(),
            cached_gating: AtomicI64::new(INITIAL_SEQUENCE),
            gating: RwLock::new(Vec::new()),
            available,
            index_mask: capacity - 1,
            index_shift: capacity.trailing_zeros(),
            wait_strategy,
            capacity,
        }
    }

    fn availability_flag(&self, sequence: i64) -> i64 {
        sequence >> self.index_shift
    }

    fn set_available(&self, sequence: i64) {
        let index = sequence as usize & self.index_mask;
        self.available[index].store(self.availability_flag(sequence), Ordering::Release);
    }

    fn is_available(&self, sequence: i64) -> bool {
        let index = sequence as usize & self.index_mask;
        self.available[index].load(Ordering::Acquire) == self.availability_flag(sequence)
    }

    fn claim_range(&self, n: usize, wait: bool) -> Option<i64> {
        loop {
            let current = self.claim.get();
            let next = current + n as i64;
            let wrap_point = next - self.capacity as i64;
            let cached = self.cached_gating.load(Ordering::Acquire);

            if wrap_point > cached || cached > current {
                let min = gating_minimum(&self.gating, current);
                self.cached_gating.store(min, Ordering::Release);
                if wrap_point > min {
                    if !wait {
                        return None;
                    }
                    std::hint::spin_loop();
                    continue;
                }
            }

            if self.claim.compare_and_set(current, next) {
                return Some(next);
            }
        }
    }
}

impl Sequencer for MultiProducerSequencer {
    fn next(&self, n: usize) -> i64 {
        debug_assert!(n > 0 && n <= self.capacity);
        // claim_range always succeeds when allowed to wait
        self.claim_range(n, true).unwrap_or(INITIAL_SEQUENCE)
    }

    fn try_next(&self, n: usize) -> Option<i64> {
        debug_assert!(n > 0 && n <= self.capacity);
        self.claim_range(n, false)
    }

    fn publish(&self, lo: i64, hi: i64) {
        let mut seq = lo;
        while seq <= hi {
            self.set_available(seq);
            seq += 1;
        }
        self.cursor.advance_to(hi);
        self.wait_strategy.signal_all();
    }

    fn highest_published(&self, lower: i64, available: i64) -> i64 {
        let mut seq = lower;
        while seq <= available {
            if !self.is_available(seq) {
                return seq - 1;
            }
            seq += 1;
        }
        available
    }

    fn cursor(&self) -> Arc<Sequence> {
        Arc::clone(&self.cursor)
    }

    fn add_gating_sequence(&self, sequence: Arc<Sequence>) {
        self.gating.write().push(sequence);
    }

    fn remove_gating_sequence(&self, sequence: &Arc<Sequence>) -> bool {
        let mut gating = self.gating.write();
        let before = gating.len();
        gating.retain(|s| !Arc::ptr_eq(s, sequence));
        gating.len() != before
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn remaining_capacity(&self) -> i64 {
        let consumed = gating_minimum(&self.gating, self.cursor.get());
        let produced = self.claim.get();
        self.capacity as i64 - (produced - consumed)
    }
}
