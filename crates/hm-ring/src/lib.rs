//! Lock-free bounded ring buffer for high-throughput fan-out.
//!
//! A fixed-size, power-of-two slot array with a two-phase publish protocol:
//! producers reserve sequences, fill slots, then publish; consumers observe
//! only published sequences and gate producers from wrapping over unread
//! slots. Wait strategies trade latency against CPU, and a sequence barrier
//! with an alert signal gives consumers a clean exit path.
//!
//! ```
//! use std::sync::Arc;
//! use hm_ring::{EventHandler, HandlerError, Ring, SleepingWaitStrategy};
//!
//! struct Sum(Arc<std::sync::atomic::AtomicI64>);
//!
//! impl EventHandler<i64> for Sum {
//!     fn on_event(&mut self, event: &i64, _seq: i64, _eob: bool) -> Result<(), HandlerError> {
//!         self.0.fetch_add(*event, std::sync::atomic::Ordering::SeqCst);
//!         Ok(())
//!     }
//! }
//!
//! let ring = Ring::single_producer(8, || 0i64, Arc::new(SleepingWaitStrategy::new()));
//! let total = Arc::new(std::sync::atomic::AtomicI64::new(0));
//! let consumer = ring.batch_consumer(Sum(Arc::clone(&total)));
//! consumer.start();
//! for i in 1..=3 {
//!     ring.publish(|slot| *slot = i);
//! }
//! while total.load(std::sync::atomic::Ordering::SeqCst) < 6 {
//!     std::thread::yield_now();
//! }
//! consumer.shutdown(std::time::Duration::from_secs(1));
//! ```

mod barrier;
mod buffer;
mod consumer;
mod sequence;
mod sequencer;
mod wait;

use std::sync::Arc;

pub use barrier::SequenceBarrier;
pub use buffer::SlotArray;
pub use consumer::{BatchConsumer, EventHandler, HandlerError};
pub use sequence::{min_sequence, Sequence, INITIAL_SEQUENCE};
pub use sequencer::{MultiProducerSequencer, Sequencer, SingleProducerSequencer};
pub use wait::{
    AlertSignal, BlockingWaitStrategy, BusySpinWaitStrategy, SleepingWaitStrategy,
    TimeoutBlockingWaitStrategy, WaitError, WaitStrategy, YieldingWaitStrategy,
};

/// The ring is full and the producer chose not to wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("ring buffer full")]
pub struct RingFull;

/// A pre-allocated ring with its sequencer and wait strategy.
pub struct Ring<T: Send + 'static> {
    buffer: Arc<SlotArray<T>>,
    sequencer: Arc<dyn Sequencer>,
    wait_strategy: Arc<dyn WaitStrategy>,
}

impl<T: Send + 'static> Ring<T> {
    /// Ring with a single producer thread. The caller is responsible for
    /// upholding the single-producer contract on the publish side.
    pub fn single_producer(
        capacity: usize,
        factory: impl FnMut() -> T,
        wait_strategy: Arc<dyn WaitStrategy>,
    ) -> Self {
        let sequencer = Arc::new(SingleProducerSequencer::new(
            capacity,
            Arc::clone(&wait_strategy),
        ));
        Self {
            buffer: Arc::new(SlotArray::new(capacity, factory)),
            sequencer,
            wait_strategy,
        }
    }

    /// Ring safe for concurrent producers.
    pub fn multi_producer(
        capacity: usize,
        factory: impl FnMut() -> T,
        wait_strategy: Arc<dyn WaitStrategy>,
    ) -> Self {
        let sequencer = Arc::new(MultiProducerSequencer::new(
            capacity,
            Arc::clone(&wait_strategy),
        ));
        Self {
            buffer: Arc::new(SlotArray::new(capacity, factory)),
            sequencer,
            wait_strategy,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    pub fn cursor(&self) -> i64 {
        self.sequencer.cursor().get()
    }

    pub fn remaining_capacity(&self) -> i64 {
        self.sequencer.remaining_capacity()
    }

    /// Reserve a slot, fill it, publish it. Spins while the ring is full.
    /// Returns the published sequence.
    pub fn publish(&self, fill: impl FnOnce(&mut T)) -> i64 {
        let sequence = self.sequencer.next(1);
        // Safety: `sequence` was claimed above and is exclusively ours until
        // published.
        unsafe { fill(self.buffer.slot_mut(sequence)) };
        self.sequencer.publish(sequence, sequence);
        sequence
    }

    /// Like [`Ring::publish`] but fails instead of waiting when full.
    pub fn try_publish(&self, fill: impl FnOnce(&mut T)) -> Result<i64, RingFull> {
        let sequence = self.sequencer.try_next(1).ok_or(RingFull)?;
        // Safety: as in `publish`.
        unsafe { fill(self.buffer.slot_mut(sequence)) };
        self.sequencer.publish(sequence, sequence);
        Ok(sequence)
    }

    /// Barrier over the publish cursor, optionally behind other consumers.
    pub fn barrier(&self, dependents: Vec<Arc<Sequence>>) -> SequenceBarrier {
        SequenceBarrier::new(
            Arc::clone(&self.sequencer),
            Arc::clone(&self.wait_strategy),
            dependents,
        )
    }

    /// Build a batch consumer gating the producers; call `start()` on it.
    pub fn batch_consumer(&self, handler: impl EventHandler<T> + 'static) -> BatchConsumer<T> {
        self.batch_consumer_after(handler, Vec::new())
    }

    /// Batch consumer that additionally stays behind `dependents`
    /// (consumer-chain topology).
    pub fn batch_consumer_after(
        &self,
        handler: impl EventHandler<T> + 'static,
        dependents: Vec<Arc<Sequence>>,
    ) -> BatchConsumer<T> {
        let sequence = Arc::new(Sequence::default());
        self.sequencer.add_gating_sequence(Arc::clone(&sequence));
        let barrier = self.barrier(dependents);
        BatchConsumer::new(Arc::clone(&self.buffer), barrier, sequence, handler)
    }

    /// Remove a consumer's gating sequence (after shutdown).
    pub fn remove_gating_sequence(&self, sequence: &Arc<Sequence>) -> bool {
        self.sequencer.remove_gating_sequence(sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
    use std::time::Duration;

    struct Recorder {
        seen: Arc<parking_lot::Mutex<Vec<(i64, i64, bool)>>>,
        fail_on: Option<i64>,
        errors: Arc<AtomicUsize>,
    }

    impl EventHandler<i64> for Recorder {
        fn on_event(
            &mut self,
            event: &i64,
            sequence: i64,
            end_of_batch: bool,
        ) -> Result<(), HandlerError> {
            if self.fail_on == Some(sequence) {
                return Err("boom".into());
            }
            self.seen.lock().push((*event, sequence, end_of_batch));
            Ok(())
        }

        fn on_error(&mut self, _sequence: i64, _error: HandlerError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn single_producer_fifo_with_batch_boundary() {
        let ring = Ring::single_producer(8, || 0i64, Arc::new(SleepingWaitStrategy::new()));
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let consumer = ring.batch_consumer(Recorder {
            seen: Arc::clone(&seen),
            fail_on: None,
            errors: Arc::new(AtomicUsize::new(0)),
        });
        assert!(consumer.start());

        for i in 0..7i64 {
            ring.publish(|slot| *slot = i * 10);
        }

        assert!(wait_until(Duration::from_secs(2), || seen.lock().len() == 7));
        consumer.shutdown(Duration::from_secs(1));

        let seen = seen.lock();
        // FIFO: sequences 0..=6 in order, values intact.
        for (index, (value, sequence, _)) in seen.iter().enumerate() {
            assert_eq!(*sequence, index as i64);
            assert_eq!(*value, index as i64 * 10);
        }
        // Exactly one end-of-batch per wake-up, and the final event observed
        // closes the last batch at the then-latest available sequence.
        assert!(seen.last().unwrap().2, "final event must end its batch");
        let batches = seen.iter().filter(|(_, _, eob)| *eob).count();
        assert!(batches >= 1 && batches <= 7);
    }

    #[test]
    fn producer_cannot_overrun_gating_consumer() {
        let ring = Ring::single_producer(4, || 0u32, Arc::new(BusySpinWaitStrategy));
        let gating = Arc::new(Sequence::default());
        // Simulated stalled consumer at -1.
        ring.sequencer.add_gating_sequence(Arc::clone(&gating));

        for _ in 0..4 {
            ring.try_publish(|slot| *slot = 1).unwrap();
        }
        assert_eq!(ring.try_publish(|slot| *slot = 1), Err(RingFull));
        assert!(ring.cursor() <= gating.get() + ring.capacity() as i64);

        gating.set(1);
        assert!(ring.try_publish(|slot| *slot = 1).is_ok());
    }

    #[test]
    fn multi_producer_delivers_every_publish() {
        let ring = Arc::new(Ring::multi_producer(
            64,
            || 0i64,
            Arc::new(SleepingWaitStrategy::new()),
        ));
        let total = Arc::new(AtomicI64::new(0));
        let count = Arc::new(AtomicUsize::new(0));

        struct Summing {
            total: Arc<AtomicI64>,
            count: Arc<AtomicUsize>,
        }
        impl EventHandler<i64> for Summing {
            fn on_event(&mut self, event: &i64, _s: i64, _e: bool) -> Result<(), HandlerError> {
                self.total.fetch_add(*event, Ordering::SeqCst);
                self.count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let consumer = ring.batch_consumer(Summing {
            total: Arc::clone(&total),
            count: Arc::clone(&count),
        });
        consumer.start();

        let producers: Vec<_> = (0..4)
            .map(|p| {
                let ring = Arc::clone(&ring);
                std::thread::spawn(move || {
                    for i in 0..100i64 {
                        ring.publish(|slot| *slot = p * 1000 + i);
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }

        assert!(wait_until(Duration::from_secs(5), || {
            count.load(Ordering::SeqCst) == 400
        }));
        consumer.shutdown(Duration::from_secs(1));

        let expected: i64 = (0..4).map(|p| (0..100).map(|i| p * 1000 + i).sum::<i64>()).sum();
        assert_eq!(total.load(Ordering::SeqCst), expected);
    }

    #[test]
    fn faulted_sequence_is_skipped_not_retried() {
        let ring = Ring::single_producer(8, || 0i64, Arc::new(SleepingWaitStrategy::new()));
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let errors = Arc::new(AtomicUsize::new(0));
        let consumer = ring.batch_consumer(Recorder {
            seen: Arc::clone(&seen),
            fail_on: Some(1),
            errors: Arc::clone(&errors),
        });
        consumer.start();

        for i in 0..4i64 {
            ring.publish(|slot| *slot = i);
        }

        assert!(wait_until(Duration::from_secs(2), || seen.lock().len() == 3));
        consumer.shutdown(Duration::from_secs(1));

        assert_eq!(errors.load(Ordering::SeqCst), 1);
        let sequences: Vec<i64> = seen.lock().iter().map(|(_, s, _)| *s).collect();
        assert_eq!(sequences, vec![0, 2, 3]);
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let ring = Ring::single_producer(8, || 0i64, Arc::new(SleepingWaitStrategy::new()));
        let consumer = ring.batch_consumer(Recorder {
            seen: Arc::new(parking_lot::Mutex::new(Vec::new())),
            fail_on: None,
            errors: Arc::new(AtomicUsize::new(0)),
        });

        assert!(consumer.start());
        assert!(!consumer.start());
        assert!(consumer.is_running());

        consumer.halt();
        consumer.halt();
        assert!(consumer.shutdown(Duration::from_secs(1)));
        assert!(consumer.shutdown(Duration::from_secs(1)));
    }
}
