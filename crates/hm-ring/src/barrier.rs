//! Sequence barrier: where consumers wait.

use std::sync::Arc;

use crate::sequence::Sequence;
use crate::sequencer::Sequencer;
use crate::wait::{AlertSignal, WaitError, WaitStrategy};

/// Coordinates a consumer against the publish cursor and any dependent
/// consumers it must stay behind.
pub struct SequenceBarrier {
    sequencer: Arc<dyn Sequencer>,
    wait_strategy: Arc<dyn WaitStrategy>,
    cursor: Arc<Sequence>,
    dependents: Vec<Arc<Sequence>>,
    alert: Arc<AlertSignal>,
}

impl SequenceBarrier {
    pub fn new(
        sequencer: Arc<dyn Sequencer>,
        wait_strategy: Arc<dyn WaitStrategy>,
        dependents: Vec<Arc<Sequence>>,
    ) -> Self {
        let cursor = sequencer.cursor();
        Self {
            sequencer,
            wait_strategy,
            cursor,
            dependents,
            alert: Arc::new(AlertSignal::default()),
        }
    }

    /// Wait until `sequence` is available. Returns the highest published
    /// sequence that may be consumed (≥ `sequence`).
    pub fn wait_for(&self, sequence: i64) -> Result<i64, WaitError> {
        self.alert.check()?;
        let available =
            self.wait_strategy
                .wait_for(sequence, &self.cursor, &self.dependents, &self.alert)?;
        if available < sequence {
            return Ok(available);
        }
        Ok(self.sequencer.highest_published(sequence, available))
    }

    /// Force any waiting consumer out of its wait with [`WaitError::Alerted`].
    pub fn alert(&self) {
        self.alert.raise();
        self.wait_strategy.signal_all();
    }

    /// Resume normal operation after an alert.
    pub fn clear_alert(&self) {
        self.alert.clear();
    }

    pub fn is_alerted(&self) -> bool {
        self.alert.is_raised()
    }

    pub fn cursor(&self) -> i64 {
        self.cursor.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequencer::SingleProducerSequencer;
    use crate::wait::BusySpinWaitStrategy;

    fn barrier() -> (Arc<SingleProducerSequencer>, SequenceBarrier) {
        let wait: Arc<dyn WaitStrategy> = Arc::new(BusySpinWaitStrategy);
        let sequencer = Arc::new(SingleProducerSequencer::new(8, Arc::clone(&wait)));
        let barrier = SequenceBarrier::new(
            sequencer.clone() as Arc<dyn Sequencer>,
            wait,
            Vec::new(),
        );
        (sequencer, barrier)
    }

    #[test]
    fn wait_for_returns_published_sequences() {
        let (sequencer, barrier) = barrier();
        let hi = sequencer.next(3);
        sequencer.publish(hi - 2, hi);
        assert_eq!(barrier.wait_for(0).unwrap(), 2);
    }

    #[test]
    fn alert_and_clear_round_trip() {
        let (sequencer, barrier) = barrier();
        barrier.alert();
        assert!(barrier.is_alerted());
        assert_eq!(barrier.wait_for(0).unwrap_err(), WaitError::Alerted);

        barrier.clear_alert();
        let seq = sequencer.next(1);
        sequencer.publish(seq, seq);
        assert_eq!(barrier.wait_for(0).unwrap(), 0);
    }
}
