//! Pluggable wait strategies.
//!
//! Each strategy blocks a consumer until the requested sequence is visible
//! on the cursor (further constrained by dependent sequences), trading
//! latency against CPU. Only the blocking strategies need `signal_all`; the
//! spinning ones observe the cursor directly.

use std::hint;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::sequence::{min_sequence, Sequence};

/// Raised out of a waiting consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    /// The barrier was alerted; the consumer should re-check its run state.
    #[error("barrier alerted")]
    Alerted,
    /// A timeout-bounded strategy gave up waiting.
    #[error("wait timed out")]
    Timeout,
}

/// Set by a barrier to force waiting consumers out of their wait loop.
#[derive(Debug, Default)]
pub struct AlertSignal {
    flag: AtomicBool,
}

impl AlertSignal {
    pub fn raise(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.flag.store(false, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub fn check(&self) -> Result<(), WaitError> {
        if self.is_raised() {
            Err(WaitError::Alerted)
        } else {
            Ok(())
        }
    }
}

/// What a waiting consumer may currently read: the minimum of the dependent
/// sequences, or the cursor itself for the first consumer in a chain.
fn available_sequence(cursor: &Sequence, dependents: &[Arc<Sequence>]) -> i64 {
    if dependents.is_empty() {
        cursor.get()
    } else {
        min_sequence(dependents, i64::MAX).min(cursor.get())
    }
}

pub trait WaitStrategy: Send + Sync {
    /// Wait until `sequence` is available, returning the highest available
    /// sequence (≥ `sequence` unless an error is raised).
    fn wait_for(
        &self,
        sequence: i64,
        cursor: &Sequence,
        dependents: &[Arc<Sequence>],
        alert: &AlertSignal,
    ) -> Result<i64, WaitError>;

    /// Wake all blocked waiters. No-op for spinning strategies.
    fn signal_all(&self) {}
}

/// Burns a core for the lowest possible latency.
#[derive(Debug, Default)]
pub struct BusySpinWaitStrategy;

impl WaitStrategy for BusySpinWaitStrategy {
    fn wait_for(
        &self,
        sequence: i64,
        cursor: &Sequence,
        dependents: &[Arc<Sequence>],
        alert: &AlertSignal,
    ) -> Result<i64, WaitError> {
        loop {
            alert.check()?;
            let available = available_sequence(cursor, dependents);
            if available >= sequence {
                return Ok(available);
            }
            hint::spin_loop();
        }
    }
}

/// Spins briefly, then yields the time slice.
#[derive(Debug)]
pub struct YieldingWaitStrategy {
    spin_tries: u32,
}

impl YieldingWaitStrategy {
    pub fn new() -> Self {
        Self { spin_tries: 100 }
    }
}

impl Default for YieldingWaitStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitStrategy for YieldingWaitStrategy {
    fn wait_for(
        &self,
        sequence: i64,
        cursor: &Sequence,
        dependents: &[Arc<Sequence>],
        alert: &AlertSignal,
    ) -> Result<i64, WaitError> {
        let mut counter = self.spin_tries;
        loop {
            alert.check()?;
            let available = available_sequence(cursor, dependents);
            if available >= sequence {
                return Ok(available);
            }
            if counter > 0 {
                counter -= 1;
                hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }
}

/// Progressive back-off: tight spins, then yields, then time-sliced sleeps.
#[derive(Debug)]
pub struct SleepingWaitStrategy {
    retries: u32,
    sleep: Duration,
}

impl SleepingWaitStrategy {
    pub fn new() -> Self {
        Self {
            retries: 200,
            sleep: Duration::from_micros(100),
        }
    }

    pub fn with_sleep(sleep: Duration) -> Self {
        Self {
            retries: 200,
            sleep,
        }
    }
}

impl Default for SleepingWaitStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitStrategy for SleepingWaitStrategy {
    fn wait_for(
        &self,
        sequence: i64,
        cursor: &Sequence,
        dependents: &[Arc<Sequence>],
        alert: &AlertSignal,
    ) -> Result<i64, WaitError> {
        let mut counter = self.retries;
        loop {
            alert.check()?;
            let available = available_sequence(cursor, dependents);
            if available >= sequence {
                return Ok(available);
            }
            if counter > 100 {
                counter -= 1;
                hint::spin_loop();
            } else if counter > 0 {
                counter -= 1;
                std::thread::yield_now();
            } else {
                std::thread::sleep(self.sleep);
            }
        }
    }
}

/// Parks waiters on a condvar until a producer signals a publish. Lowest CPU,
/// highest latency. Waits are bounded at `poll_interval` so advances on
/// dependent sequences (which do not signal) are still observed.
#[derive(Debug)]
pub struct BlockingWaitStrategy {
    lock: Mutex<()>,
    condvar: Condvar,
    poll_interval: Duration,
}

impl BlockingWaitStrategy {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            condvar: Condvar::new(),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl Default for BlockingWaitStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitStrategy for BlockingWaitStrategy {
    fn wait_for(
        &self,
        sequence: i64,
        cursor: &Sequence,
        dependents: &[Arc<Sequence>],
        alert: &AlertSignal,
    ) -> Result<i64, WaitError> {
        if cursor.get() < sequence {
            let mut guard = self.lock.lock();
            while cursor.get() < sequence {
                alert.check()?;
                self.condvar.wait_for(&mut guard, self.poll_interval);
            }
        }

        loop {
            alert.check()?;
            let available = available_sequence(cursor, dependents);
            if available >= sequence {
                return Ok(available);
            }
            std::thread::yield_now();
        }
    }

    fn signal_all(&self) {
        let _guard = self.lock.lock();
        self.condvar.notify_all();
    }
}

/// Blocking strategy that gives up after `timeout`, surfacing
/// [`WaitError::Timeout`] distinct from alerts and user cancellation.
#[derive(Debug)]
pub struct TimeoutBlockingWaitStrategy {
    lock: Mutex<()>,
    condvar: Condvar,
    timeout: Duration,
}

impl TimeoutBlockingWaitStrategy {
    pub fn new(timeout: Duration) -> Self {
        Self {
            lock: Mutex::new(()),
            condvar: Condvar::new(),
            timeout,
        }
    }
}

impl WaitStrategy for TimeoutBlockingWaitStrategy {
    fn wait_for(
        &self,
        sequence: i64,
        cursor: &Sequence,
        dependents: &[Arc<Sequence>],
        alert: &AlertSignal,
    ) -> Result<i64, WaitError> {
        let deadline = Instant::now() + self.timeout;

        if cursor.get() < sequence {
            let mut guard = self.lock.lock();
            while cursor.get() < sequence {
                alert.check()?;
                let now = Instant::now();
                if now >= deadline {
                    return Err(WaitError::Timeout);
                }
                self.condvar.wait_for(&mut guard, deadline - now);
            }
        }

        loop {
            alert.check()?;
            let available = available_sequence(cursor, dependents);
            if available >= sequence {
                return Ok(available);
            }
            if Instant::now() >= deadline {
                return Err(WaitError::Timeout);
            }
            std::thread::yield_now();
        }
    }

    fn signal_all(&self) {
        let _guard = self.lock.lock();
        self.condvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_spin_returns_available_sequence() {
        let cursor = Sequence::new(5);
        let alert = AlertSignal::default();
        let available = BusySpinWaitStrategy
            .wait_for(3, &cursor, &[], &alert)
            .unwrap();
        assert_eq!(available, 5);
    }

    #[test]
    fn dependents_constrain_availability() {
        let cursor = Sequence::new(10);
        let dependent = Arc::new(Sequence::new(4));
        let alert = AlertSignal::default();
        let available = BusySpinWaitStrategy
            .wait_for(2, &cursor, &[dependent], &alert)
            .unwrap();
        assert_eq!(available, 4);
    }

    #[test]
    fn alert_breaks_the_wait() {
        let cursor = Sequence::new(-1);
        let alert = AlertSignal::default();
        alert.raise();
        let err = BusySpinWaitStrategy
            .wait_for(0, &cursor, &[], &alert)
            .unwrap_err();
        assert_eq!(err, WaitError::Alerted);
    }

    #[test]
    fn timeout_blocking_times_out() {
        let strategy = TimeoutBlockingWaitStrategy::new(Duration::from_millis(20));
        let cursor = Sequence::new(-1);
        let alert = AlertSignal::default();
        let err = strategy.wait_for(0, &cursor, &[], &alert).unwrap_err();
        assert_eq!(err, WaitError::Timeout);
    }
}
