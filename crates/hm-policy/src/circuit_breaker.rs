//! Circuit breaker and its retry-policy adapter.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use hm_common::ProcessingError;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::retry::RetryPolicy;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Circuit breaker protecting a downstream from repeated failures.
///
/// Closed until `failure_threshold` consecutive failures; open for
/// `reset_timeout`, then half-open where `success_threshold` successes close
/// it again and any failure re-opens it.
pub struct CircuitBreaker {
    state: RwLock<CircuitState>,
    failure_count: AtomicU32,
    success_count: AtomicU32,
    last_failure_time: RwLock<Option<Instant>>,

    failure_threshold: u32,
    success_threshold: u32,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, success_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            state: RwLock::new(CircuitState::Closed),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            last_failure_time: RwLock::new(None),
            failure_threshold,
            success_threshold,
            reset_timeout,
        }
    }

    /// Check if a request should be allowed through.
    pub fn allow_request(&self) -> bool {
        let state = *self.state.read();

        match state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if let Some(last_failure) = *self.last_failure_time.read() {
                    if last_failure.elapsed() >= self.reset_timeout {
                        *self.state.write() = CircuitState::HalfOpen;
                        self.success_count.store(0, Ordering::SeqCst);
                        debug!("circuit breaker transitioning to half-open");
                        return true;
                    }
                }
                false
            }
            CircuitState::HalfOpen => true,
        }
    }

    pub fn record_success(&self) {
        let state = *self.state.read();

        match state {
            CircuitState::HalfOpen => {
                let count = self.success_count.fetch_add(1, Ordering::SeqCst) + 1;
                if count >= self.success_threshold {
                    *self.state.write() = CircuitState::Closed;
                    self.failure_count.store(0, Ordering::SeqCst);
                    info!(successes = count, "circuit breaker closed");
                }
            }
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::SeqCst);
            }
            _ => {}
        }
    }

    pub fn record_failure(&self) {
        let state = *self.state.read();

        match state {
            CircuitState::Closed => {
                let count = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
                if count >= self.failure_threshold {
                    *self.state.write() = CircuitState::Open;
                    *self.last_failure_time.write() = Some(Instant::now());
                    warn!(failures = count, "circuit breaker opened");
                }
            }
            CircuitState::HalfOpen => {
                // Any failure in half-open immediately re-opens.
                *self.state.write() = CircuitState::Open;
                *self.last_failure_time.write() = Some(Instant::now());
                self.success_count.store(0, Ordering::SeqCst);
                warn!("circuit breaker re-opened on failure in half-open state");
            }
            _ => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        *self.state.read()
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::SeqCst)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(10, 5, Duration::from_secs(5))
    }
}

/// Retry policy that trips a per-failure-key circuit.
///
/// The failure key derives from the error kind plus a digest of the message,
/// so distinct failure signatures break independently. Per-key state lives
/// in a shared concurrent map.
pub struct CircuitBreakerRetryPolicy {
    breakers: DashMap<String, CircuitBreaker>,
    max_retries: u32,
    retry_delay: Duration,
    failure_threshold: u32,
    open_duration: Duration,
}

impl CircuitBreakerRetryPolicy {
    pub fn new(failure_threshold: u32, open_duration: Duration) -> Self {
        Self {
            breakers: DashMap::new(),
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
            failure_threshold,
            open_duration,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    fn failure_key(error: &ProcessingError) -> String {
        let digest = Sha256::digest(error.message.as_bytes());
        format!("{}:{}", error.kind, &hex::encode(digest)[..16])
    }

    /// Current circuit state for the key derived from `error`.
    pub fn circuit_state(&self, error: &ProcessingError) -> CircuitState {
        let key = Self::failure_key(error);
        self.breakers
            .get(&key)
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }
}

impl RetryPolicy for CircuitBreakerRetryPolicy {
    fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn should_retry(&self, error: &ProcessingError, attempt: u32) -> bool {
        if attempt >= self.max_retries {
            return false;
        }
        if error.kind == hm_common::ErrorKind::Cancelled || error.kind.is_fatal() {
            return false;
        }

        let key = Self::failure_key(error);
        let breaker = self.breakers.entry(key).or_insert_with(|| {
            CircuitBreaker::new(self.failure_threshold, 1, self.open_duration)
        });

        // The decision reflects the circuit as of this failure; the failure
        // itself is recorded after, so the attempt that trips the threshold
        // is still allowed its retry and the following one is refused.
        let allowed = breaker.allow_request();
        breaker.record_failure();
        allowed
    }

    fn retry_delay(&self, _attempt: u32) -> Duration {
        self.retry_delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hm_common::ErrorKind;

    #[test]
    fn breaker_trips_at_threshold() {
        let cb = CircuitBreaker::new(3, 2, Duration::from_secs(1));

        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request());

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
    }

    #[test]
    fn breaker_resets_failure_count_on_success() {
        let cb = CircuitBreaker::new(3, 2, Duration::from_secs(1));

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.failure_count(), 2);

        cb.record_success();
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn breaker_half_opens_after_reset_timeout() {
        let cb = CircuitBreaker::new(1, 1, Duration::from_millis(20));
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());

        std::thread::sleep(Duration::from_millis(30));
        assert!(cb.allow_request());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn policy_opens_circuit_per_failure_key() {
        let policy = CircuitBreakerRetryPolicy::new(3, Duration::from_secs(1))
            .with_max_retries(10);
        let err = ProcessingError::new(ErrorKind::TransientIo, "connection refused");

        // Three failures with the same key trip the breaker; the fourth
        // decision is refused.
        assert!(policy.should_retry(&err, 0));
        assert!(policy.should_retry(&err, 1));
        assert!(policy.should_retry(&err, 2));
        assert!(!policy.should_retry(&err, 3));

        // A different failure signature has its own circuit.
        let other = ProcessingError::new(ErrorKind::TransientIo, "dns lookup failed");
        assert!(policy.should_retry(&other, 0));
    }

    #[test]
    fn policy_allows_again_after_open_window() {
        let policy = CircuitBreakerRetryPolicy::new(2, Duration::from_millis(20))
            .with_max_retries(10);
        let err = ProcessingError::new(ErrorKind::Timeout, "slow upstream");

        assert!(policy.should_retry(&err, 0));
        assert!(policy.should_retry(&err, 1));
        assert!(!policy.should_retry(&err, 2));

        std::thread::sleep(Duration::from_millis(30));
        // Half-open after the window: the next attempt is allowed.
        assert!(policy.should_retry(&err, 3));
    }
}
