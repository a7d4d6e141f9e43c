//! Retry policies.
//!
//! A policy decides whether a failed attempt should be retried and how long
//! to wait before the next one. Decisions are made against the classified
//! [`ErrorKind`] of the failure: transient kinds retry, cancellation never
//! retries, fatal kinds never retry.

use std::collections::HashSet;
use std::time::Duration;

use hm_common::{ErrorKind, ProcessingError};
use rand::Rng;

pub trait RetryPolicy: Send + Sync {
    fn max_retries(&self) -> u32;

    /// `attempt` is 0-based: the first retry decision is made with
    /// `attempt == 0` after the initial execution failed.
    fn should_retry(&self, error: &ProcessingError, attempt: u32) -> bool;

    fn retry_delay(&self, attempt: u32) -> Duration;
}

/// Never retries.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRetryPolicy;

impl RetryPolicy for NoRetryPolicy {
    fn max_retries(&self) -> u32 {
        0
    }

    fn should_retry(&self, _error: &ProcessingError, _attempt: u32) -> bool {
        false
    }

    fn retry_delay(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }
}

/// Fixed delay between attempts, for a configured set of retryable kinds.
#[derive(Debug, Clone)]
pub struct LinearRetryPolicy {
    max_retries: u32,
    delay: Duration,
    retryable: HashSet<ErrorKind>,
}

impl LinearRetryPolicy {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            delay,
            retryable: [ErrorKind::Timeout, ErrorKind::TransientIo]
                .into_iter()
                .collect(),
        }
    }

    pub fn with_retryable_kinds(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retryable = kinds.into_iter().collect();
        self
    }
}

impl RetryPolicy for LinearRetryPolicy {
    fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn should_retry(&self, error: &ProcessingError, attempt: u32) -> bool {
        if attempt >= self.max_retries {
            return false;
        }
        if error.kind == ErrorKind::Cancelled || error.kind.is_fatal() {
            return false;
        }
        self.retryable.contains(&error.kind)
    }

    fn retry_delay(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

/// Exponential back-off with jitter: `min(max, base · 2^attempt · (1 + U[0, jitter]))`.
///
/// Only transient kinds (timeout, transient I/O) are retried; cancellation
/// and fatal kinds never are.
#[derive(Debug, Clone)]
pub struct ExponentialBackoffPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter_factor: f64,
}

impl ExponentialBackoffPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            jitter_factor: 0.2,
        }
    }

    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.clamp(0.0, 1.0);
        self
    }
}

impl Default for ExponentialBackoffPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(100), Duration::from_secs(30))
    }
}

impl RetryPolicy for ExponentialBackoffPolicy {
    fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn should_retry(&self, error: &ProcessingError, attempt: u32) -> bool {
        attempt < self.max_retries && error.kind.is_transient()
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(32);
        let base = self.base_delay.as_secs_f64() * 2f64.powi(exponent as i32);
        let jitter = if self.jitter_factor > 0.0 {
            1.0 + rand::thread_rng().gen_range(0.0..self.jitter_factor)
        } else {
            1.0
        };
        let delay = Duration::from_secs_f64(base * jitter);
        delay.min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err(kind: ErrorKind) -> ProcessingError {
        ProcessingError::new(kind, "test failure")
    }

    #[test]
    fn no_retry_policy_never_retries() {
        let policy = NoRetryPolicy;
        assert!(!policy.should_retry(&err(ErrorKind::Timeout), 0));
    }

    #[test]
    fn linear_retries_only_configured_kinds() {
        let policy = LinearRetryPolicy::new(3, Duration::from_millis(10));
        assert!(policy.should_retry(&err(ErrorKind::Timeout), 0));
        assert!(policy.should_retry(&err(ErrorKind::TransientIo), 2));
        assert!(!policy.should_retry(&err(ErrorKind::Timeout), 3));
        assert!(!policy.should_retry(&err(ErrorKind::Validation), 0));
        assert!(!policy.should_retry(&err(ErrorKind::Fatal), 0));
        assert!(!policy.should_retry(&err(ErrorKind::Cancelled), 0));
    }

    #[test]
    fn exponential_delay_grows_and_caps() {
        let policy = ExponentialBackoffPolicy::new(
            5,
            Duration::from_millis(100),
            Duration::from_secs(1),
        )
        .with_jitter(0.0);

        assert_eq!(policy.retry_delay(0), Duration::from_millis(100));
        assert_eq!(policy.retry_delay(1), Duration::from_millis(200));
        assert_eq!(policy.retry_delay(2), Duration::from_millis(400));
        assert_eq!(policy.retry_delay(10), Duration::from_secs(1));
    }

    #[test]
    fn exponential_jitter_stays_in_bounds() {
        let policy = ExponentialBackoffPolicy::new(
            5,
            Duration::from_millis(100),
            Duration::from_secs(60),
        )
        .with_jitter(0.5);

        for _ in 0..50 {
            let delay = policy.retry_delay(1);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(300));
        }
    }

    #[test]
    fn exponential_never_retries_cancellation() {
        let policy = ExponentialBackoffPolicy::default();
        assert!(!policy.should_retry(&err(ErrorKind::Cancelled), 0));
        assert!(!policy.should_retry(&err(ErrorKind::Fatal), 0));
        assert!(!policy.should_retry(&err(ErrorKind::Unknown), 0));
    }
}
