//! Idempotency policy and failure classification.

use std::sync::Arc;
use std::time::Duration;

use hm_common::{ErrorKind, ProcessingError};

use crate::key::{DefaultKeyGenerator, IdempotencyKeyGenerator};

/// Decides whether a failure is deterministic enough to cache.
pub type FailureClassifier = Arc<dyn Fn(&ProcessingError) -> bool + Send + Sync>;

/// Default classifier over the error taxonomy:
///
/// | kind                                            | cached |
/// |-------------------------------------------------|--------|
/// | validation, invalid-operation, not-supported,   | yes    |
/// | format, unauthorized, not-found,                |        |
/// | signature-verification, encryption              |        |
/// | cancelled, timeout, transient I/O               | no     |
/// | fatal                                           | no     |
/// | anything else                                   | no     |
///
/// Cancellation is tested before the timeout family so a cancelled dispatch
/// is never misfiled as a cacheable or retryable timeout.
pub fn default_failure_classifier(error: &ProcessingError) -> bool {
    if error.kind == ErrorKind::Cancelled {
        return false;
    }
    error.kind.is_deterministic()
}

/// Immutable idempotency configuration consumed by the pipeline decorator.
#[derive(Clone)]
pub struct IdempotencyPolicy {
    pub success_ttl: Duration,
    pub failure_ttl: Duration,
    pub cache_failures: bool,
    pub key_generator: Arc<dyn IdempotencyKeyGenerator>,
    pub is_idempotent_failure: FailureClassifier,
}

impl IdempotencyPolicy {
    pub fn new() -> Self {
        Self {
            success_ttl: Duration::from_secs(24 * 60 * 60),
            failure_ttl: Duration::from_secs(60 * 60),
            cache_failures: true,
            key_generator: Arc::new(DefaultKeyGenerator),
            is_idempotent_failure: Arc::new(default_failure_classifier),
        }
    }

    pub fn with_success_ttl(mut self, ttl: Duration) -> Self {
        self.success_ttl = ttl;
        self
    }

    pub fn with_failure_ttl(mut self, ttl: Duration) -> Self {
        self.failure_ttl = ttl;
        self
    }

    pub fn with_cache_failures(mut self, cache_failures: bool) -> Self {
        self.cache_failures = cache_failures;
        self
    }

    pub fn with_key_generator(mut self, generator: Arc<dyn IdempotencyKeyGenerator>) -> Self {
        self.key_generator = generator;
        self
    }

    pub fn with_failure_classifier(mut self, classifier: FailureClassifier) -> Self {
        self.is_idempotent_failure = classifier;
        self
    }
}

impl Default for IdempotencyPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err(kind: ErrorKind) -> ProcessingError {
        ProcessingError::new(kind, "x")
    }

    #[test]
    fn deterministic_failures_are_cacheable() {
        for kind in [
            ErrorKind::Validation,
            ErrorKind::InvalidOperation,
            ErrorKind::NotSupported,
            ErrorKind::Format,
            ErrorKind::Unauthorized,
            ErrorKind::NotFound,
            ErrorKind::SignatureVerification,
            ErrorKind::Encryption,
        ] {
            assert!(default_failure_classifier(&err(kind)), "{kind}");
        }
    }

    #[test]
    fn transient_fatal_and_unknown_are_not_cacheable() {
        for kind in [
            ErrorKind::Cancelled,
            ErrorKind::Timeout,
            ErrorKind::TransientIo,
            ErrorKind::Fatal,
            ErrorKind::Unknown,
            ErrorKind::ConcurrencyConflict,
            ErrorKind::RateLimited,
        ] {
            assert!(!default_failure_classifier(&err(kind)), "{kind}");
        }
    }

    #[test]
    fn policy_defaults_match_contract() {
        let policy = IdempotencyPolicy::new();
        assert_eq!(policy.success_ttl, Duration::from_secs(86_400));
        assert_eq!(policy.failure_ttl, Duration::from_secs(3_600));
        assert!(policy.cache_failures);
    }
}
