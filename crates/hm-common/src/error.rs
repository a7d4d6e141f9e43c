//! Classified error taxonomy.
//!
//! Failures crossing subsystem boundaries carry an [`ErrorKind`] tag rather
//! than a concrete type. Retry policies, the idempotency classifier and the
//! dead-letter queue all make their decisions against the tag, and cached
//! failures are reconstructed from it, so comparisons stay stable across
//! deployments.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Abstract failure kinds. Deterministic kinds are safe to cache as
/// idempotent outcomes; transient kinds are retried per policy; fatal kinds
/// are never retried and never cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Input failed validation; will fail the same way again.
    Validation,
    /// Business-rule violation or invalid state transition.
    InvalidOperation,
    /// Operation not supported by the receiving component.
    NotSupported,
    /// Malformed payload or unparsable field.
    Format,
    /// Authentication/authorization denial.
    Unauthorized,
    /// Referenced entity does not exist.
    NotFound,
    /// Signature did not verify.
    SignatureVerification,
    /// Decryption or tag verification failed.
    Encryption,
    /// The caller cancelled; never cached, never retried.
    Cancelled,
    /// Deadline elapsed; retryable.
    Timeout,
    /// Transient I/O or network failure; retryable.
    TransientIo,
    /// Optimistic-concurrency conflict; retry after reload.
    ConcurrencyConflict,
    /// Rejected by a rate limiter.
    RateLimited,
    /// Resource exhaustion or corruption; surfaced, never retried.
    Fatal,
    /// Anything unclassified; surfaced, not cached.
    Unknown,
}

impl ErrorKind {
    /// Deterministic failures produce the same outcome on re-execution, so
    /// caching them is sound.
    pub fn is_deterministic(&self) -> bool {
        matches!(
            self,
            ErrorKind::Validation
                | ErrorKind::InvalidOperation
                | ErrorKind::NotSupported
                | ErrorKind::Format
                | ErrorKind::Unauthorized
                | ErrorKind::NotFound
                | ErrorKind::SignatureVerification
                | ErrorKind::Encryption
        )
    }

    /// Transient failures are candidates for retry.
    ///
    /// Cancellation is checked before timeout here and everywhere else: a
    /// cancelled dispatch must never be mistaken for a retryable timeout.
    pub fn is_transient(&self) -> bool {
        if *self == ErrorKind::Cancelled {
            return false;
        }
        matches!(self, ErrorKind::Timeout | ErrorKind::TransientIo)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorKind::Fatal)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::InvalidOperation => "INVALID_OPERATION",
            ErrorKind::NotSupported => "NOT_SUPPORTED",
            ErrorKind::Format => "FORMAT",
            ErrorKind::Unauthorized => "UNAUTHORIZED",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::SignatureVerification => "SIGNATURE_VERIFICATION",
            ErrorKind::Encryption => "ENCRYPTION",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::TransientIo => "TRANSIENT_IO",
            ErrorKind::ConcurrencyConflict => "CONCURRENCY_CONFLICT",
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::Fatal => "FATAL",
            ErrorKind::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// A classified processing failure: the kind tag plus human-readable detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct ProcessingError {
    pub kind: ErrorKind,
    pub message: String,
    /// Individual validation errors, when `kind == Validation`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
}

impl ProcessingError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: Vec::new(),
        }
    }

    pub fn validation(errors: Vec<String>) -> Self {
        Self {
            kind: ErrorKind::Validation,
            message: errors.join("; "),
            details: errors,
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "dispatch cancelled")
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidOperation, message)
    }
}

/// Top-level error for facade callers.
#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("no handler registered for message type '{0}'")]
    NoHandler(String),

    #[error("dispatch queue at capacity")]
    CapacityExceeded,

    #[error("processing failed: {0}")]
    Processing(ProcessingError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("shutdown in progress")]
    ShutdownInProgress,
}

impl From<ProcessingError> for MessagingError {
    fn from(error: ProcessingError) -> Self {
        MessagingError::Processing(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_never_transient() {
        assert!(!ErrorKind::Cancelled.is_transient());
        assert!(!ErrorKind::Cancelled.is_deterministic());
        assert!(ErrorKind::Timeout.is_transient());
    }

    #[test]
    fn deterministic_kinds_match_classifier_table() {
        for kind in [
            ErrorKind::Validation,
            ErrorKind::InvalidOperation,
            ErrorKind::NotSupported,
            ErrorKind::Format,
            ErrorKind::Unauthorized,
            ErrorKind::NotFound,
        ] {
            assert!(kind.is_deterministic(), "{kind} should be deterministic");
        }
        for kind in [
            ErrorKind::Timeout,
            ErrorKind::Cancelled,
            ErrorKind::TransientIo,
            ErrorKind::Fatal,
            ErrorKind::Unknown,
        ] {
            assert!(!kind.is_deterministic(), "{kind} must not be deterministic");
        }
    }

    #[test]
    fn validation_error_aggregates_details() {
        let err = ProcessingError::validation(vec![
            "CustomerId required".to_string(),
            "Amount must be positive".to_string(),
        ]);
        assert_eq!(err.kind, ErrorKind::Validation);
        assert_eq!(err.details.len(), 2);
        assert!(err.message.contains("CustomerId required"));
    }
}
