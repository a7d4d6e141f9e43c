//! Idempotency response store.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hm_common::{ErrorKind, ProcessingError};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdempotencyStatus {
    Success,
    Failure,
    /// A worker is mid-flight; entries in this state time out so a crashed
    /// worker cannot wedge the key forever.
    Processing,
}

/// A cached outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyEntry {
    pub key: String,
    pub status: IdempotencyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
    pub stored_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyEntry {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Rebuild the classified failure for a cached-failure hit.
    pub fn reconstruct_failure(&self) -> ProcessingError {
        ProcessingError::new(
            self.failure_kind.unwrap_or(ErrorKind::Unknown),
            self.failure_message
                .clone()
                .unwrap_or_else(|| "cached failure".to_string()),
        )
    }
}

/// Storage contract. Implementations must be safe for concurrent callers;
/// stores for the same key are atomic replace, single writer wins.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Unexpired entry for `key`, if any. Implementations may prune expired
    /// entries on access.
    async fn get(&self, key: &str) -> Option<IdempotencyEntry>;

    async fn store_success(&self, key: &str, result: Option<serde_json::Value>, ttl: Duration);

    async fn store_failure(&self, key: &str, error: &ProcessingError, ttl: Duration);

    /// Mark a key as in-flight with a guard timeout.
    async fn store_processing(&self, key: &str, timeout: Duration);

    async fn exists(&self, key: &str) -> bool;

    /// Remove expired entries, returning how many were dropped.
    async fn cleanup_expired(&self) -> usize;
}

/// Concurrent in-memory store.
#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    entries: DashMap<String, IdempotencyEntry>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn expiry(ttl: Duration) -> DateTime<Utc> {
        // Absurdly large TTLs saturate to a century rather than overflow.
        let ttl = chrono::Duration::from_std(ttl)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        Utc::now() + ttl
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn get(&self, key: &str) -> Option<IdempotencyEntry> {
        let entry = self.entries.get(key)?;
        if entry.is_expired() {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(entry.clone())
    }

    async fn store_success(&self, key: &str, result: Option<serde_json::Value>, ttl: Duration) {
        let now = Utc::now();
        self.entries.insert(
            key.to_string(),
            IdempotencyEntry {
                key: key.to_string(),
                status: IdempotencyStatus::Success,
                success_result: result,
                failure_kind: None,
                failure_message: None,
                stored_at: now,
                expires_at: Self::expiry(ttl),
            },
        );
        debug!(key = %key, ttl_secs = ttl.as_secs(), "cached success outcome");
    }

    async fn store_failure(&self, key: &str, error: &ProcessingError, ttl: Duration) {
        let now = Utc::now();
        self.entries.insert(
            key.to_string(),
            IdempotencyEntry {
                key: key.to_string(),
                status: IdempotencyStatus::Failure,
                success_result: None,
                failure_kind: Some(error.kind),
                failure_message: Some(error.message.clone()),
                stored_at: now,
                expires_at: Self::expiry(ttl),
            },
        );
        debug!(key = %key, kind = %error.kind, "cached failure outcome");
    }

    async fn store_processing(&self, key: &str, timeout: Duration) {
        let now = Utc::now();
        self.entries.insert(
            key.to_string(),
            IdempotencyEntry {
                key: key.to_string(),
                status: IdempotencyStatus::Processing,
                success_result: None,
                failure_kind: None,
                failure_message: None,
                stored_at: now,
                expires_at: Self::expiry(timeout),
            },
        );
    }

    async fn exists(&self, key: &str) -> bool {
        self.get(key).await.is_some()
    }

    async fn cleanup_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        before - self.entries.len()
    }
}
