//! Saga persistence: long-running coordinators stored with an optimistic
//! concurrency version.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A persisted coordinator instance, keyed by its workflow correlation id.
///
/// `version` increases monotonically; every state transition bumps it and
/// the repository enforces compare-and-swap on update.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Saga {
    pub correlation_id: String,
    pub current_state: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_completed: bool,
    pub version: u64,
}

impl Saga {
    pub fn new(correlation_id: impl Into<String>, initial_state: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            correlation_id: correlation_id.into(),
            current_state: initial_state.into(),
            created_at: now,
            updated_at: now,
            is_completed: false,
            version: 1,
        }
    }

    /// Move to `state`, bumping the version and timestamp.
    pub fn transition_to(&mut self, state: impl Into<String>) {
        self.current_state = state.into();
        self.updated_at = Utc::now();
        self.version += 1;
    }

    pub fn complete(&mut self) {
        self.is_completed = true;
        self.updated_at = Utc::now();
        self.version += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SagaError {
    #[error(
        "concurrency conflict on saga '{correlation_id}': expected version {expected}, actual {actual}"
    )]
    ConcurrencyConflict {
        correlation_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("saga '{0}' already exists")]
    AlreadyExists(String),

    #[error("saga '{0}' not found")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Persistence contract for sagas.
#[async_trait]
pub trait SagaRepository: Send + Sync {
    /// Insert a new saga at version 1.
    async fn save(&self, saga: Saga) -> Result<(), SagaError>;

    /// Compare-and-swap update: succeeds only when the stored version equals
    /// `expected_version`; the stored row takes `saga`'s state with
    /// `expected_version + 1`.
    async fn update(&self, saga: Saga, expected_version: u64) -> Result<Saga, SagaError>;

    async fn find(&self, correlation_id: &str) -> Result<Option<Saga>, SagaError>;

    /// Incomplete sagas currently in `state`.
    async fn find_by_state(&self, state: &str) -> Result<Vec<Saga>, SagaError>;

    /// Incomplete sagas untouched since `older_than`.
    async fn find_stale(&self, older_than: DateTime<Utc>) -> Result<Vec<Saga>, SagaError>;

    async fn delete(&self, correlation_id: &str) -> Result<bool, SagaError>;
}

/// In-memory repository; CAS is per-entry under the concurrent map's shard
/// lock, so two racing updates see exactly one winner.
#[derive(Default)]
pub struct InMemorySagaRepository {
    sagas: DashMap<String, Saga>,
}

impl InMemorySagaRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sagas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sagas.is_empty()
    }
}

#[async_trait]
impl SagaRepository for InMemorySagaRepository {
    async fn save(&self, mut saga: Saga) -> Result<(), SagaError> {
        saga.version = 1;
        match self.sagas.entry(saga.correlation_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(SagaError::AlreadyExists(saga.correlation_id))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                debug!(correlation_id = %saga.correlation_id, "saga saved");
                slot.insert(saga);
                Ok(())
            }
        }
    }

    async fn update(&self, mut saga: Saga, expected_version: u64) -> Result<Saga, SagaError> {
        let mut entry = self
            .sagas
            .get_mut(&saga.correlation_id)
            .ok_or_else(|| SagaError::NotFound(saga.correlation_id.clone()))?;

        if entry.version != expected_version {
            return Err(SagaError::ConcurrencyConflict {
                correlation_id: saga.correlation_id.clone(),
                expected: expected_version,
                actual: entry.version,
            });
        }

        saga.version = expected_version + 1;
        saga.updated_at = Utc::now();
        *entry = saga.clone();
        debug!(
            correlation_id = %saga.correlation_id,
            version = saga.version,
            state = %saga.current_state,
            "saga updated"
        );
        Ok(saga)
    }

    async fn find(&self, correlation_id: &str) -> Result<Option<Saga>, SagaError> {
        Ok(self.sagas.get(correlation_id).map(|s| s.clone()))
    }

    async fn find_by_state(&self, state: &str) -> Result<Vec<Saga>, SagaError> {
        Ok(self
            .sagas
            .iter()
            .filter(|s| !s.is_completed && s.current_state == state)
            .map(|s| s.clone())
            .collect())
    }

    async fn find_stale(&self, older_than: DateTime<Utc>) -> Result<Vec<Saga>, SagaError> {
        Ok(self
            .sagas
            .iter()
            .filter(|s| !s.is_completed && s.updated_at < older_than)
            .map(|s| s.clone())
            .collect())
    }

    async fn delete(&self, correlation_id: &str) -> Result<bool, SagaError> {
        Ok(self.sagas.remove(correlation_id).is_some())
    }
}

/// Convenience for stale queries: "untouched for `age`".
pub fn stale_cutoff(age: std::time::Duration) -> DateTime<Utc> {
    Utc::now() - Duration::from_std(age).unwrap_or(Duration::zero())
}
