//! Outbox entry model and storage contract.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hm_common::SerializedMessage;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("outbox entry '{0}' not found")]
    NotFound(Uuid),

    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl OutboxStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Processed | OutboxStatus::Failed)
    }
}

/// A durable publish awaiting (or past) delivery.
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub message: SerializedMessage,
    pub destination: Option<String>,
    pub priority: i32,
    pub max_retries: u32,
    pub retry_count: u32,
    /// Fixed retry delay; entries without one use the processor's policy.
    pub retry_delay: Option<Duration>,
    pub created_at: DateTime<Utc>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub status: OutboxStatus,
    /// In-row worker lease; a crashed worker's claim lapses when it expires.
    pub lease_expires_at: Option<DateTime<Utc>>,
}

/// Storage contract for the outbox.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn add(&self, entry: OutboxEntry) -> Result<(), OutboxError>;

    /// Up to `limit` deliverable entries (`Pending` and due), ordered
    /// `priority desc, created_at asc`, atomically marked `Processing` with
    /// a lease of `lease_duration`. Expired `Processing` leases count as
    /// deliverable again.
    async fn fetch_due(
        &self,
        limit: usize,
        lease_duration: Duration,
    ) -> Result<Vec<OutboxEntry>, OutboxError>;

    async fn mark_processed(&self, id: Uuid) -> Result<(), OutboxError>;

    /// Record a failed attempt and schedule the next one.
    async fn mark_retry(
        &self,
        id: Uuid,
        next_retry_at: DateTime<Utc>,
        error: String,
    ) -> Result<(), OutboxError>;

    /// Terminal failure after retries are exhausted.
    async fn mark_failed(&self, id: Uuid, error: String) -> Result<(), OutboxError>;

    async fn pending_count(&self) -> Result<usize, OutboxError>;

    async fn failed(&self, limit: usize) -> Result<Vec<OutboxEntry>, OutboxError>;

    async fn get(&self, id: Uuid) -> Result<Option<OutboxEntry>, OutboxError>;
}

/// In-memory outbox store.
#[derive(Default)]
pub struct InMemoryOutboxStore {
    entries: DashMap<Uuid, OutboxEntry>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn add(&self, entry: OutboxEntry) -> Result<(), OutboxError> {
        debug!(outbox_id = %entry.id, message_id = %entry.message.message_id, "outbox entry added");
        self.entries.insert(entry.id, entry);
        Ok(())
    }

    async fn fetch_due(
        &self,
        limit: usize,
        lease_duration: Duration,
    ) -> Result<Vec<OutboxEntry>, OutboxError> {
        let now = Utc::now();
        let lease = now + chrono::Duration::from_std(lease_duration).unwrap_or_default();

        let mut due: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|e| {
                let deliverable_pending = e.status == OutboxStatus::Pending
                    && e.next_retry_at.map_or(true, |t| t <= now);
                let lapsed_lease = e.status == OutboxStatus::Processing
                    && e.lease_expires_at.map_or(true, |t| t <= now);
                deliverable_pending || lapsed_lease
            })
            .map(|e| e.id)
            .collect();

        // priority desc, created_at asc
        due.sort_by(|a, b| {
            let (ea, eb) = (self.entries.get(a), self.entries.get(b));
            match (ea, eb) {
                (Some(ea), Some(eb)) => eb
                    .priority
                    .cmp(&ea.priority)
                    .then(ea.created_at.cmp(&eb.created_at)),
                _ => std::cmp::Ordering::Equal,
            }
        });
        due.truncate(limit);

        let mut leased = Vec::with_capacity(due.len());
        for id in due {
            if let Some(mut entry) = self.entries.get_mut(&id) {
                entry.status = OutboxStatus::Processing;
                entry.lease_expires_at = Some(lease);
                leased.push(entry.clone());
            }
        }
        Ok(leased)
    }

    async fn mark_processed(&self, id: Uuid) -> Result<(), OutboxError> {
        let mut entry = self.entries.get_mut(&id).ok_or(OutboxError::NotFound(id))?;
        entry.status = OutboxStatus::Processed;
        entry.processed_at = Some(Utc::now());
        entry.lease_expires_at = None;
        Ok(())
    }

    async fn mark_retry(
        &self,
        id: Uuid,
        next_retry_at: DateTime<Utc>,
        error: String,
    ) -> Result<(), OutboxError> {
        let mut entry = self.entries.get_mut(&id).ok_or(OutboxError::NotFound(id))?;
        entry.status = OutboxStatus::Pending;
        entry.retry_count += 1;
        entry.next_retry_at = Some(next_retry_at);
        entry.last_error = Some(error);
        entry.lease_expires_at = None;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: String) -> Result<(), OutboxError> {
        let mut entry = self.entries.get_mut(&id).ok_or(OutboxError::NotFound(id))?;
        entry.status = OutboxStatus::Failed;
        entry.last_error = Some(error);
        entry.lease_expires_at = None;
        Ok(())
    }

    async fn pending_count(&self) -> Result<usize, OutboxError> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.status == OutboxStatus::Pending)
            .count())
    }

    async fn failed(&self, limit: usize) -> Result<Vec<OutboxEntry>, OutboxError> {
        let mut failed: Vec<OutboxEntry> = self
            .entries
            .iter()
            .filter(|e| e.status == OutboxStatus::Failed)
            .map(|e| e.clone())
            .collect();
        failed.sort_by_key(|e| e.created_at);
        failed.truncate(limit);
        Ok(failed)
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxEntry>, OutboxError> {
        Ok(self.entries.get(&id).map(|e| e.clone()))
    }
}
