//! Scheduled message storage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hm_common::SerializedMessage;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::SchedulerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduledStatus {
    Pending,
    /// A worker won the delivery race and is dispatching.
    Delivering,
    Delivered,
    Cancelled,
    Failed,
}

impl ScheduledStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScheduledStatus::Delivered | ScheduledStatus::Cancelled | ScheduledStatus::Failed
        )
    }
}

#[derive(Debug, Clone)]
pub struct ScheduledEntry {
    pub schedule_id: Uuid,
    pub message: SerializedMessage,
    pub deliver_at: DateTime<Utc>,
    pub priority: i32,
    pub status: ScheduledStatus,
    pub destination: Option<String>,
    pub skip_if_past_due: bool,
    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Filter for [`ScheduledStorage::query`].
#[derive(Debug, Clone, Default)]
pub struct ScheduleQuery {
    pub status: Option<ScheduledStatus>,
    pub due_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

#[async_trait]
pub trait ScheduledStorage: Send + Sync {
    async fn add(&self, entry: ScheduledEntry) -> Result<ScheduledEntry, SchedulerError>;

    /// Pending entries due at `as_of`, ordered `deliver_at asc, priority desc`.
    async fn get_due(
        &self,
        as_of: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledEntry>, SchedulerError>;

    async fn get(&self, id: Uuid) -> Result<Option<ScheduledEntry>, SchedulerError>;

    /// `Pending -> Cancelled`; a no-op returning `false` in any other state.
    async fn cancel(&self, id: Uuid) -> Result<bool, SchedulerError>;

    /// Atomic `Pending -> Delivering`; `false` means another worker won (or
    /// the entry was cancelled meanwhile).
    async fn try_begin_delivery(&self, id: Uuid) -> Result<bool, SchedulerError>;

    async fn mark_delivered(&self, id: Uuid) -> Result<(), SchedulerError>;

    async fn mark_failed(&self, id: Uuid, error: String) -> Result<(), SchedulerError>;

    async fn query(&self, filter: ScheduleQuery) -> Result<Vec<ScheduledEntry>, SchedulerError>;

    /// Remove terminal entries older than `older_than`.
    async fn cleanup(&self, older_than: DateTime<Utc>) -> Result<usize, SchedulerError>;
}

/// In-memory scheduled storage.
#[derive(Default)]
pub struct InMemoryScheduledStorage {
    entries: DashMap<Uuid, ScheduledEntry>,
}

impl InMemoryScheduledStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[async_trait]
impl ScheduledStorage for InMemoryScheduledStorage {
    async fn add(&self, entry: ScheduledEntry) -> Result<ScheduledEntry, SchedulerError> {
        debug!(
            schedule_id = %entry.schedule_id,
            deliver_at = %entry.deliver_at,
            "scheduled entry added"
        );
        self.entries.insert(entry.schedule_id, entry.clone());
        Ok(entry)
    }

    async fn get_due(
        &self,
        as_of: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledEntry>, SchedulerError> {
        let mut due: Vec<ScheduledEntry> = self
            .entries
            .iter()
            .filter(|e| e.status == ScheduledStatus::Pending && e.deliver_at <= as_of)
            .map(|e| e.clone())
            .collect();
        due.sort_by(|a, b| {
            a.deliver_at
                .cmp(&b.deliver_at)
                .then(b.priority.cmp(&a.priority))
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn get(&self, id: Uuid) -> Result<Option<ScheduledEntry>, SchedulerError> {
        Ok(self.entries.get(&id).map(|e| e.clone()))
    }

    async fn cancel(&self, id: Uuid) -> Result<bool, SchedulerError> {
        match self.entries.get_mut(&id) {
            Some(mut entry) if entry.status == ScheduledStatus::Pending => {
                entry.status = ScheduledStatus::Cancelled;
                debug!(schedule_id = %id, "schedule cancelled");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn try_begin_delivery(&self, id: Uuid) -> Result<bool, SchedulerError> {
        match self.entries.get_mut(&id) {
            Some(mut entry) if entry.status == ScheduledStatus::Pending => {
                entry.status = ScheduledStatus::Delivering;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_delivered(&self, id: Uuid) -> Result<(), SchedulerError> {
        let mut entry = self
            .entries
            .get_mut(&id)
            .ok_or(SchedulerError::NotFound(id))?;
        entry.status = ScheduledStatus::Delivered;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: String) -> Result<(), SchedulerError> {
        let mut entry = self
            .entries
            .get_mut(&id)
            .ok_or(SchedulerError::NotFound(id))?;
        entry.status = ScheduledStatus::Failed;
        entry.last_error = Some(error);
        Ok(())
    }

    async fn query(&self, filter: ScheduleQuery) -> Result<Vec<ScheduledEntry>, SchedulerError> {
        let mut matches: Vec<ScheduledEntry> = self
            .entries
            .iter()
            .filter(|e| {
                filter.status.map_or(true, |s| e.status == s)
                    && filter.due_before.map_or(true, |t| e.deliver_at < t)
            })
            .map(|e| e.clone())
            .collect();
        matches.sort_by_key(|e| e.deliver_at);
        if let Some(limit) = filter.limit {
            matches.truncate(limit);
        }
        Ok(matches)
    }

    async fn cleanup(&self, older_than: DateTime<Utc>) -> Result<usize, SchedulerError> {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| !(e.status.is_terminal() && e.created_at < older_than));
        Ok(before - self.entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hm_common::MessageKind;

    fn entry(deliver_offset_ms: i64, priority: i32) -> ScheduledEntry {
        ScheduledEntry {
            schedule_id: Uuid::new_v4(),
            message: SerializedMessage {
                message_id: Uuid::new_v4(),
                message_type: "reports.generate".to_string(),
                kind: MessageKind::Command,
                timestamp: Utc::now(),
                correlation_id: None,
                causation_id: None,
                metadata: Default::default(),
                payload: serde_json::json!({}),
            },
            deliver_at: Utc::now() + chrono::Duration::milliseconds(deliver_offset_ms),
            priority,
            status: ScheduledStatus::Pending,
            destination: None,
            skip_if_past_due: false,
            created_at: Utc::now(),
            last_error: None,
        }
    }

    #[tokio::test]
    async fn due_ordering_is_deliver_at_then_priority() {
        let storage = InMemoryScheduledStorage::new();
        let late_high = storage.add(entry(-100, 10)).await.unwrap();
        let early_low = storage.add(entry(-300, 1)).await.unwrap();
        let early_high = storage.add(entry(-300, 9)).await.unwrap();
        storage.add(entry(60_000, 99)).await.unwrap();

        let due = storage.get_due(Utc::now(), 10).await.unwrap();
        let ids: Vec<Uuid> = due.iter().map(|e| e.schedule_id).collect();
        assert_eq!(
            ids,
            vec![
                early_high.schedule_id,
                early_low.schedule_id,
                late_high.schedule_id
            ]
        );
    }

    #[tokio::test]
    async fn cancel_only_wins_from_pending() {
        let storage = InMemoryScheduledStorage::new();
        let e = storage.add(entry(-10, 0)).await.unwrap();

        assert!(storage.cancel(e.schedule_id).await.unwrap());
        // Second cancel is a no-op.
        assert!(!storage.cancel(e.schedule_id).await.unwrap());
        // And a cancelled entry cannot begin delivery.
        assert!(!storage.try_begin_delivery(e.schedule_id).await.unwrap());
    }

    #[tokio::test]
    async fn delivery_race_has_one_winner() {
        let storage = InMemoryScheduledStorage::new();
        let e = storage.add(entry(-10, 0)).await.unwrap();

        assert!(storage.try_begin_delivery(e.schedule_id).await.unwrap());
        assert!(!storage.try_begin_delivery(e.schedule_id).await.unwrap());

        storage.mark_delivered(e.schedule_id).await.unwrap();
        let stored = storage.get(e.schedule_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ScheduledStatus::Delivered);
    }

    #[tokio::test]
    async fn cleanup_drops_only_old_terminal_entries() {
        let storage = InMemoryScheduledStorage::new();
        let done = storage.add(entry(-10, 0)).await.unwrap();
        storage.try_begin_delivery(done.schedule_id).await.unwrap();
        storage.mark_delivered(done.schedule_id).await.unwrap();
        storage.add(entry(-10, 0)).await.unwrap();

        let removed = storage.cleanup(Utc::now()).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(storage.len(), 1);
    }
}
