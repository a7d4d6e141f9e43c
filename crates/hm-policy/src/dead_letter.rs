//! Dead-letter queue: terminal holding area for messages that exhausted
//! their retries or violated an invariant.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hm_common::SerializedMessage;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeadLetterStatus {
    Active,
    Retried,
    Discarded,
}

/// Why and where a message was dead-lettered.
#[derive(Debug, Clone)]
pub struct DeadLetterContext {
    pub reason: String,
    /// Component that gave up on the message (e.g. "outbox", "dispatcher").
    pub component: String,
    pub retry_count: u32,
}

#[derive(Debug, Clone)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub message: SerializedMessage,
    pub reason: String,
    pub component: String,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub status: DeadLetterStatus,
}

/// Aggregate view over the queue.
#[derive(Debug, Clone, Default)]
pub struct DeadLetterStatistics {
    pub by_status: HashMap<DeadLetterStatus, usize>,
    pub by_component: HashMap<String, usize>,
    /// Reasons truncated to their first 64 chars, to keep cardinality sane.
    pub by_reason: HashMap<String, usize>,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait DeadLetterQueue: Send + Sync {
    async fn send_to_dead_letter(
        &self,
        message: SerializedMessage,
        context: DeadLetterContext,
    ) -> Uuid;

    /// Active entries, newest first, up to `limit`.
    async fn dead_letters(&self, limit: usize) -> Vec<DeadLetterEntry>;

    /// Active entries of one message type, newest first, up to `limit`.
    async fn dead_letters_of_type(&self, message_type: &str, limit: usize) -> Vec<DeadLetterEntry> {
        self.dead_letters(usize::MAX)
            .await
            .into_iter()
            .filter(|e| e.message.message_type == message_type)
            .take(limit)
            .collect()
    }

    /// Mark an entry as retried. Returns the entry for re-dispatch.
    async fn retry(&self, id: Uuid) -> Option<DeadLetterEntry>;

    /// Mark an entry as discarded.
    async fn discard(&self, id: Uuid) -> bool;

    /// Number of active entries.
    async fn count(&self) -> usize;

    async fn statistics(&self) -> DeadLetterStatistics;
}

/// In-memory dead-letter queue.
#[derive(Default)]
pub struct InMemoryDeadLetterQueue {
    entries: DashMap<Uuid, DeadLetterEntry>,
}

impl InMemoryDeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

fn truncate_reason(reason: &str) -> String {
    reason.chars().take(64).collect()
}

#[async_trait]
impl DeadLetterQueue for InMemoryDeadLetterQueue {
    async fn send_to_dead_letter(
        &self,
        message: SerializedMessage,
        context: DeadLetterContext,
    ) -> Uuid {
        let id = Uuid::new_v4();
        warn!(
            dead_letter_id = %id,
            message_id = %message.message_id,
            component = %context.component,
            reason = %context.reason,
            retry_count = context.retry_count,
            "message sent to dead-letter queue"
        );
        self.entries.insert(
            id,
            DeadLetterEntry {
                id,
                message,
                reason: context.reason,
                component: context.component,
                retry_count: context.retry_count,
                created_at: Utc::now(),
                status: DeadLetterStatus::Active,
            },
        );
        id
    }

    async fn dead_letters(&self, limit: usize) -> Vec<DeadLetterEntry> {
        let mut active: Vec<DeadLetterEntry> = self
            .entries
            .iter()
            .filter(|e| e.status == DeadLetterStatus::Active)
            .map(|e| e.clone())
            .collect();
        active.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        active.truncate(limit);
        active
    }

    async fn retry(&self, id: Uuid) -> Option<DeadLetterEntry> {
        let mut entry = self.entries.get_mut(&id)?;
        if entry.status != DeadLetterStatus::Active {
            return None;
        }
        entry.status = DeadLetterStatus::Retried;
        info!(dead_letter_id = %id, "dead-letter entry marked retried");
        Some(entry.clone())
    }

    async fn discard(&self, id: Uuid) -> bool {
        match self.entries.get_mut(&id) {
            Some(mut entry) if entry.status == DeadLetterStatus::Active => {
                entry.status = DeadLetterStatus::Discarded;
                info!(dead_letter_id = %id, "dead-letter entry discarded");
                true
            }
            _ => false,
        }
    }

    async fn count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.status == DeadLetterStatus::Active)
            .count()
    }

    async fn statistics(&self) -> DeadLetterStatistics {
        let mut stats = DeadLetterStatistics::default();
        for entry in self.entries.iter() {
            *stats.by_status.entry(entry.status).or_insert(0) += 1;
            *stats
                .by_component
                .entry(entry.component.clone())
                .or_insert(0) += 1;
            *stats
                .by_reason
                .entry(truncate_reason(&entry.reason))
                .or_insert(0) += 1;
            stats.oldest = match stats.oldest {
                Some(t) if t <= entry.created_at => Some(t),
                _ => Some(entry.created_at),
            };
            stats.newest = match stats.newest {
                Some(t) if t >= entry.created_at => Some(t),
                _ => Some(entry.created_at),
            };
        }
        stats
    }
}
