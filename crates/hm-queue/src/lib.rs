//! Durable queue contract and the embedded in-memory queue.

pub mod error;
pub mod memory;
pub mod worker;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hm_common::{ProcessingResult, SerializedMessage};
use uuid::Uuid;

pub use error::QueueError;
pub use memory::InMemoryQueueStore;
pub use worker::{ConsumerOptions, QueueWorker, WorkerStats};

pub type Result<T> = std::result::Result<T, QueueError>;

/// Options for a durable enqueue.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Higher dequeues first.
    pub priority: i32,
    /// Keep the entry invisible for this long after enqueue.
    pub delay: Option<Duration>,
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

/// A queued message with its delivery bookkeeping.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// Receipt handle for ack/nack.
    pub id: Uuid,
    pub message: SerializedMessage,
    pub priority: i32,
    pub enqueued_at: DateTime<Utc>,
    /// Entry is not deliverable before this instant.
    pub visible_at: DateTime<Utc>,
    /// How many times the entry has been handed to a consumer.
    pub dequeue_count: u32,
}

/// Storage contract for durable queues.
///
/// `dequeue` hands an entry to exactly one consumer at a time: the entry
/// becomes invisible for `visibility_timeout` and reappears unless acked.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn enqueue(
        &self,
        queue: &str,
        message: SerializedMessage,
        options: EnqueueOptions,
    ) -> Result<Uuid>;

    /// Highest-priority visible entry (`priority desc, enqueued_at asc`),
    /// or `None` when the queue is empty.
    async fn dequeue(&self, queue: &str, visibility_timeout: Duration) -> Result<Option<QueueEntry>>;

    /// Remove a delivered entry permanently.
    async fn ack(&self, queue: &str, id: Uuid) -> Result<bool>;

    /// Return a delivered entry to the queue, optionally delayed.
    async fn nack(&self, queue: &str, id: Uuid, delay: Option<Duration>) -> Result<bool>;

    /// Visible + in-flight entry count.
    async fn depth(&self, queue: &str) -> Result<usize>;

    async fn queue_names(&self) -> Result<Vec<String>>;
}

/// Consumes messages handed over by a queue worker. The facade implements
/// this by decoding the payload and dispatching it.
#[async_trait]
pub trait QueueMessageHandler: Send + Sync {
    async fn handle(&self, message: &SerializedMessage) -> ProcessingResult;
}
