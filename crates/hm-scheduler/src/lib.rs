//! Future-time delivery.
//!
//! Messages are stored with a `deliver_at` instant; a background worker
//! polls for due entries, wins an atomic `Pending -> Delivering` transition
//! (safe under concurrent schedulers) and routes each message by its kind.

pub mod storage;
pub mod worker;

use thiserror::Error;

pub use storage::{
    InMemoryScheduledStorage, ScheduleQuery, ScheduledEntry, ScheduledStatus, ScheduledStorage,
};
pub use worker::{SchedulerConfig, SchedulerWorker, SchedulingOptions};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("schedule '{0}' not found")]
    NotFound(uuid::Uuid),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
