//! Queue error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue '{0}' not found")]
    QueueNotFound(String),

    #[error("receipt '{0}' not found or already settled")]
    ReceiptNotFound(uuid::Uuid),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("queue worker stopped")]
    Stopped,
}
