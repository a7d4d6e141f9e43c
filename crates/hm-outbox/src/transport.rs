//! Broker transport contract.

use async_trait::async_trait;
use hm_common::SerializedMessage;
use hm_queue::{ConsumerOptions, QueueMessageHandler};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("publish rejected: {0}")]
    Rejected(String),

    #[error("consume not supported: {0}")]
    ConsumeUnsupported(String),
}

/// What the core consumes from a broker adapter.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(
        &self,
        destination: &str,
        message: &SerializedMessage,
    ) -> Result<(), TransportError>;

    /// Attach a consumer to `queue`. Implementations deliver each received
    /// message to `handler` and ack/nack per its result and the options.
    async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn QueueMessageHandler>,
        options: ConsumerOptions,
    ) -> Result<(), TransportError>;
}

/// Records published messages; can be scripted to fail the first N
/// publishes. For embedded use and tests.
#[derive(Default)]
pub struct InMemoryTransport {
    published: Mutex<Vec<(String, SerializedMessage)>>,
    fail_next: AtomicU32,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` publish calls with a connection error.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<(String, SerializedMessage)> {
        self.published.lock().clone()
    }

    pub fn published_count(&self) -> usize {
        self.published.lock().len()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn publish(
        &self,
        destination: &str,
        message: &SerializedMessage,
    ) -> Result<(), TransportError> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0
            && self
                .fail_next
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(TransportError::Connection("scripted failure".to_string()));
        }
        self.published
            .lock()
            .push((destination.to_string(), message.clone()));
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _handler: Arc<dyn QueueMessageHandler>,
        _options: ConsumerOptions,
    ) -> Result<(), TransportError> {
        Err(TransportError::ConsumeUnsupported(queue.to_string()))
    }
}
