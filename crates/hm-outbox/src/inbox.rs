//! Inbox: deduplicated receive with transactional handoff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hm_common::{MessagingError, ProcessingResult, SerializedMessage};
use hm_pipeline::{IsolationLevel, UnitOfWorkFactory};
use hm_queue::QueueMessageHandler;
use tracing::{debug, warn};
use uuid::Uuid;

/// Options for a deduplicated receive.
#[derive(Debug, Clone)]
pub struct InboxOptions {
    /// Where the message came from (broker, peer service).
    pub source: Option<String>,
    /// Record the message id and skip duplicates. Turning this off bypasses
    /// the dedup insert entirely (at-least-once handoff).
    pub require_idempotency: bool,
    /// Entries older than this stop participating in deduplication; `None`
    /// keeps them until an explicit cleanup.
    pub deduplication_window: Option<Duration>,
}

impl Default for InboxOptions {
    fn default() -> Self {
        Self {
            source: None,
            require_idempotency: true,
            deduplication_window: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InboxEntry {
    pub id: Uuid,
    /// The external message id; the unique constraint that powers dedup.
    pub message_id: Uuid,
    pub payload: SerializedMessage,
    pub source: Option<String>,
    pub processed_at: DateTime<Utc>,
}

/// Storage contract: `try_add` is the dedup primitive, backed by a unique
/// constraint on the external message id.
#[async_trait]
pub trait InboxStore: Send + Sync {
    /// Insert; `false` means the message id was already recorded.
    async fn try_add(&self, entry: InboxEntry) -> Result<bool, MessagingError>;

    /// Compensating removal when the transactional handoff fails.
    async fn remove(&self, message_id: Uuid) -> Result<bool, MessagingError>;

    /// Drop entries older than `older_than`, returning how many went.
    async fn cleanup(&self, older_than: DateTime<Utc>) -> Result<usize, MessagingError>;

    async fn len(&self) -> usize;
}

/// In-memory inbox store.
#[derive(Default)]
pub struct InMemoryInboxStore {
    entries: DashMap<Uuid, InboxEntry>,
}

impl InMemoryInboxStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InboxStore for InMemoryInboxStore {
    async fn try_add(&self, entry: InboxEntry) -> Result<bool, MessagingError> {
        match self.entries.entry(entry.message_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(true)
            }
        }
    }

    async fn remove(&self, message_id: Uuid) -> Result<bool, MessagingError> {
        Ok(self.entries.remove(&message_id).is_some())
    }

    async fn cleanup(&self, older_than: DateTime<Utc>) -> Result<usize, MessagingError> {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.processed_at >= older_than);
        Ok(before - self.entries.len())
    }

    async fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Outcome of a deduplicated receive.
#[derive(Debug)]
pub enum InboxOutcome {
    /// First occurrence: the handler ran with this result.
    Processed(ProcessingResult),
    /// The message id was seen before; processing skipped.
    Duplicate,
}

impl InboxOutcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, InboxOutcome::Duplicate)
    }
}

/// Receives external messages exactly once: the dedup insert and the
/// downstream dispatch share one unit of work, so a failed dispatch leaves
/// no inbox record behind and redelivery retries cleanly.
pub struct InboxProcessor {
    store: Arc<dyn InboxStore>,
    handler: Arc<dyn QueueMessageHandler>,
    uow_factory: Arc<dyn UnitOfWorkFactory>,
}

impl InboxProcessor {
    pub fn new(
        store: Arc<dyn InboxStore>,
        handler: Arc<dyn QueueMessageHandler>,
        uow_factory: Arc<dyn UnitOfWorkFactory>,
    ) -> Self {
        Self {
            store,
            handler,
            uow_factory,
        }
    }

    pub async fn process_incoming(
        &self,
        message: SerializedMessage,
        options: InboxOptions,
    ) -> Result<InboxOutcome, MessagingError> {
        let message_id = message.message_id;
        let uow = self
            .uow_factory
            .begin(IsolationLevel::ReadCommitted)
            .await
            .map_err(MessagingError::Processing)?;

        if options.require_idempotency {
            if let Some(window) = options.deduplication_window {
                // Age out old dedup records before the uniqueness check so
                // the window bounds how long a message id blocks redelivery.
                let cutoff =
                    Utc::now() - chrono::Duration::from_std(window).unwrap_or_default();
                let _ = self.store.cleanup(cutoff).await;
            }

            let entry = InboxEntry {
                id: Uuid::new_v4(),
                message_id,
                payload: message.clone(),
                source: options.source.clone(),
                processed_at: Utc::now(),
            };

            if !self.store.try_add(entry).await? {
                debug!(message_id = %message_id, "duplicate message skipped");
                let _ = uow.rollback().await;
                return Ok(InboxOutcome::Duplicate);
            }
        }

        let result = self.handler.handle(&message).await;

        match &result {
            ProcessingResult::Success { .. } => {
                uow.commit().await.map_err(MessagingError::Processing)?;
            }
            ProcessingResult::Failure { error } => {
                warn!(
                    message_id = %message_id,
                    kind = %error.kind,
                    reason = %error.message,
                    "inbox handoff failed, rolling back dedup record"
                );
                let _ = uow.rollback().await;
                // The in-memory store is not transactional; compensate so a
                // redelivery can run the handler again.
                if options.require_idempotency {
                    let _ = self.store.remove(message_id).await;
                }
            }
        }

        Ok(InboxOutcome::Processed(result))
    }

    /// Drop dedup records that aged out of the window.
    pub async fn cleanup(&self, window: Duration) -> Result<usize, MessagingError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(window).unwrap_or_default();
        self.store.cleanup(cutoff).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hm_common::{ErrorKind, MessageKind};
    use hm_pipeline::NoopUnitOfWorkFactory;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingHandler {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl QueueMessageHandler for CountingHandler {
        async fn handle(&self, _message: &SerializedMessage) -> ProcessingResult {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_first {
                ProcessingResult::failed(ErrorKind::TransientIo, "downstream unavailable")
            } else {
                ProcessingResult::success()
            }
        }
    }

    fn message_with_id(id: Uuid) -> SerializedMessage {
        SerializedMessage {
            message_id: id,
            message_type: "payments.received".to_string(),
            kind: MessageKind::Event,
            timestamp: Utc::now(),
            correlation_id: None,
            causation_id: None,
            metadata: Default::default(),
            payload: serde_json::json!({}),
        }
    }

    fn processor(fail_first: u32) -> (InboxProcessor, Arc<CountingHandler>, Arc<InMemoryInboxStore>) {
        let store = Arc::new(InMemoryInboxStore::new());
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail_first,
        });
        let processor = InboxProcessor::new(
            Arc::clone(&store) as Arc<dyn InboxStore>,
            Arc::clone(&handler) as Arc<dyn QueueMessageHandler>,
            Arc::new(NoopUnitOfWorkFactory),
        );
        (processor, handler, store)
    }

    #[tokio::test]
    async fn duplicate_message_invokes_handler_once() {
        let (processor, handler, _) = processor(0);
        let id = Uuid::new_v4();

        let first = processor
            .process_incoming(message_with_id(id), InboxOptions::default())
            .await
            .unwrap();
        let second = processor
            .process_incoming(message_with_id(id), InboxOptions::default())
            .await
            .unwrap();

        assert!(matches!(first, InboxOutcome::Processed(_)));
        assert!(second.is_duplicate());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_handoff_allows_redelivery() {
        let (processor, handler, store) = processor(1);
        let id = Uuid::new_v4();

        let first = processor
            .process_incoming(message_with_id(id), InboxOptions::default())
            .await
            .unwrap();
        match first {
            InboxOutcome::Processed(result) => assert!(!result.is_success()),
            InboxOutcome::Duplicate => panic!("first receive cannot be a duplicate"),
        }
        assert_eq!(store.len().await, 0);

        // Redelivery is a fresh first occurrence.
        let second = processor
            .process_incoming(message_with_id(id), InboxOptions::default())
            .await
            .unwrap();
        assert!(matches!(second, InboxOutcome::Processed(ProcessingResult::Success { .. })));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn opting_out_of_idempotency_delivers_every_receive() {
        let (processor, handler, store) = processor(0);
        let id = Uuid::new_v4();
        let options = InboxOptions {
            require_idempotency: false,
            ..Default::default()
        };

        processor
            .process_incoming(message_with_id(id), options.clone())
            .await
            .unwrap();
        processor
            .process_incoming(message_with_id(id), options)
            .await
            .unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn cleanup_respects_window() {
        let (processor, _, store) = processor(0);
        processor
            .process_incoming(message_with_id(Uuid::new_v4()), InboxOptions::default())
            .await
            .unwrap();
        assert_eq!(store.len().await, 1);

        // Everything is newer than a 1h window.
        assert_eq!(processor.cleanup(Duration::from_secs(3600)).await.unwrap(), 0);
        // A zero window drops everything.
        assert_eq!(processor.cleanup(Duration::ZERO).await.unwrap(), 1);
        assert_eq!(store.len().await, 0);
    }
}
