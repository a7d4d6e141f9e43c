//! Message store contract.
//!
//! The narrow persistence surface the core consumes from storage adapters:
//! store/retrieve/query/delete over serialized messages plus a transaction
//! handle. Concrete database adapters implement this elsewhere; the
//! in-memory implementation backs tests and embedded use.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::MessagingError;
use crate::message::{MessageKind, SerializedMessage};

/// Filter for [`MessageStore::query`].
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub message_type: Option<String>,
    pub kind: Option<MessageKind>,
    pub correlation_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// A unit-of-work handle over the store. Dropping without commit rolls back.
#[async_trait]
pub trait StoreTransaction: Send + Sync {
    async fn commit(self: Box<Self>) -> Result<(), MessagingError>;
    async fn rollback(self: Box<Self>) -> Result<(), MessagingError>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn store(
        &self,
        message: &SerializedMessage,
        tx: Option<&dyn StoreTransaction>,
    ) -> Result<(), MessagingError>;

    async fn retrieve(&self, id: Uuid) -> Result<Option<SerializedMessage>, MessagingError>;

    async fn query(&self, filter: MessageFilter) -> Result<Vec<SerializedMessage>, MessagingError>;

    async fn delete(&self, id: Uuid) -> Result<bool, MessagingError>;

    async fn begin_transaction(&self) -> Result<Box<dyn StoreTransaction>, MessagingError>;
}

/// In-memory message store.
#[derive(Default)]
pub struct InMemoryMessageStore {
    messages: Arc<DashMap<Uuid, SerializedMessage>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

struct NoopTransaction;

#[async_trait]
impl StoreTransaction for NoopTransaction {
    async fn commit(self: Box<Self>) -> Result<(), MessagingError> {
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), MessagingError> {
        Ok(())
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn store(
        &self,
        message: &SerializedMessage,
        _tx: Option<&dyn StoreTransaction>,
    ) -> Result<(), MessagingError> {
        self.messages.insert(message.message_id, message.clone());
        Ok(())
    }

    async fn retrieve(&self, id: Uuid) -> Result<Option<SerializedMessage>, MessagingError> {
        Ok(self.messages.get(&id).map(|entry| entry.clone()))
    }

    async fn query(&self, filter: MessageFilter) -> Result<Vec<SerializedMessage>, MessagingError> {
        let mut matches: Vec<SerializedMessage> = self
            .messages
            .iter()
            .filter(|entry| {
                let msg = entry.value();
                filter
                    .message_type
                    .as_ref()
                    .map_or(true, |t| &msg.message_type == t)
                    && filter.kind.map_or(true, |k| msg.kind == k)
                    && filter
                        .correlation_id
                        .as_ref()
                        .map_or(true, |c| msg.correlation_id.as_ref() == Some(c))
                    && filter.since.map_or(true, |s| msg.timestamp >= s)
            })
            .map(|entry| entry.clone())
            .collect();

        matches.sort_by_key(|m| m.timestamp);
        if let Some(limit) = filter.limit {
            matches.truncate(limit);
        }
        Ok(matches)
    }

    async fn delete(&self, id: Uuid) -> Result<bool, MessagingError> {
        Ok(self.messages.remove(&id).is_some())
    }

    async fn begin_transaction(&self) -> Result<Box<dyn StoreTransaction>, MessagingError> {
        Ok(Box::new(NoopTransaction))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;

    fn sample(message_type: &str, correlation: Option<&str>) -> SerializedMessage {
        SerializedMessage {
            message_id: Uuid::new_v4(),
            message_type: message_type.to_string(),
            kind: MessageKind::Event,
            timestamp: Utc::now(),
            correlation_id: correlation.map(String::from),
            causation_id: None,
            metadata: Default::default(),
            payload: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn store_and_retrieve_round_trip() {
        let store = InMemoryMessageStore::new();
        let msg = sample("orders.created", None);
        store.store(&msg, None).await.unwrap();

        let found = store.retrieve(msg.message_id).await.unwrap().unwrap();
        assert_eq!(found.message_type, "orders.created");
        assert!(store.delete(msg.message_id).await.unwrap());
        assert!(store.retrieve(msg.message_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn query_filters_by_correlation() {
        let store = InMemoryMessageStore::new();
        store.store(&sample("a", Some("wf-1")), None).await.unwrap();
        store.store(&sample("b", Some("wf-2")), None).await.unwrap();
        store.store(&sample("c", Some("wf-1")), None).await.unwrap();

        let found = store
            .query(MessageFilter {
                correlation_id: Some("wf-1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
    }
}
