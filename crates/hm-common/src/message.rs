//! Message model: envelope, capability traits, and the type-erased handle.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity and routing metadata carried by every message.
///
/// The `message_id` is assigned once at construction and never replaced;
/// correlation stamping copies every other field but keeps the id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub message_id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Envelope {
    pub fn new() -> Self {
        Self {
            message_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            correlation_id: None,
            causation_id: None,
            metadata: HashMap::new(),
        }
    }

    /// Envelope with a caller-chosen id (deduplication across submissions
    /// relies on the caller reusing the same id).
    pub fn with_id(message_id: Uuid) -> Self {
        Self {
            message_id,
            ..Self::new()
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

impl Default for Envelope {
    fn default() -> Self {
        Self::new()
    }
}

/// What a message is allowed to do; fixed at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    /// Imperative, single handler, no response.
    Command,
    /// Imperative, single handler, returns a value.
    CommandWithResponse,
    /// Read-only, single handler, always returns a value.
    Query,
    /// Broadcast, many handlers, no response.
    Event,
}

impl MessageKind {
    pub fn expects_response(&self) -> bool {
        matches!(self, MessageKind::CommandWithResponse | MessageKind::Query)
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Command => write!(f, "COMMAND"),
            MessageKind::CommandWithResponse => write!(f, "COMMAND_WITH_RESPONSE"),
            MessageKind::Query => write!(f, "QUERY"),
            MessageKind::Event => write!(f, "EVENT"),
        }
    }
}

/// Base trait for every message flowing through the framework.
///
/// `TYPE` is the stable type token used for handler lookup, persisted
/// payloads and metric labels. Keep it unique and deployment-stable
/// (a dotted name like `"orders.create"` works well).
pub trait Message: Send + Sync + 'static {
    const TYPE: &'static str;

    fn envelope(&self) -> &Envelope;
    fn envelope_mut(&mut self) -> &mut Envelope;
}

/// A state-changing message with exactly one handler.
///
/// `Response = ()` models a fire-and-forget command; anything else makes the
/// handler's return value flow back to the caller (and into the idempotency
/// cache, which is why responses must round-trip through serde).
pub trait Command: Message {
    type Response: Serialize + serde::de::DeserializeOwned + Send + 'static;
}

/// A read-only message with exactly one handler and a mandatory response.
/// Queries must be side-effect-free and idempotent.
pub trait Query: Message {
    type Response: Serialize + serde::de::DeserializeOwned + Send + 'static;
}

/// A broadcast message delivered to every registered handler.
pub trait Event: Message {
    /// Additional type tokens this event is published under. Handlers
    /// registered for an alias receive the event as well; the default is
    /// none.
    fn aliases() -> &'static [&'static str] {
        &[]
    }
}

/// Object-safe view over any [`Message`]; implemented blanket-wise.
pub trait AnyMessage: Send + Sync {
    fn envelope(&self) -> &Envelope;
    fn message_type(&self) -> &'static str;
    fn as_any(&self) -> &(dyn Any + Send + Sync);
}

impl<M: Message> AnyMessage for M {
    fn envelope(&self) -> &Envelope {
        Message::envelope(self)
    }

    fn message_type(&self) -> &'static str {
        M::TYPE
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}

/// Cheap type-erased message handle shared across pipeline stages.
#[derive(Clone)]
pub struct DynMessage {
    inner: Arc<dyn AnyMessage>,
    kind: MessageKind,
}

impl DynMessage {
    pub fn new<M: Message>(message: M, kind: MessageKind) -> Self {
        Self {
            inner: Arc::new(message),
            kind,
        }
    }

    pub fn from_arc(inner: Arc<dyn AnyMessage>, kind: MessageKind) -> Self {
        Self { inner, kind }
    }

    pub fn envelope(&self) -> &Envelope {
        self.inner.envelope()
    }

    pub fn message_id(&self) -> Uuid {
        self.inner.envelope().message_id
    }

    pub fn message_type(&self) -> &'static str {
        self.inner.message_type()
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn downcast_ref<M: Message>(&self) -> Option<&M> {
        self.inner.as_any().downcast_ref::<M>()
    }
}

impl std::fmt::Debug for DynMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynMessage")
            .field("message_type", &self.message_type())
            .field("message_id", &self.message_id())
            .field("kind", &self.kind)
            .finish()
    }
}

/// Persisted/wire form of a message: envelope fields plus the serde payload
/// of the concrete type. Durable subsystems (queue, outbox, scheduler) store
/// this and re-materialise through the codec registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedMessage {
    pub message_id: Uuid,
    pub message_type: String,
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
    pub payload: serde_json::Value,
}

impl SerializedMessage {
    /// Serialize a concrete message. The payload embeds the envelope so the
    /// decode side restores the exact same identity.
    pub fn encode<M: Message + Serialize>(
        message: &M,
        kind: MessageKind,
    ) -> Result<Self, serde_json::Error> {
        let envelope = Message::envelope(message).clone();
        Ok(Self {
            message_id: envelope.message_id,
            message_type: M::TYPE.to_string(),
            kind,
            timestamp: envelope.timestamp,
            correlation_id: envelope.correlation_id,
            causation_id: envelope.causation_id,
            metadata: envelope.metadata,
            payload: serde_json::to_value(message)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping {
        envelope: Envelope,
        text: String,
    }

    impl Message for Ping {
        const TYPE: &'static str = "test.ping";

        fn envelope(&self) -> &Envelope {
            &self.envelope
        }

        fn envelope_mut(&mut self) -> &mut Envelope {
            &mut self.envelope
        }
    }

    #[test]
    fn dyn_message_downcasts_to_concrete_type() {
        let ping = Ping {
            envelope: Envelope::new(),
            text: "hello".to_string(),
        };
        let id = Message::envelope(&ping).message_id;
        let dyn_msg = DynMessage::new(ping, MessageKind::Command);

        assert_eq!(dyn_msg.message_type(), "test.ping");
        assert_eq!(dyn_msg.message_id(), id);
        let back = dyn_msg.downcast_ref::<Ping>().unwrap();
        assert_eq!(back.text, "hello");
    }

    #[test]
    fn serialized_message_round_trips_payload() {
        let ping = Ping {
            envelope: Envelope::new(),
            text: "persist me".to_string(),
        };
        let wire = SerializedMessage::encode(&ping, MessageKind::Command).unwrap();
        assert_eq!(wire.message_type, "test.ping");
        assert_eq!(wire.message_id, Message::envelope(&ping).message_id);

        let decoded: Ping = serde_json::from_value(wire.payload).unwrap();
        assert_eq!(decoded.text, "persist me");
        assert_eq!(
            Message::envelope(&decoded).message_id,
            Message::envelope(&ping).message_id
        );
    }
}
