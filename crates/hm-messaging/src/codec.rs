//! Codec registry: re-materialising persisted messages.
//!
//! Durable subsystems hold messages as [`SerializedMessage`]; the codec
//! registry maps a type token back to a decode function so the queue,
//! scheduler and inbox can hand a typed message to the dispatcher. Every
//! registered handler type gets a codec at registration time.

use dashmap::DashMap;
use hm_common::{DynMessage, Message, MessageKind, MessagingError, SerializedMessage};
use serde::de::DeserializeOwned;
use tracing::debug;

struct MessageCodec {
    kind: MessageKind,
    decode: Box<dyn Fn(&SerializedMessage) -> Result<DynMessage, MessagingError> + Send + Sync>,
}

#[derive(Default)]
pub struct CodecRegistry {
    codecs: DashMap<&'static str, MessageCodec>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<M: Message + DeserializeOwned>(&self, kind: MessageKind) {
        debug!(message_type = M::TYPE, kind = %kind, "registered message codec");
        self.codecs.insert(
            M::TYPE,
            MessageCodec {
                kind,
                decode: Box::new(move |serialized| {
                    let message: M = serde_json::from_value(serialized.payload.clone())?;
                    Ok(DynMessage::new(message, kind))
                }),
            },
        );
    }

    pub fn kind_of(&self, message_type: &str) -> Option<MessageKind> {
        self.codecs.get(message_type).map(|c| c.kind)
    }

    pub fn is_registered(&self, message_type: &str) -> bool {
        self.codecs.contains_key(message_type)
    }

    pub fn decode(&self, serialized: &SerializedMessage) -> Result<DynMessage, MessagingError> {
        let codec = self
            .codecs
            .get(serialized.message_type.as_str())
            .ok_or_else(|| {
                MessagingError::Config(format!(
                    "no codec registered for message type '{}'",
                    serialized.message_type
                ))
            })?;
        (codec.decode)(serialized)
    }
}
