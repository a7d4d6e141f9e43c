//! Reliable delivery: durable outbox publish and deduplicated inbox receive.

pub mod inbox;
pub mod processor;
pub mod store;
pub mod transport;

pub use inbox::{
    InboxEntry, InboxOptions, InboxOutcome, InboxProcessor, InboxStore, InMemoryInboxStore,
};
pub use processor::{OutboxOptions, OutboxProcessor, OutboxProcessorConfig, OutboxPublisher};
pub use store::{
    InMemoryOutboxStore, OutboxEntry, OutboxError, OutboxStatus, OutboxStore,
};
pub use transport::{InMemoryTransport, Transport, TransportError};
