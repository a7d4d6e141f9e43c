//! Core message model and shared types for HeroMessaging.
//!
//! Everything the other crates agree on lives here: the message traits and
//! their type-erased form, the per-dispatch processing context and result,
//! the classified error taxonomy, correlation propagation, the message store
//! contract, logging bootstrap, and the metrics sink.

pub mod correlation;
pub mod error;
pub mod logging;
pub mod message;
pub mod metrics;
pub mod processing;
pub mod store;

pub use correlation::{with_correlation, with_correlation_ids, CorrelationFrame};
pub use error::{ErrorKind, MessagingError, ProcessingError};
pub use message::{
    AnyMessage, Command, DynMessage, Envelope, Event, Message, MessageKind, Query,
    SerializedMessage,
};
pub use metrics::{MetricsSink, NullMetricsSink, RuntimeMetricsSink};
pub use processing::{ProcessingContext, ProcessingResult};
pub use store::{InMemoryMessageStore, MessageFilter, MessageStore, StoreTransaction};

pub type Result<T> = std::result::Result<T, MessagingError>;
