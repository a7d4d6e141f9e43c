//! Message pipeline and dispatcher.
//!
//! A dispatch traverses a list of decorator stages, outside-in:
//! validation → metrics → idempotency → retry → transaction → handler.
//! The dispatcher routes commands and queries to their single handler and
//! fans events out to every subscriber, each through its own chain.

pub mod dispatcher;
pub mod handler;
pub mod idempotency;
pub mod metrics;
pub mod processor;
pub mod retry;
pub mod transaction;
pub mod validation;

pub use dispatcher::{
    DispatchError, DispatchResult, Dispatcher, DispatcherConfig, DispatcherStats, PublishOutcome,
};
pub use handler::{
    CommandHandler, ErasedHandler, EventHandler, HandlerRegistry, HandlerTerminal, QueryHandler,
};
pub use idempotency::IdempotencyDecorator;
pub use metrics::MetricsDecorator;
pub use processor::{MessageProcessor, Pipeline, PipelineBuilder};
pub use retry::RetryDecorator;
pub use transaction::{
    ActiveUnitOfWork, IsolationLevel, NoopUnitOfWorkFactory, RecordingUnitOfWorkFactory,
    TransactionDecorator, UnitOfWork, UnitOfWorkFactory,
};
pub use validation::{MessageValidator, ValidationDecorator, ValidationOutcome};
