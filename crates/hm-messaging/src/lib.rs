//! HeroMessaging: an in-process messaging framework.
//!
//! Commands, queries and events dispatch through a composable decorator
//! pipeline (validation, metrics, idempotency, retry, transactions) with
//! reliable-delivery machinery around it: durable outbox publish, inbox
//! deduplication, future-time scheduling, retry/circuit-breaker policies, a
//! token-bucket rate limiter, a dead-letter store and a lock-free ring
//! buffer for high-throughput fan-out.
//!
//! ```no_run
//! use hm_messaging::{HeroMessaging, MessagingConfig};
//!
//! # async fn demo() {
//! let messaging = HeroMessaging::new(MessagingConfig::default());
//! // messaging.register_command::<CreateOrder, _>(handler);
//! messaging.start();
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod facade;
pub mod health;

pub use codec::CodecRegistry;
pub use config::{
    DispatcherSettings, IdempotencySettings, LoggingSettings, MessagingConfig, OutboxSettings,
    RetrySettings, SchedulerSettings,
};
pub use facade::{DeliverAt, HeroMessaging};
pub use health::{HealthReport, HealthStatus, MessagingMetrics};

// The public surface of the underlying crates, re-exported so hosts depend
// on one crate.
pub use hm_common::{
    correlation, logging, Command, CorrelationFrame, DynMessage, Envelope, ErrorKind, Event,
    InMemoryMessageStore, Message, MessageFilter, MessageKind, MessageStore, MessagingError,
    MetricsSink, NullMetricsSink, ProcessingContext, ProcessingError, ProcessingResult, Query,
    RuntimeMetricsSink, SerializedMessage,
};
pub use hm_idempotency::{
    DefaultKeyGenerator, IdempotencyKeyGenerator, IdempotencyPolicy, IdempotencyStore,
    InMemoryIdempotencyStore,
};
pub use hm_outbox::{
    InboxOptions, InboxOutcome, InboxStore, InMemoryInboxStore, InMemoryOutboxStore,
    InMemoryTransport, OutboxEntry, OutboxOptions, OutboxStatus, OutboxStore, Transport,
};
pub use hm_pipeline::{
    CommandHandler, DispatchError, DispatchResult, DispatcherConfig, EventHandler,
    IsolationLevel, MessageValidator, PublishOutcome, QueryHandler, UnitOfWork,
    UnitOfWorkFactory, ValidationOutcome,
};
pub use hm_policy::{
    CircuitBreaker, CircuitBreakerRetryPolicy, CircuitState, DeadLetterEntry, DeadLetterQueue,
    DeadLetterStatus, ExponentialBackoffPolicy, InMemoryDeadLetterQueue, LinearRetryPolicy,
    NoRetryPolicy, RateLimitBehavior, RateLimitDecision, RetryPolicy, TokenBucketLimiter,
    TokenBucketOptions,
};
pub use hm_queue::{ConsumerOptions, EnqueueOptions, InMemoryQueueStore, QueueStore};
pub use hm_ring::{
    BatchConsumer, BlockingWaitStrategy, BusySpinWaitStrategy, Ring, SequenceBarrier,
    SleepingWaitStrategy, TimeoutBlockingWaitStrategy, WaitStrategy, YieldingWaitStrategy,
};
pub use hm_saga::{InMemorySagaRepository, Saga, SagaError, SagaRepository};
pub use hm_scheduler::{
    InMemoryScheduledStorage, ScheduledEntry, ScheduledStatus, ScheduledStorage,
    SchedulingOptions,
};
pub use hm_security::{
    AesGcmEncryptor, Authenticator, Authorizer, ClaimsAuthorizer, EncryptedPayload,
    EncryptionError, HmacSigner, MessageEncryptor, MessageSigner, Principal, SecurityContext,
    Signature, StaticTokenAuthenticator,
};
pub use hm_version::{ConverterRegistry, MessageConverter, MessageVersion};
