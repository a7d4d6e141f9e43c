//! The HeroMessaging facade: one entry point wiring dispatch, reliable
//! delivery, scheduling and observability together.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hm_common::{
    Command, ErrorKind, Event, Message, MessageKind, MessagingError, MetricsSink, ProcessingError,
    ProcessingResult, Query, RuntimeMetricsSink, SerializedMessage,
};
use hm_idempotency::{IdempotencyPolicy, IdempotencyStore, InMemoryIdempotencyStore};
use hm_outbox::{
    InboxOptions, InboxOutcome, InboxProcessor, InboxStore, InMemoryInboxStore,
    InMemoryOutboxStore, InMemoryTransport, OutboxOptions, OutboxProcessor, OutboxPublisher,
    OutboxStatus, OutboxStore, Transport,
};
use hm_pipeline::{
    CommandHandler, DispatchError, DispatchResult, Dispatcher, EventHandler, HandlerRegistry,
    IdempotencyDecorator, MessageValidator, MetricsDecorator, NoopUnitOfWorkFactory, Pipeline,
    PublishOutcome, QueryHandler, RetryDecorator, TransactionDecorator, UnitOfWorkFactory,
    ValidationDecorator,
};
use hm_policy::{
    DeadLetterQueue, ExponentialBackoffPolicy, InMemoryDeadLetterQueue, RateLimitDecision,
    RetryPolicy, TokenBucketLimiter, TokenBucketOptions,
};
use hm_queue::{
    ConsumerOptions, EnqueueOptions, InMemoryQueueStore, QueueMessageHandler, QueueStore,
    QueueWorker,
};
use hm_scheduler::{
    InMemoryScheduledStorage, ScheduleQuery, ScheduledStatus, ScheduledStorage, SchedulerWorker,
    SchedulingOptions,
};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::codec::CodecRegistry;
use crate::config::MessagingConfig;
use crate::health::{HealthReport, HealthStatus, MessagingMetrics};

/// When a scheduled message should fire.
#[derive(Debug, Clone, Copy)]
pub enum DeliverAt {
    In(Duration),
    At(DateTime<Utc>),
}

impl DeliverAt {
    fn resolve(self) -> DateTime<Utc> {
        match self {
            DeliverAt::In(delay) => {
                Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default()
            }
            DeliverAt::At(at) => at,
        }
    }
}

/// Bridges persisted messages back into the dispatcher.
struct DispatchHandler {
    codecs: Arc<CodecRegistry>,
    dispatcher: Arc<Dispatcher>,
}

#[async_trait]
impl QueueMessageHandler for DispatchHandler {
    async fn handle(&self, message: &SerializedMessage) -> ProcessingResult {
        match self.codecs.decode(message) {
            Ok(decoded) => self.dispatcher.dispatch_dyn(decoded, Some(message)).await,
            Err(e) => ProcessingResult::failure(ProcessingError::new(
                ErrorKind::Format,
                format!("failed to decode persisted message: {e}"),
            )),
        }
    }
}

struct Workers {
    dispatcher: Arc<Dispatcher>,
    dispatch_handler: Arc<DispatchHandler>,
    outbox_processor: Arc<OutboxProcessor>,
    scheduler: Arc<SchedulerWorker>,
    inbox_processor: Arc<InboxProcessor>,
}

/// The messaging facade.
///
/// Register handlers, then `start()` the background workers. Collaborators
/// (stores, transport, unit-of-work factory, metrics sink) default to the
/// in-memory implementations and can be swapped with the `with_*` methods
/// before the first dispatch.
pub struct HeroMessaging {
    config: MessagingConfig,
    registry: Arc<HandlerRegistry>,
    codecs: Arc<CodecRegistry>,
    validators: parking_lot::Mutex<Vec<Arc<dyn MessageValidator>>>,
    metrics_sink: Arc<dyn MetricsSink>,
    idempotency_store: Arc<dyn IdempotencyStore>,
    dead_letters: Arc<dyn DeadLetterQueue>,
    uow_factory: Arc<dyn UnitOfWorkFactory>,
    retry_policy: Arc<dyn RetryPolicy>,
    rate_limiter: Option<Arc<TokenBucketLimiter>>,
    queue_store: Arc<dyn QueueStore>,
    outbox_store: Arc<dyn OutboxStore>,
    inbox_store: Arc<dyn InboxStore>,
    scheduled_storage: Arc<dyn ScheduledStorage>,
    transport: Arc<dyn Transport>,
    workers: RwLock<Option<Arc<Workers>>>,
    queue_workers: DashMap<String, Arc<QueueWorker>>,
    started: AtomicBool,
}

impl HeroMessaging {
    pub fn new(config: MessagingConfig) -> Self {
        let retry = &config.retry;
        let retry_policy: Arc<dyn RetryPolicy> = Arc::new(ExponentialBackoffPolicy::new(
            retry.max_retries,
            Duration::from_millis(retry.base_delay_ms),
            Duration::from_millis(retry.max_delay_ms),
        ));
        Self {
            config,
            registry: Arc::new(HandlerRegistry::new()),
            codecs: Arc::new(CodecRegistry::new()),
            validators: parking_lot::Mutex::new(Vec::new()),
            metrics_sink: Arc::new(RuntimeMetricsSink),
            idempotency_store: Arc::new(InMemoryIdempotencyStore::new()),
            dead_letters: Arc::new(InMemoryDeadLetterQueue::new()),
            uow_factory: Arc::new(NoopUnitOfWorkFactory),
            retry_policy,
            rate_limiter: None,
            queue_store: Arc::new(InMemoryQueueStore::new()),
            outbox_store: Arc::new(InMemoryOutboxStore::new()),
            inbox_store: Arc::new(InMemoryInboxStore::new()),
            scheduled_storage: Arc::new(InMemoryScheduledStorage::new()),
            transport: Arc::new(InMemoryTransport::new()),
            workers: RwLock::new(None),
            queue_workers: DashMap::new(),
            started: AtomicBool::new(false),
        }
    }

    // ------------------------------------------------------------------
    // Collaborator wiring (before the first dispatch)
    // ------------------------------------------------------------------

    pub fn with_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics_sink = sink;
        self
    }

    pub fn with_idempotency_store(mut self, store: Arc<dyn IdempotencyStore>) -> Self {
        self.idempotency_store = store;
        self
    }

    pub fn with_dead_letter_queue(mut self, dlq: Arc<dyn DeadLetterQueue>) -> Self {
        self.dead_letters = dlq;
        self
    }

    pub fn with_unit_of_work_factory(mut self, factory: Arc<dyn UnitOfWorkFactory>) -> Self {
        self.uow_factory = factory;
        self
    }

    pub fn with_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_rate_limiter(mut self, options: TokenBucketOptions) -> Self {
        self.rate_limiter = Some(Arc::new(TokenBucketLimiter::new(options)));
        self
    }

    pub fn with_queue_store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.queue_store = store;
        self
    }

    pub fn with_outbox_store(mut self, store: Arc<dyn OutboxStore>) -> Self {
        self.outbox_store = store;
        self
    }

    pub fn with_inbox_store(mut self, store: Arc<dyn InboxStore>) -> Self {
        self.inbox_store = store;
        self
    }

    pub fn with_scheduled_storage(mut self, storage: Arc<dyn ScheduledStorage>) -> Self {
        self.scheduled_storage = storage;
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    pub fn register_command<C, H>(&self, handler: H)
    where
        C: Command + Serialize + DeserializeOwned,
        H: CommandHandler<C> + 'static,
    {
        let kind = if std::any::TypeId::of::<C::Response>() == std::any::TypeId::of::<()>() {
            MessageKind::Command
        } else {
            MessageKind::CommandWithResponse
        };
        self.registry.register_command::<C, H>(handler);
        self.codecs.register::<C>(kind);
    }

    pub fn register_query<Q, H>(&self, handler: H)
    where
        Q: Query + Serialize + DeserializeOwned,
        H: QueryHandler<Q> + 'static,
    {
        self.registry.register_query::<Q, H>(handler);
        self.codecs.register::<Q>(MessageKind::Query);
    }

    pub fn subscribe<E, H>(&self, handler: H)
    where
        E: Event + Serialize + DeserializeOwned,
        H: EventHandler<E> + 'static,
    {
        self.registry.register_event::<E, H>(handler);
        self.codecs.register::<E>(MessageKind::Event);
    }

    /// Subscribe a handler under one of the event's alias tokens.
    pub fn subscribe_under<E, H>(&self, token: &'static str, handler: H)
    where
        E: Event + Serialize + DeserializeOwned,
        H: EventHandler<E> + 'static,
    {
        self.registry.register_event_under::<E, H>(token, handler);
        self.codecs.register::<E>(MessageKind::Event);
    }

    pub fn register_validator(&self, validator: Arc<dyn MessageValidator>) {
        self.validators.lock().push(validator);
    }

    // ------------------------------------------------------------------
    // Assembly
    // ------------------------------------------------------------------

    fn build_pipeline(&self) -> Pipeline {
        let mut builder = Pipeline::builder();

        let validators = Arc::new(self.validators.lock().clone());
        if !validators.is_empty() {
            builder = builder.layer(move |inner| {
                Arc::new(ValidationDecorator::new(inner, Arc::clone(&validators)))
            });
        }

        let sink = Arc::clone(&self.metrics_sink);
        builder = builder.layer(move |inner| Arc::new(MetricsDecorator::new(inner, Arc::clone(&sink))));

        if self.config.idempotency.enabled {
            let policy = IdempotencyPolicy::new()
                .with_success_ttl(Duration::from_secs(self.config.idempotency.success_ttl_secs))
                .with_failure_ttl(Duration::from_secs(self.config.idempotency.failure_ttl_secs))
                .with_cache_failures(self.config.idempotency.cache_failures);
            let store = Arc::clone(&self.idempotency_store);
            builder = builder.layer(move |inner| {
                Arc::new(IdempotencyDecorator::new(
                    inner,
                    policy.clone(),
                    Arc::clone(&store),
                ))
            });
        }

        if self.config.retry.enabled {
            let policy = Arc::clone(&self.retry_policy);
            builder = builder
                .layer(move |inner| Arc::new(RetryDecorator::new(inner, Arc::clone(&policy))));
        }

        let factory = Arc::clone(&self.uow_factory);
        builder = builder
            .layer(move |inner| Arc::new(TransactionDecorator::new(inner, Arc::clone(&factory))));

        builder.build()
    }

    /// Build (once) the dispatcher and background workers. Handler and
    /// validator registration must happen before the first dispatch.
    fn ensure_workers(&self) -> Arc<Workers> {
        if let Some(workers) = self.workers.read().as_ref() {
            return Arc::clone(workers);
        }

        let mut slot = self.workers.write();
        if let Some(workers) = slot.as_ref() {
            return Arc::clone(workers);
        }

        let pipeline = self.build_pipeline();
        let dispatcher = Arc::new(
            Dispatcher::new(
                Arc::clone(&self.registry),
                pipeline,
                self.config.dispatcher_config(),
            )
            .with_dead_letter_queue(Arc::clone(&self.dead_letters)),
        );

        let dispatch_handler = Arc::new(DispatchHandler {
            codecs: Arc::clone(&self.codecs),
            dispatcher: Arc::clone(&dispatcher),
        });

        let outbox_processor = Arc::new(
            OutboxProcessor::new(
                self.config.outbox_config(),
                Arc::clone(&self.outbox_store),
                Arc::clone(&self.transport),
            )
            .with_retry_policy(Arc::clone(&self.retry_policy))
            .with_dead_letter_queue(Arc::clone(&self.dead_letters)),
        );

        let scheduler = Arc::new(
            SchedulerWorker::new(
                self.config.scheduler_config(),
                Arc::clone(&self.scheduled_storage),
                Arc::clone(&dispatch_handler) as Arc<dyn QueueMessageHandler>,
            )
            .with_queue_store(Arc::clone(&self.queue_store)),
        );

        let inbox_processor = Arc::new(InboxProcessor::new(
            Arc::clone(&self.inbox_store),
            Arc::clone(&dispatch_handler) as Arc<dyn QueueMessageHandler>,
            Arc::clone(&self.uow_factory),
        ));

        let workers = Arc::new(Workers {
            dispatcher,
            dispatch_handler,
            outbox_processor,
            scheduler,
            inbox_processor,
        });
        *slot = Some(Arc::clone(&workers));
        workers
    }

    /// Start the background workers (outbox delivery, scheduler ticks).
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let workers = self.ensure_workers();
        workers.outbox_processor.start();
        workers.scheduler.start();
        info!("messaging facade started");
    }

    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        let workers = self.ensure_workers();
        workers.outbox_processor.stop().await;
        workers.scheduler.stop().await;
        let queue_workers: Vec<_> = self
            .queue_workers
            .iter()
            .map(|w| Arc::clone(&w))
            .collect();
        for worker in queue_workers {
            worker.stop().await;
        }
        info!("messaging facade stopped");
    }

    async fn check_rate_limit(&self) -> DispatchResult<()> {
        let Some(limiter) = &self.rate_limiter else {
            return Ok(());
        };
        match limiter.acquire(None, 1).await {
            RateLimitDecision::Allowed { .. } => Ok(()),
            RateLimitDecision::Throttled { retry_after } => {
                Err(DispatchError::Failed(ProcessingError::new(
                    ErrorKind::RateLimited,
                    format!("rate limited, retry after {}ms", retry_after.as_millis()),
                )))
            }
        }
    }

    // ------------------------------------------------------------------
    // Dispatch operations
    // ------------------------------------------------------------------

    pub async fn send<C>(&self, command: C) -> DispatchResult<C::Response>
    where
        C: Command + Serialize + DeserializeOwned,
    {
        self.check_rate_limit().await?;
        self.ensure_workers().dispatcher.send(command).await
    }

    pub async fn send_query<Q>(&self, query: Q) -> DispatchResult<Q::Response>
    where
        Q: Query + Serialize + DeserializeOwned,
    {
        self.check_rate_limit().await?;
        self.ensure_workers().dispatcher.send_query(query).await
    }

    pub async fn publish<E>(&self, event: E) -> DispatchResult<PublishOutcome>
    where
        E: Event + Serialize + DeserializeOwned,
    {
        self.check_rate_limit().await?;
        self.ensure_workers().dispatcher.publish(event).await
    }

    // ------------------------------------------------------------------
    // Durable operations
    // ------------------------------------------------------------------

    fn encode_registered<M: Message + Serialize>(
        &self,
        message: &M,
    ) -> Result<SerializedMessage, MessagingError> {
        let kind = self.codecs.kind_of(M::TYPE).ok_or_else(|| {
            MessagingError::Config(format!(
                "message type '{}' has no registered handler/codec",
                M::TYPE
            ))
        })?;
        Ok(SerializedMessage::encode(message, kind)?)
    }

    /// Durable enqueue for later consumption by a queue worker.
    pub async fn enqueue<M: Message + Serialize>(
        &self,
        message: &M,
        queue: &str,
        options: EnqueueOptions,
    ) -> Result<Uuid, MessagingError> {
        let serialized = self.encode_registered(message)?;
        self.queue_store
            .enqueue(queue, serialized, options)
            .await
            .map_err(|e| MessagingError::Storage(e.to_string()))
    }

    /// Start (or resume) the consumer worker for `queue`.
    pub fn start_queue(&self, queue: &str, options: ConsumerOptions) {
        let workers = self.ensure_workers();
        let start_immediately = options.start_immediately;
        let worker = self
            .queue_workers
            .entry(queue.to_string())
            .or_insert_with(|| {
                Arc::new(
                    QueueWorker::new(
                        queue,
                        Arc::clone(&self.queue_store),
                        Arc::clone(&workers.dispatch_handler) as Arc<dyn QueueMessageHandler>,
                        options,
                    )
                    .with_dead_letter_queue(Arc::clone(&self.dead_letters)),
                )
            })
            .clone();
        if start_immediately {
            worker.start();
        }
    }

    pub async fn stop_queue(&self, queue: &str) {
        if let Some(worker) = self.queue_workers.get(queue).map(|w| Arc::clone(&w)) {
            worker.stop().await;
        }
    }

    /// Durable publish through the outbox; the entry is delivered by the
    /// background worker via the transport.
    pub async fn publish_to_outbox<M: Message + Serialize>(
        &self,
        message: &M,
        options: OutboxOptions,
    ) -> Result<Uuid, MessagingError> {
        let serialized = self.encode_registered(message)?;
        OutboxPublisher::new(Arc::clone(&self.outbox_store))
            .publish_serialized(serialized, options)
            .await
    }

    /// Deduplicated receive: at most one successful handler invocation per
    /// external message id.
    pub async fn process_incoming<M: Message + Serialize>(
        &self,
        message: &M,
        options: InboxOptions,
    ) -> Result<InboxOutcome, MessagingError> {
        let serialized = self.encode_registered(message)?;
        self.process_incoming_serialized(serialized, options).await
    }

    pub async fn process_incoming_serialized(
        &self,
        message: SerializedMessage,
        options: InboxOptions,
    ) -> Result<InboxOutcome, MessagingError> {
        self.ensure_workers()
            .inbox_processor
            .process_incoming(message, options)
            .await
    }

    /// Schedule a message for future delivery. Returns the schedule id.
    pub async fn schedule<M: Message + Serialize>(
        &self,
        message: &M,
        deliver_at: DeliverAt,
        options: SchedulingOptions,
    ) -> Result<Uuid, MessagingError> {
        let serialized = self.encode_registered(message)?;
        self.ensure_workers()
            .scheduler
            .schedule(serialized, deliver_at.resolve(), options)
            .await
            .map_err(|e| MessagingError::Storage(e.to_string()))
    }

    /// Cancel a pending schedule; `false` once delivery started or the
    /// schedule is unknown.
    pub async fn cancel_schedule(&self, schedule_id: Uuid) -> Result<bool, MessagingError> {
        self.ensure_workers()
            .scheduler
            .cancel(schedule_id)
            .await
            .map_err(|e| MessagingError::Storage(e.to_string()))
    }

    // ------------------------------------------------------------------
    // Observability
    // ------------------------------------------------------------------

    pub async fn metrics(&self) -> MessagingMetrics {
        let workers = self.ensure_workers();
        let outbox = workers.outbox_processor.metrics();
        let scheduler = workers.scheduler.metrics();
        let (mut queue_acked, mut queue_nacked) = (0, 0);
        for worker in self.queue_workers.iter() {
            let stats = worker.stats();
            queue_acked += stats.acked;
            queue_nacked += stats.nacked;
        }
        MessagingMetrics {
            dispatcher: workers.dispatcher.stats(),
            outbox_published: outbox.published,
            outbox_retried: outbox.retried,
            outbox_dead_lettered: outbox.dead_lettered,
            scheduler_delivered: scheduler.delivered,
            scheduler_failed: scheduler.failed,
            queue_acked,
            queue_nacked,
        }
    }

    pub async fn health(&self) -> HealthReport {
        let workers = self.ensure_workers();
        let mut issues = Vec::new();

        let outbox_pending = self.outbox_store.pending_count().await.unwrap_or(0);
        let outbox_failed = self
            .outbox_store
            .failed(1000)
            .await
            .map(|v| v.len())
            .unwrap_or(0);
        if outbox_failed > 0 {
            issues.push(format!("{outbox_failed} outbox entries failed terminally"));
        }

        let scheduled_pending = self
            .scheduled_storage
            .query(ScheduleQuery {
                status: Some(ScheduledStatus::Pending),
                ..Default::default()
            })
            .await
            .map(|v| v.len())
            .unwrap_or(0);

        let dead_letter_count = self.dead_letters.count().await;
        if dead_letter_count > 0 {
            issues.push(format!("{dead_letter_count} messages in the dead-letter queue"));
        }

        let stats = workers.dispatcher.stats();
        if stats.in_flight >= stats.queue_capacity {
            issues.push("dispatch queue at capacity".to_string());
        }

        let active_queue_workers = self
            .queue_workers
            .iter()
            .filter(|w| w.is_running())
            .count();

        let status = if stats.in_flight >= stats.queue_capacity {
            HealthStatus::Degraded
        } else if issues.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Warning
        };

        HealthReport {
            status,
            outbox_pending,
            outbox_failed,
            scheduled_pending,
            active_queue_workers,
            dead_letter_count,
            in_flight_dispatches: stats.in_flight,
            issues,
        }
    }

    /// Immediate outbox drain, useful for embedded hosts and tests that do
    /// not run the background loop.
    pub async fn drain_outbox_once(&self) -> Result<usize, MessagingError> {
        self.ensure_workers().outbox_processor.drain_once().await
    }

    /// Immediate scheduler tick, useful for embedded hosts and tests.
    pub async fn tick_scheduler_once(&self) -> Result<usize, MessagingError> {
        self.ensure_workers()
            .scheduler
            .poll_once()
            .await
            .map_err(|e| MessagingError::Storage(e.to_string()))
    }

    /// Count of outbox entries in a given status, for operational checks.
    pub async fn outbox_status_count(&self, status: OutboxStatus) -> usize {
        match status {
            OutboxStatus::Pending => self.outbox_store.pending_count().await.unwrap_or(0),
            OutboxStatus::Failed => self
                .outbox_store
                .failed(usize::MAX)
                .await
                .map(|v| v.len())
                .unwrap_or(0),
            _ => 0,
        }
    }
}
