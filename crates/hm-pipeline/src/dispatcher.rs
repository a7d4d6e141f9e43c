//! Command/query/event dispatcher over the pipeline.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use hm_common::{
    correlation, Command, CorrelationFrame, DynMessage, ErrorKind, Event, MessageKind,
    ProcessingContext, ProcessingError, ProcessingResult, Query, SerializedMessage,
};
use hm_policy::{DeadLetterContext, DeadLetterQueue};
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::handler::{ErasedHandler, HandlerRegistry, HandlerTerminal};
use crate::processor::{MessageProcessor, Pipeline};

/// Typed outcome of a dispatch, as seen by facade callers.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no handler registered for message type '{0}'")]
    NoHandler(String),

    #[error("dispatch queue at capacity")]
    CapacityExceeded,

    #[error("validation failed: {0:?}")]
    Validation(Vec<String>),

    #[error("dispatch cancelled")]
    Cancelled,

    #[error("dispatch timed out: {0}")]
    Timeout(String),

    #[error("concurrency conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("dispatch failed: {0}")]
    Failed(ProcessingError),

    #[error("failed to decode handler response: {0}")]
    ResponseDecode(String),
}

impl From<ProcessingError> for DispatchError {
    fn from(error: ProcessingError) -> Self {
        match error.kind {
            ErrorKind::Validation => DispatchError::Validation(if error.details.is_empty() {
                vec![error.message]
            } else {
                error.details
            }),
            ErrorKind::Cancelled => DispatchError::Cancelled,
            ErrorKind::Timeout => DispatchError::Timeout(error.message),
            ErrorKind::ConcurrencyConflict => DispatchError::Conflict(error.message),
            ErrorKind::NotFound => DispatchError::NotFound(error.message),
            _ => DispatchError::Failed(error),
        }
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;

/// Outcome of an event publish: how many handlers ran and how many failed.
/// A publish is successful once dispatch was attempted; individual handler
/// failures are reported here and via metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublishOutcome {
    pub handler_count: usize,
    pub failure_count: usize,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Bounded parallelism for commands; 1 means strictly sequential.
    pub command_concurrency: usize,
    pub query_concurrency: usize,
    /// Bounded parallel degree for event fan-out.
    pub event_concurrency: usize,
    /// In-flight dispatch capacity; producers beyond it are rejected.
    pub queue_capacity: usize,
    /// Forward failed event handler invocations to the dead-letter queue.
    pub dead_letter_failed_events: bool,
    /// Default deadline applied when the caller sets none.
    pub default_timeout: Option<Duration>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            command_concurrency: 8,
            query_concurrency: 32,
            event_concurrency: 16,
            queue_capacity: 1024,
            dead_letter_failed_events: false,
            default_timeout: None,
        }
    }
}

/// Point-in-time dispatcher counters.
#[derive(Debug, Clone, Default)]
pub struct DispatcherStats {
    pub in_flight: usize,
    pub queue_capacity: usize,
    pub commands_dispatched: u64,
    pub queries_dispatched: u64,
    pub events_published: u64,
    pub dispatch_failures: u64,
}

/// Routes commands and queries to their single handler and fans events out
/// to every subscriber, each through its own pipeline chain.
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    pipeline: Pipeline,
    config: DispatcherConfig,
    command_semaphore: Arc<Semaphore>,
    query_semaphore: Arc<Semaphore>,
    event_semaphore: Arc<Semaphore>,
    in_flight: AtomicUsize,
    commands_dispatched: AtomicU64,
    queries_dispatched: AtomicU64,
    events_published: AtomicU64,
    dispatch_failures: AtomicU64,
    dead_letters: Option<Arc<dyn DeadLetterQueue>>,
    // Assembled chains, cached per message type (handlers bind at startup).
    chains: DashMap<String, Arc<dyn MessageProcessor>>,
    event_chains: DashMap<(String, usize), Arc<dyn MessageProcessor>>,
}

impl Dispatcher {
    pub fn new(registry: Arc<HandlerRegistry>, pipeline: Pipeline, config: DispatcherConfig) -> Self {
        let command_semaphore = Arc::new(Semaphore::new(config.command_concurrency.max(1)));
        let query_semaphore = Arc::new(Semaphore::new(config.query_concurrency.max(1)));
        let event_semaphore = Arc::new(Semaphore::new(config.event_concurrency.max(1)));
        Self {
            registry,
            pipeline,
            config,
            command_semaphore,
            query_semaphore,
            event_semaphore,
            in_flight: AtomicUsize::new(0),
            commands_dispatched: AtomicU64::new(0),
            queries_dispatched: AtomicU64::new(0),
            events_published: AtomicU64::new(0),
            dispatch_failures: AtomicU64::new(0),
            dead_letters: None,
            chains: DashMap::new(),
            event_chains: DashMap::new(),
        }
    }

    pub fn with_dead_letter_queue(mut self, dlq: Arc<dyn DeadLetterQueue>) -> Self {
        self.dead_letters = Some(dlq);
        self
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            in_flight: self.in_flight.load(Ordering::SeqCst),
            queue_capacity: self.config.queue_capacity,
            commands_dispatched: self.commands_dispatched.load(Ordering::SeqCst),
            queries_dispatched: self.queries_dispatched.load(Ordering::SeqCst),
            events_published: self.events_published.load(Ordering::SeqCst),
            dispatch_failures: self.dispatch_failures.load(Ordering::SeqCst),
        }
    }

    fn chain_for(&self, message_type: &str, handler: Arc<dyn ErasedHandler>) -> Arc<dyn MessageProcessor> {
        if let Some(chain) = self.chains.get(message_type) {
            return Arc::clone(&chain);
        }
        let chain = self.pipeline.assemble(Arc::new(HandlerTerminal::new(handler)));
        self.chains
            .insert(message_type.to_string(), Arc::clone(&chain));
        chain
    }

    fn event_chain_for(
        &self,
        message_type: &str,
        index: usize,
        handler: Arc<dyn ErasedHandler>,
    ) -> Arc<dyn MessageProcessor> {
        let key = (message_type.to_string(), index);
        if let Some(chain) = self.event_chains.get(&key) {
            return Arc::clone(&chain);
        }
        let chain = self.pipeline.assemble(Arc::new(HandlerTerminal::new(handler)));
        self.event_chains.insert(key, Arc::clone(&chain));
        chain
    }

    fn admission(&self) -> DispatchResult<InFlightGuard<'_>> {
        let admitted = self.in_flight.fetch_add(1, Ordering::SeqCst);
        if admitted >= self.config.queue_capacity {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(DispatchError::CapacityExceeded);
        }
        Ok(InFlightGuard { counter: &self.in_flight })
    }

    fn new_context(&self) -> ProcessingContext {
        let ctx = ProcessingContext::new();
        match self.config.default_timeout {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx,
        }
    }

    fn decode_response<R: serde::de::DeserializeOwned>(
        data: Option<serde_json::Value>,
    ) -> DispatchResult<R> {
        let value = data.unwrap_or(serde_json::Value::Null);
        serde_json::from_value(value).map_err(|e| DispatchError::ResponseDecode(e.to_string()))
    }

    /// Dispatch a command to its single handler, returning its response
    /// (`()` for fire-and-forget commands).
    pub async fn send<C: Command + Serialize>(&self, command: C) -> DispatchResult<C::Response> {
        let kind = if std::any::TypeId::of::<C::Response>() == std::any::TypeId::of::<()>() {
            MessageKind::Command
        } else {
            MessageKind::CommandWithResponse
        };

        let handler = self
            .registry
            .command_handler(C::TYPE)
            .ok_or_else(|| DispatchError::NoHandler(C::TYPE.to_string()))?;

        let _guard = self.admission()?;
        let command = correlation::with_correlation(command);
        let frame = CorrelationFrame::for_message(&command);
        let message = DynMessage::new(command, kind);
        let chain = self.chain_for(C::TYPE, handler);

        let permit = self
            .command_semaphore
            .acquire()
            .await
            .map_err(|_| DispatchError::Cancelled)?;
        self.commands_dispatched.fetch_add(1, Ordering::SeqCst);

        let mut ctx = self.new_context();
        let result = correlation::scope(frame, chain.process(&message, &mut ctx)).await;
        drop(permit);

        match result {
            ProcessingResult::Success { data } => Self::decode_response(data),
            ProcessingResult::Failure { error } => {
                self.dispatch_failures.fetch_add(1, Ordering::SeqCst);
                Err(error.into())
            }
        }
    }

    /// Dispatch a query to its single handler. Missing handlers are fatal
    /// for queries just as for commands.
    pub async fn send_query<Q: Query + Serialize>(&self, query: Q) -> DispatchResult<Q::Response> {
        let handler = self
            .registry
            .query_handler(Q::TYPE)
            .ok_or_else(|| DispatchError::NoHandler(Q::TYPE.to_string()))?;

        let _guard = self.admission()?;
        let query = correlation::with_correlation(query);
        let frame = CorrelationFrame::for_message(&query);
        let message = DynMessage::new(query, MessageKind::Query);
        let chain = self.chain_for(Q::TYPE, handler);

        let permit = self
            .query_semaphore
            .acquire()
            .await
            .map_err(|_| DispatchError::Cancelled)?;
        self.queries_dispatched.fetch_add(1, Ordering::SeqCst);

        let mut ctx = self.new_context();
        let result = correlation::scope(frame, chain.process(&message, &mut ctx)).await;
        drop(permit);

        match result {
            ProcessingResult::Success { data } => Self::decode_response(data),
            ProcessingResult::Failure { error } => {
                self.dispatch_failures.fetch_add(1, Ordering::SeqCst);
                Err(error.into())
            }
        }
    }

    /// Fan an event out to every handler subscribed to its type or aliases.
    /// Each handler runs through its own pipeline; one failing handler does
    /// not stop the others.
    pub async fn publish<E: Event + Serialize>(&self, event: E) -> DispatchResult<PublishOutcome> {
        let mut tokens = vec![E::TYPE];
        tokens.extend_from_slice(E::aliases());

        let _guard = self.admission()?;
        let event = correlation::with_correlation(event);
        let frame = CorrelationFrame::for_message(&event);

        // Capture the wire form before type erasure: a dead-lettered
        // failure must keep a payload that can be re-dispatched.
        let serialized = if self.config.dead_letter_failed_events && self.dead_letters.is_some() {
            match SerializedMessage::encode(&event, MessageKind::Event) {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!(
                        message_type = E::TYPE,
                        error = %e,
                        "failed to serialize event for dead-letter capture"
                    );
                    None
                }
            }
        } else {
            None
        };

        let message = DynMessage::new(event, MessageKind::Event);
        self.publish_message(&message, serialized.as_ref(), &tokens, frame)
            .await
    }

    async fn publish_message(
        &self,
        message: &DynMessage,
        source: Option<&SerializedMessage>,
        tokens: &[&str],
        frame: CorrelationFrame,
    ) -> DispatchResult<PublishOutcome> {
        let handlers = self.registry.event_handlers(tokens);
        self.events_published.fetch_add(1, Ordering::SeqCst);

        if handlers.is_empty() {
            debug!(
                message_type = message.message_type(),
                "event published with no subscribers"
            );
            return Ok(PublishOutcome::default());
        }

        let message_type = message.message_type();
        let invocations = handlers.into_iter().enumerate().map(|(index, handler)| {
            let chain = self.event_chain_for(message_type, index, handler);
            let message = message.clone();
            let frame = frame.clone();
            let semaphore = Arc::clone(&self.event_semaphore);
            async move {
                let _permit = semaphore.acquire().await.ok()?;
                let mut ctx = self.new_context();
                let result =
                    correlation::scope(frame, chain.process(&message, &mut ctx)).await;
                Some(result)
            }
        });

        let results = futures::future::join_all(invocations).await;

        let mut outcome = PublishOutcome::default();
        for result in results.into_iter().flatten() {
            outcome.handler_count += 1;
            if let ProcessingResult::Failure { error } = result {
                outcome.failure_count += 1;
                self.dispatch_failures.fetch_add(1, Ordering::SeqCst);
                warn!(
                    message_id = %message.message_id(),
                    message_type,
                    kind = %error.kind,
                    reason = %error.message,
                    "event handler failed"
                );
                if self.config.dead_letter_failed_events {
                    self.forward_to_dead_letter(message, source, &error).await;
                }
            }
        }

        Ok(outcome)
    }

    async fn forward_to_dead_letter(
        &self,
        message: &DynMessage,
        source: Option<&SerializedMessage>,
        error: &ProcessingError,
    ) {
        let Some(dlq) = &self.dead_letters else {
            return;
        };
        // The captured wire form keeps the entry re-dispatchable. The
        // envelope-only fallback covers the rare case where serialization
        // itself failed at publish time.
        let serialized = match source {
            Some(serialized) => serialized.clone(),
            None => SerializedMessage {
                message_id: message.message_id(),
                message_type: message.message_type().to_string(),
                kind: message.kind(),
                timestamp: message.envelope().timestamp,
                correlation_id: message.envelope().correlation_id.clone(),
                causation_id: message.envelope().causation_id.clone(),
                metadata: message.envelope().metadata.clone(),
                payload: serde_json::Value::Null,
            },
        };
        dlq.send_to_dead_letter(
            serialized,
            DeadLetterContext {
                reason: error.message.clone(),
                component: "dispatcher".to_string(),
                retry_count: 0,
            },
        )
        .await;
    }

    /// Dispatch an already-erased message (queue, scheduler and inbox
    /// paths). `source` is the persisted wire form the message was decoded
    /// from; it travels to the dead-letter queue on event-handler failures.
    pub async fn dispatch_dyn(
        &self,
        message: DynMessage,
        source: Option<&SerializedMessage>,
    ) -> ProcessingResult {
        let frame = CorrelationFrame::from_parts(
            message
                .envelope()
                .correlation_id
                .clone()
                .or_else(|| Some(message.message_id().to_string())),
            message.message_id(),
        );

        match message.kind() {
            MessageKind::Command | MessageKind::CommandWithResponse => {
                let Some(handler) = self.registry.command_handler(message.message_type()) else {
                    return ProcessingResult::failure(ProcessingError::not_found(format!(
                        "no handler registered for message type '{}'",
                        message.message_type()
                    )));
                };
                let chain = self.chain_for(message.message_type(), handler);
                self.commands_dispatched.fetch_add(1, Ordering::SeqCst);
                let mut ctx = self.new_context();
                correlation::scope(frame, chain.process(&message, &mut ctx)).await
            }
            MessageKind::Query => {
                let Some(handler) = self.registry.query_handler(message.message_type()) else {
                    return ProcessingResult::failure(ProcessingError::not_found(format!(
                        "no handler registered for message type '{}'",
                        message.message_type()
                    )));
                };
                let chain = self.chain_for(message.message_type(), handler);
                self.queries_dispatched.fetch_add(1, Ordering::SeqCst);
                let mut ctx = self.new_context();
                correlation::scope(frame, chain.process(&message, &mut ctx)).await
            }
            MessageKind::Event => {
                let tokens = [message.message_type()];
                match self.publish_message(&message, source, &tokens, frame).await {
                    Ok(outcome) if outcome.failure_count == 0 => ProcessingResult::success(),
                    Ok(outcome) => ProcessingResult::failed(
                        ErrorKind::Unknown,
                        format!(
                            "{}/{} event handlers failed",
                            outcome.failure_count, outcome.handler_count
                        ),
                    ),
                    Err(e) => ProcessingResult::failed(ErrorKind::Unknown, e.to_string()),
                }
            }
        }
    }
}

struct InFlightGuard<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{CommandHandler, EventHandler};
    use async_trait::async_trait;
    use hm_common::{Envelope, Message};
    use hm_policy::InMemoryDeadLetterQueue;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::AtomicU32;

    #[derive(Debug, Serialize, Deserialize)]
    struct ShipOrder {
        envelope: Envelope,
    }

    impl Message for ShipOrder {
        const TYPE: &'static str = "orders.ship";

        fn envelope(&self) -> &Envelope {
            &self.envelope
        }

        fn envelope_mut(&mut self) -> &mut Envelope {
            &mut self.envelope
        }
    }

    impl Command for ShipOrder {
        type Response = ();
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct OrderShipped {
        envelope: Envelope,
        order_id: String,
    }

    impl OrderShipped {
        fn new(order_id: &str) -> Self {
            Self {
                envelope: Envelope::new(),
                order_id: order_id.to_string(),
            }
        }
    }

    impl Message for OrderShipped {
        const TYPE: &'static str = "orders.shipped";

        fn envelope(&self) -> &Envelope {
            &self.envelope
        }

        fn envelope_mut(&mut self) -> &mut Envelope {
            &mut self.envelope
        }
    }

    impl Event for OrderShipped {}

    struct NoopShipHandler;

    #[async_trait]
    impl CommandHandler<ShipOrder> for NoopShipHandler {
        async fn handle(
            &self,
            _command: &ShipOrder,
            _ctx: &mut ProcessingContext,
        ) -> Result<(), ProcessingError> {
            Ok(())
        }
    }

    struct Subscriber {
        seen: AtomicU32,
        fail: bool,
    }

    impl Subscriber {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                seen: AtomicU32::new(0),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                seen: AtomicU32::new(0),
                fail: true,
            })
        }
    }

    #[async_trait]
    impl EventHandler<OrderShipped> for Arc<Subscriber> {
        async fn handle(
            &self,
            _event: &OrderShipped,
            _ctx: &mut ProcessingContext,
        ) -> Result<(), ProcessingError> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProcessingError::new(ErrorKind::Unknown, "subscriber broke"));
            }
            Ok(())
        }
    }

    fn dispatcher(registry: Arc<HandlerRegistry>, config: DispatcherConfig) -> Dispatcher {
        Dispatcher::new(registry, Pipeline::default(), config)
    }

    #[test]
    fn processing_errors_map_to_typed_dispatch_errors() {
        let validation =
            DispatchError::from(ProcessingError::validation(vec!["field required".to_string()]));
        assert!(
            matches!(validation, DispatchError::Validation(errors) if errors == vec!["field required".to_string()])
        );

        assert!(matches!(
            DispatchError::from(ProcessingError::cancelled()),
            DispatchError::Cancelled
        ));
        assert!(matches!(
            DispatchError::from(ProcessingError::timeout("deadline")),
            DispatchError::Timeout(_)
        ));
        assert!(matches!(
            DispatchError::from(ProcessingError::new(
                ErrorKind::ConcurrencyConflict,
                "expected 1, actual 2"
            )),
            DispatchError::Conflict(_)
        ));
        assert!(matches!(
            DispatchError::from(ProcessingError::not_found("missing")),
            DispatchError::NotFound(_)
        ));
        assert!(matches!(
            DispatchError::from(ProcessingError::new(ErrorKind::Unknown, "boom")),
            DispatchError::Failed(_)
        ));
    }

    #[tokio::test]
    async fn admission_rejects_beyond_queue_capacity() {
        let registry = Arc::new(HandlerRegistry::new());
        registry.register_command::<ShipOrder, _>(NoopShipHandler);

        let dispatcher = dispatcher(
            registry,
            DispatcherConfig {
                queue_capacity: 0,
                ..Default::default()
            },
        );

        let err = dispatcher
            .send(ShipOrder {
                envelope: Envelope::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::CapacityExceeded));
        assert_eq!(dispatcher.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn admission_releases_capacity_after_each_dispatch() {
        let registry = Arc::new(HandlerRegistry::new());
        registry.register_command::<ShipOrder, _>(NoopShipHandler);

        let dispatcher = dispatcher(
            registry,
            DispatcherConfig {
                queue_capacity: 1,
                ..Default::default()
            },
        );

        for _ in 0..3 {
            dispatcher
                .send(ShipOrder {
                    envelope: Envelope::new(),
                })
                .await
                .unwrap();
        }
        assert_eq!(dispatcher.stats().in_flight, 0);
        assert_eq!(dispatcher.stats().commands_dispatched, 3);
    }

    #[tokio::test]
    async fn one_failing_event_handler_does_not_stop_the_others() {
        let registry = Arc::new(HandlerRegistry::new());
        let first = Subscriber::ok();
        let broken = Subscriber::failing();
        let last = Subscriber::ok();
        registry.register_event::<OrderShipped, _>(Arc::clone(&first));
        registry.register_event::<OrderShipped, _>(Arc::clone(&broken));
        registry.register_event::<OrderShipped, _>(Arc::clone(&last));

        let dispatcher = dispatcher(registry, DispatcherConfig::default());
        let outcome = dispatcher.publish(OrderShipped::new("ord-1")).await.unwrap();

        assert_eq!(outcome.handler_count, 3);
        assert_eq!(outcome.failure_count, 1);
        assert_eq!(first.seen.load(Ordering::SeqCst), 1);
        assert_eq!(broken.seen.load(Ordering::SeqCst), 1);
        assert_eq!(last.seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dead_lettered_event_keeps_a_redispatchable_payload() {
        let registry = Arc::new(HandlerRegistry::new());
        registry.register_event::<OrderShipped, _>(Subscriber::failing());

        let dlq = Arc::new(InMemoryDeadLetterQueue::new());
        let dispatcher = Dispatcher::new(
            registry,
            Pipeline::default(),
            DispatcherConfig {
                dead_letter_failed_events: true,
                ..Default::default()
            },
        )
        .with_dead_letter_queue(Arc::clone(&dlq) as Arc<dyn DeadLetterQueue>);

        dispatcher.publish(OrderShipped::new("ord-9")).await.unwrap();

        let entries = dlq.dead_letters(10).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message.message_type, "orders.shipped");
        assert_eq!(entries[0].component, "dispatcher");

        // The captured payload decodes back into the original event.
        let decoded: OrderShipped =
            serde_json::from_value(entries[0].message.payload.clone()).unwrap();
        assert_eq!(decoded.order_id, "ord-9");
    }

    #[tokio::test]
    async fn dispatch_dyn_forwards_the_source_payload_on_event_failure() {
        let registry = Arc::new(HandlerRegistry::new());
        registry.register_event::<OrderShipped, _>(Subscriber::failing());

        let dlq = Arc::new(InMemoryDeadLetterQueue::new());
        let dispatcher = Dispatcher::new(
            registry,
            Pipeline::default(),
            DispatcherConfig {
                dead_letter_failed_events: true,
                ..Default::default()
            },
        )
        .with_dead_letter_queue(Arc::clone(&dlq) as Arc<dyn DeadLetterQueue>);

        let event = OrderShipped::new("ord-77");
        let serialized = SerializedMessage::encode(&event, MessageKind::Event).unwrap();
        let message = DynMessage::new(event, MessageKind::Event);

        let result = dispatcher.dispatch_dyn(message, Some(&serialized)).await;
        assert!(!result.is_success());

        let entries = dlq.dead_letters(10).await;
        assert_eq!(entries.len(), 1);
        let decoded: OrderShipped =
            serde_json::from_value(entries[0].message.payload.clone()).unwrap();
        assert_eq!(decoded.order_id, "ord-77");
    }
}
