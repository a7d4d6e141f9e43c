//! End-to-end scenarios through the facade.
//!
//! Tests for:
//! - Idempotent command dispatch (single handler invocation, cached result)
//! - Validation failure caching
//! - Transient failures never entering the cache
//! - Outbox delivery ordering within a destination
//! - Scheduler cancellation
//! - Queue consumption and inbox deduplication

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hm_messaging::{
    Command, ConsumerOptions, DeliverAt, DispatchError, DynMessage, EnqueueOptions, Envelope,
    ErrorKind, Event, HealthStatus, HeroMessaging, IdempotencyStore, InMemoryIdempotencyStore,
    InMemoryScheduledStorage, InMemoryTransport, Message, MessageValidator, MessagingConfig,
    OutboxOptions, ProcessingContext, ProcessingError, ScheduledStatus, ScheduledStorage,
    SchedulingOptions, Transport, ValidationOutcome,
};
use hm_outbox::InboxOptions;
use hm_pipeline::CommandHandler;
use hm_pipeline::EventHandler;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
struct CreateOrder {
    envelope: Envelope,
    customer: String,
    amount: i64,
}

impl CreateOrder {
    fn with_id(id: &str, customer: &str, amount: i64) -> Self {
        Self {
            envelope: Envelope::with_id(Uuid::parse_str(id).unwrap()),
            customer: customer.to_string(),
            amount,
        }
    }
}

impl Message for CreateOrder {
    const TYPE: &'static str = "orders.create";

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn envelope_mut(&mut self) -> &mut Envelope {
        &mut self.envelope
    }
}

impl Command for CreateOrder {
    type Response = String;
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

/// Handler whose behavior is scripted per test.
struct OrderHandler {
    calls: AtomicU32,
    fail_with_timeout_first: u32,
}

impl OrderHandler {
    fn ok() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            fail_with_timeout_first: 0,
        })
    }

    fn flaky(times: u32) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            fail_with_timeout_first: times,
        })
    }
}

#[async_trait]
impl CommandHandler<CreateOrder> for Arc<OrderHandler> {
    async fn handle(
        &self,
        _command: &CreateOrder,
        _ctx: &mut ProcessingContext,
    ) -> Result<String, ProcessingError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.fail_with_timeout_first {
            return Err(ProcessingError::timeout("payment gateway timeout"));
        }
        Ok("ord-42".to_string())
    }
}

struct OrderValidator;

impl MessageValidator for OrderValidator {
    fn message_type(&self) -> Option<&'static str> {
        Some("orders.create")
    }

    fn validate(&self, message: &DynMessage) -> ValidationOutcome {
        let Some(order) = message.downcast_ref::<CreateOrder>() else {
            return ValidationOutcome::valid();
        };
        let mut errors = Vec::new();
        if order.customer.is_empty() {
            errors.push("CustomerId required".to_string());
        }
        if order.amount <= 0 {
            errors.push("Amount must be positive".to_string());
        }
        if errors.is_empty() {
            ValidationOutcome::valid()
        } else {
            ValidationOutcome::invalid(errors)
        }
    }
}

struct ShippedSubscriber {
    seen: AtomicU32,
}

struct FailingSubscriber;

#[async_trait]
impl EventHandler<OrderShipped> for FailingSubscriber {
    async fn handle(
        &self,
        _event: &OrderShipped,
        _ctx: &mut ProcessingContext,
    ) -> Result<(), ProcessingError> {
        Err(ProcessingError::new(
            ErrorKind::Unknown,
            "notification channel down",
        ))
    }
}

#[async_trait]
impl EventHandler<OrderShipped> for Arc<ShippedSubscriber> {
    async fn handle(
        &self,
        _event: &OrderShipped,
        _ctx: &mut ProcessingContext,
    ) -> Result<(), ProcessingError> {
        self.seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn quiet_config() -> MessagingConfig {
    let mut config = MessagingConfig::default();
    config.retry.base_delay_ms = 1;
    config
}

#[tokio::test]
async fn idempotent_command_runs_the_handler_exactly_once() {
    let messaging = HeroMessaging::new(quiet_config());
    let handler = OrderHandler::ok();
    messaging.register_command::<CreateOrder, _>(Arc::clone(&handler));

    let id = "11111111-1111-1111-1111-111111111111";
    let first = messaging
        .send(CreateOrder::with_id(id, "c-1", 100))
        .await
        .unwrap();
    let second = messaging
        .send(CreateOrder::with_id(id, "c-1", 100))
        .await
        .unwrap();

    assert_eq!(first, "ord-42");
    assert_eq!(second, "ord-42");
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn validation_failures_are_cached_and_replayed() {
    let store = Arc::new(InMemoryIdempotencyStore::new());
    let messaging = HeroMessaging::new(quiet_config())
        .with_idempotency_store(Arc::clone(&store) as Arc<dyn IdempotencyStore>);
    let handler = OrderHandler::ok();
    messaging.register_command::<CreateOrder, _>(Arc::clone(&handler));
    messaging.register_validator(Arc::new(OrderValidator));

    let id = "22222222-2222-2222-2222-222222222222";
    let first = messaging
        .send(CreateOrder::with_id(id, "", -50))
        .await
        .unwrap_err();
    match &first {
        DispatchError::Validation(errors) => {
            assert_eq!(
                errors,
                &vec![
                    "CustomerId required".to_string(),
                    "Amount must be positive".to_string()
                ]
            );
        }
        other => panic!("expected validation failure, got {other:?}"),
    }

    let second = messaging
        .send(CreateOrder::with_id(id, "", -50))
        .await
        .unwrap_err();
    assert!(matches!(second, DispatchError::Validation(_)));
    // Validation sits outermost, so the handler never ran and both
    // submissions observed the identical deterministic failure.
    assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn transient_failures_are_never_cached() {
    let mut config = quiet_config();
    config.retry.enabled = false;
    let store = Arc::new(InMemoryIdempotencyStore::new());
    let messaging = HeroMessaging::new(config)
        .with_idempotency_store(Arc::clone(&store) as Arc<dyn IdempotencyStore>);
    let handler = OrderHandler::flaky(1);
    messaging.register_command::<CreateOrder, _>(Arc::clone(&handler));

    let id = "33333333-3333-3333-3333-333333333333";
    let first = messaging
        .send(CreateOrder::with_id(id, "c-1", 100))
        .await
        .unwrap_err();
    assert!(matches!(first, DispatchError::Timeout(_)));
    assert!(store.is_empty(), "transient failure must not be cached");

    // The handler succeeds now; the resubmission runs it again.
    let second = messaging
        .send(CreateOrder::with_id(id, "c-1", 100))
        .await
        .unwrap();
    assert_eq!(second, "ord-42");
    assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn retry_decorator_recovers_transient_handler_failures() {
    let messaging = HeroMessaging::new(quiet_config());
    let handler = OrderHandler::flaky(2);
    messaging.register_command::<CreateOrder, _>(Arc::clone(&handler));

    let result = messaging
        .send(CreateOrder::with_id(
            "44444444-4444-4444-4444-444444444444",
            "c-1",
            100,
        ))
        .await
        .unwrap();
    assert_eq!(result, "ord-42");
    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn outbox_preserves_priority_then_created_order_per_destination() {
    let transport = Arc::new(InMemoryTransport::new());
    let messaging = HeroMessaging::new(quiet_config())
        .with_transport(Arc::clone(&transport) as Arc<dyn Transport>);
    messaging.subscribe::<OrderShipped, _>(Arc::new(ShippedSubscriber {
        seen: AtomicU32::new(0),
    }));

    for (order_id, priority) in [("p5-first", 5), ("p10", 10), ("p5-second", 5)] {
        messaging
            .publish_to_outbox(
                &OrderShipped::new(order_id),
                OutboxOptions {
                    destination: Some("shipping".to_string()),
                    priority,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(3)).await;
    }

    let delivered = messaging.drain_outbox_once().await.unwrap();
    assert_eq!(delivered, 3);

    let order: Vec<String> = transport
        .published()
        .iter()
        .map(|(dest, m)| {
            assert_eq!(dest, "shipping");
            m.payload["order_id"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(order, vec!["p10", "p5-first", "p5-second"]);
}

#[tokio::test]
async fn cancelled_schedule_is_never_dispatched() {
    let storage = Arc::new(InMemoryScheduledStorage::new());
    let messaging = HeroMessaging::new(quiet_config())
        .with_scheduled_storage(Arc::clone(&storage) as Arc<dyn ScheduledStorage>);
    let subscriber = Arc::new(ShippedSubscriber {
        seen: AtomicU32::new(0),
    });
    messaging.subscribe::<OrderShipped, _>(Arc::clone(&subscriber));

    let schedule_id = messaging
        .schedule(
            &OrderShipped::new("ord-cancel"),
            DeliverAt::In(Duration::from_millis(150)),
            SchedulingOptions::default(),
        )
        .await
        .unwrap();

    assert!(messaging.cancel_schedule(schedule_id).await.unwrap());

    // Past the original deliver-at, a tick must not dispatch it.
    tokio::time::sleep(Duration::from_millis(200)).await;
    messaging.tick_scheduler_once().await.unwrap();

    assert_eq!(subscriber.seen.load(Ordering::SeqCst), 0);
    assert_eq!(
        storage.get(schedule_id).await.unwrap().unwrap().status,
        ScheduledStatus::Cancelled
    );
}

#[tokio::test]
async fn due_schedule_dispatches_to_subscribers() {
    let messaging = HeroMessaging::new(quiet_config());
    let subscriber = Arc::new(ShippedSubscriber {
        seen: AtomicU32::new(0),
    });
    messaging.subscribe::<OrderShipped, _>(Arc::clone(&subscriber));

    messaging
        .schedule(
            &OrderShipped::new("ord-due"),
            DeliverAt::In(Duration::from_millis(20)),
            SchedulingOptions::default(),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(messaging.tick_scheduler_once().await.unwrap(), 1);
    assert_eq!(subscriber.seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn enqueued_messages_flow_through_the_queue_worker() {
    let messaging = HeroMessaging::new(quiet_config());
    let handler = OrderHandler::ok();
    messaging.register_command::<CreateOrder, _>(Arc::clone(&handler));

    messaging
        .enqueue(
            &CreateOrder::with_id("55555555-5555-5555-5555-555555555555", "c-9", 10),
            "orders",
            EnqueueOptions::default(),
        )
        .await
        .unwrap();

    messaging.start_queue("orders", ConsumerOptions::default());

    for _ in 0..200 {
        if handler.calls.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    messaging.stop_queue("orders").await;
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn inbox_deduplicates_by_message_id() {
    let messaging = HeroMessaging::new(quiet_config());
    let subscriber = Arc::new(ShippedSubscriber {
        seen: AtomicU32::new(0),
    });
    messaging.subscribe::<OrderShipped, _>(Arc::clone(&subscriber));

    let event = OrderShipped::new("ord-77");
    let first = messaging
        .process_incoming(&event, InboxOptions::default())
        .await
        .unwrap();
    let second = messaging
        .process_incoming(&event, InboxOptions::default())
        .await
        .unwrap();

    assert!(!first.is_duplicate());
    assert!(second.is_duplicate());
    assert_eq!(subscriber.seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unregistered_message_types_cannot_be_persisted() {
    let messaging = HeroMessaging::new(quiet_config());
    let err = messaging
        .enqueue(
            &OrderShipped::new("nope"),
            "orders",
            EnqueueOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no registered handler"));
}

#[tokio::test]
async fn health_reflects_dead_letters_and_outbox_state() {
    let messaging = HeroMessaging::new(quiet_config());
    messaging.subscribe::<OrderShipped, _>(Arc::new(ShippedSubscriber {
        seen: AtomicU32::new(0),
    }));

    let healthy = messaging.health().await;
    assert_eq!(healthy.status, HealthStatus::Healthy);
    assert!(healthy.issues.is_empty());

    messaging
        .publish_to_outbox(&OrderShipped::new("pending"), OutboxOptions::default())
        .await
        .unwrap();
    let report = messaging.health().await;
    assert_eq!(report.outbox_pending, 1);
}

#[tokio::test]
async fn failed_event_handlers_dead_letter_when_opted_in() {
    let mut config = quiet_config();
    config.dispatcher.dead_letter_failed_events = true;
    let dlq = Arc::new(hm_messaging::InMemoryDeadLetterQueue::new());
    let messaging = HeroMessaging::new(config)
        .with_dead_letter_queue(Arc::clone(&dlq) as Arc<dyn hm_messaging::DeadLetterQueue>);
    messaging.subscribe::<OrderShipped, _>(FailingSubscriber);

    let outcome = messaging.publish(OrderShipped::new("ord-dl")).await.unwrap();
    assert_eq!(outcome.handler_count, 1);
    assert_eq!(outcome.failure_count, 1);

    use hm_messaging::DeadLetterQueue as _;
    let entries = dlq.dead_letters(10).await;
    assert_eq!(entries.len(), 1);
    // The dead-lettered entry carries the full payload for re-dispatch.
    let decoded: OrderShipped =
        serde_json::from_value(entries[0].message.payload.clone()).unwrap();
    assert_eq!(decoded.order_id, "ord-dl");

    let report = messaging.health().await;
    assert_eq!(report.dead_letter_count, 1);
    assert!(matches!(report.status, HealthStatus::Warning));
}

#[tokio::test]
async fn rate_limited_dispatch_is_throttled() {
    let messaging = HeroMessaging::new(quiet_config()).with_rate_limiter(
        hm_messaging::TokenBucketOptions {
            capacity: 2,
            refill_rate: 1,
            refill_period: Duration::from_secs(60),
            ..Default::default()
        },
    );
    let handler = OrderHandler::ok();
    messaging.register_command::<CreateOrder, _>(Arc::clone(&handler));

    for i in 0..2 {
        messaging
            .send(CreateOrder::with_id(
                &format!("66666666-6666-6666-6666-66666666666{i}"),
                "c-1",
                100,
            ))
            .await
            .unwrap();
    }

    let err = messaging
        .send(CreateOrder::with_id(
            "66666666-6666-6666-6666-666666666669",
            "c-1",
            100,
        ))
        .await
        .unwrap_err();
    match err {
        DispatchError::Failed(e) => assert_eq!(e.kind, ErrorKind::RateLimited),
        other => panic!("expected rate-limit failure, got {other:?}"),
    }
}
