//! Outbox processor: write path and background delivery worker.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hm_common::{Message, MessageKind, MessagingError, SerializedMessage};
use hm_policy::{DeadLetterContext, DeadLetterQueue, ExponentialBackoffPolicy, RetryPolicy};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::{OutboxEntry, OutboxStatus, OutboxStore};
use crate::transport::Transport;

/// Options for a durable publish.
#[derive(Debug, Clone)]
pub struct OutboxOptions {
    pub destination: Option<String>,
    pub priority: i32,
    pub max_retries: u32,
    /// Fixed retry delay; `None` uses the processor's retry policy.
    pub retry_delay: Option<Duration>,
}

impl Default for OutboxOptions {
    fn default() -> Self {
        Self {
            destination: None,
            priority: 0,
            max_retries: 3,
            retry_delay: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutboxProcessorConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub lease_duration: Duration,
    /// Destination used when an entry carries none.
    pub default_destination: String,
}

impl Default for OutboxProcessorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            batch_size: 100,
            lease_duration: Duration::from_secs(300),
            default_destination: "outbox".to_string(),
        }
    }
}

/// Write path: records entries in the store; business state and the outbox
/// row commit together when the caller runs inside a unit of work whose
/// store shares the transaction.
pub struct OutboxPublisher {
    store: Arc<dyn OutboxStore>,
}

impl OutboxPublisher {
    pub fn new(store: Arc<dyn OutboxStore>) -> Self {
        Self { store }
    }

    pub async fn publish<M: Message + Serialize>(
        &self,
        message: &M,
        kind: MessageKind,
        options: OutboxOptions,
    ) -> Result<Uuid, MessagingError> {
        let serialized = SerializedMessage::encode(message, kind)?;
        self.publish_serialized(serialized, options).await
    }

    pub async fn publish_serialized(
        &self,
        message: SerializedMessage,
        options: OutboxOptions,
    ) -> Result<Uuid, MessagingError> {
        let id = Uuid::new_v4();
        let entry = OutboxEntry {
            id,
            message,
            destination: options.destination,
            priority: options.priority,
            max_retries: options.max_retries,
            retry_count: 0,
            retry_delay: options.retry_delay,
            created_at: Utc::now(),
            next_retry_at: None,
            processed_at: None,
            last_error: None,
            status: OutboxStatus::Pending,
            lease_expires_at: None,
        };
        self.store
            .add(entry)
            .await
            .map_err(|e| MessagingError::Storage(e.to_string()))?;
        Ok(id)
    }
}

/// Worker counters.
#[derive(Debug, Clone, Default)]
pub struct OutboxMetrics {
    pub polled: u64,
    pub published: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

/// Background delivery worker: polls due entries, publishes them through
/// the transport, schedules retries and dead-letters exhausted entries.
pub struct OutboxProcessor {
    config: OutboxProcessorConfig,
    store: Arc<dyn OutboxStore>,
    transport: Arc<dyn Transport>,
    retry_policy: Arc<dyn RetryPolicy>,
    dead_letters: Option<Arc<dyn DeadLetterQueue>>,
    running: Arc<AtomicBool>,
    polled: Arc<AtomicU64>,
    published: Arc<AtomicU64>,
    retried: Arc<AtomicU64>,
    dead_lettered: Arc<AtomicU64>,
    handle: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl OutboxProcessor {
    pub fn new(
        config: OutboxProcessorConfig,
        store: Arc<dyn OutboxStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            config,
            store,
            transport,
            retry_policy: Arc::new(ExponentialBackoffPolicy::default()),
            dead_letters: None,
            running: Arc::new(AtomicBool::new(false)),
            polled: Arc::new(AtomicU64::new(0)),
            published: Arc::new(AtomicU64::new(0)),
            retried: Arc::new(AtomicU64::new(0)),
            dead_lettered: Arc::new(AtomicU64::new(0)),
            handle: parking_lot::Mutex::new(None),
        }
    }

    pub fn with_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_dead_letter_queue(mut self, dlq: Arc<dyn DeadLetterQueue>) -> Self {
        self.dead_letters = Some(dlq);
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> OutboxMetrics {
        OutboxMetrics {
            polled: self.polled.load(Ordering::SeqCst),
            published: self.published.load(Ordering::SeqCst),
            retried: self.retried.load(Ordering::SeqCst),
            dead_lettered: self.dead_lettered.load(Ordering::SeqCst),
        }
    }

    /// Start the poll loop. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "outbox processor starting"
        );
        let processor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(processor.config.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            while processor.running.load(Ordering::SeqCst) {
                ticker.tick().await;
                if let Err(e) = processor.drain_once().await {
                    warn!(error = %e, "outbox poll failed");
                }
            }
        });
        *self.handle.lock() = Some(handle);
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("outbox processor stopping");
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
            let _ = handle.await;
        }
    }

    /// One poll cycle: fetch, publish, settle. Public so embedded hosts and
    /// tests can drive the outbox without the background loop.
    pub async fn drain_once(&self) -> Result<usize, MessagingError> {
        let batch = self
            .store
            .fetch_due(self.config.batch_size, self.config.lease_duration)
            .await
            .map_err(|e| MessagingError::Storage(e.to_string()))?;

        if batch.is_empty() {
            return Ok(0);
        }
        self.polled.fetch_add(batch.len() as u64, Ordering::SeqCst);
        metrics::gauge!("outbox.batch_size").set(batch.len() as f64);

        let mut delivered = 0;
        for entry in batch {
            if self.deliver(entry).await {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    async fn deliver(&self, entry: OutboxEntry) -> bool {
        let destination = entry
            .destination
            .clone()
            .unwrap_or_else(|| self.config.default_destination.clone());

        match self.transport.publish(&destination, &entry.message).await {
            Ok(()) => {
                let _ = self.store.mark_processed(entry.id).await;
                self.published.fetch_add(1, Ordering::SeqCst);
                metrics::counter!("outbox.published_total").increment(1);
                debug!(
                    outbox_id = %entry.id,
                    destination = %destination,
                    "outbox entry published"
                );
                true
            }
            Err(e) => {
                let attempt = entry.retry_count;
                if attempt + 1 >= entry.max_retries {
                    warn!(
                        outbox_id = %entry.id,
                        retries = attempt + 1,
                        error = %e,
                        "outbox entry exhausted retries"
                    );
                    let _ = self.store.mark_failed(entry.id, e.to_string()).await;
                    metrics::counter!("outbox.failed_total").increment(1);
                    if let Some(dlq) = &self.dead_letters {
                        dlq.send_to_dead_letter(
                            entry.message.clone(),
                            DeadLetterContext {
                                reason: e.to_string(),
                                component: "outbox".to_string(),
                                retry_count: attempt + 1,
                            },
                        )
                        .await;
                        self.dead_lettered.fetch_add(1, Ordering::SeqCst);
                    }
                } else {
                    let delay = entry
                        .retry_delay
                        .unwrap_or_else(|| self.retry_policy.retry_delay(attempt));
                    let next_retry_at =
                        Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
                    warn!(
                        outbox_id = %entry.id,
                        attempt = attempt + 1,
                        next_retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "outbox publish failed, retry scheduled"
                    );
                    let _ = self
                        .store
                        .mark_retry(entry.id, next_retry_at, e.to_string())
                        .await;
                    self.retried.fetch_add(1, Ordering::SeqCst);
                    metrics::counter!("outbox.retried_total").increment(1);
                }
                false
            }
        }
    }
}
