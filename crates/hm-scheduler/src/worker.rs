//! Scheduler worker: poll-and-dispatch loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hm_common::{MessageKind, ProcessingResult, SerializedMessage};
use hm_queue::{EnqueueOptions, QueueMessageHandler, QueueStore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::storage::{ScheduledEntry, ScheduledStatus, ScheduledStorage};
use crate::SchedulerError;

/// Options attached to a scheduled message.
#[derive(Debug, Clone, Default)]
pub struct SchedulingOptions {
    /// Deliver by enqueueing here instead of dispatching in-process.
    pub destination: Option<String>,
    pub priority: i32,
    pub metadata: Option<HashMap<String, serde_json::Value>>,
    /// Fail (rather than deliver) entries discovered well past their due
    /// time, for messages whose value expires.
    pub skip_if_past_due: bool,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick: Duration,
    pub batch_limit: usize,
    /// An entry is "past due" once it is this late.
    pub past_due_grace: Duration,
    /// Queue receiving entries that carry no destination but cannot be
    /// dispatched in-process.
    pub default_queue: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(250),
            batch_limit: 100,
            past_due_grace: Duration::from_secs(5),
            default_queue: "scheduled-messages".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SchedulerMetrics {
    pub delivered: u64,
    pub failed: u64,
    pub skipped_past_due: u64,
}

/// Polls due entries and routes each by message kind:
/// commands dispatch in-process, events dispatch (or enqueue when a
/// destination is set), response-bearing messages are refused with a
/// warning since no caller exists to receive the value.
pub struct SchedulerWorker {
    config: SchedulerConfig,
    storage: Arc<dyn ScheduledStorage>,
    dispatch: Arc<dyn QueueMessageHandler>,
    queue_store: Option<Arc<dyn QueueStore>>,
    running: Arc<AtomicBool>,
    delivered: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    skipped: Arc<AtomicU64>,
    handle: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SchedulerWorker {
    pub fn new(
        config: SchedulerConfig,
        storage: Arc<dyn ScheduledStorage>,
        dispatch: Arc<dyn QueueMessageHandler>,
    ) -> Self {
        Self {
            config,
            storage,
            dispatch,
            queue_store: None,
            running: Arc::new(AtomicBool::new(false)),
            delivered: Arc::new(AtomicU64::new(0)),
            failed: Arc::new(AtomicU64::new(0)),
            skipped: Arc::new(AtomicU64::new(0)),
            handle: parking_lot::Mutex::new(None),
        }
    }

    pub fn with_queue_store(mut self, queue_store: Arc<dyn QueueStore>) -> Self {
        self.queue_store = Some(queue_store);
        self
    }

    /// Record a message for future delivery.
    pub async fn schedule(
        &self,
        message: SerializedMessage,
        deliver_at: chrono::DateTime<Utc>,
        options: SchedulingOptions,
    ) -> Result<Uuid, SchedulerError> {
        let mut message = message;
        if let Some(metadata) = options.metadata {
            message.metadata.extend(metadata);
        }
        let entry = ScheduledEntry {
            schedule_id: Uuid::new_v4(),
            message,
            deliver_at,
            priority: options.priority,
            status: ScheduledStatus::Pending,
            destination: options.destination,
            skip_if_past_due: options.skip_if_past_due,
            created_at: Utc::now(),
            last_error: None,
        };
        let entry = self.storage.add(entry).await?;
        metrics::counter!("scheduler.scheduled_total").increment(1);
        Ok(entry.schedule_id)
    }

    /// `Pending -> Cancelled`; `false` once delivery already started.
    pub async fn cancel(&self, schedule_id: Uuid) -> Result<bool, SchedulerError> {
        self.storage.cancel(schedule_id).await
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        SchedulerMetrics {
            delivered: self.delivered.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            skipped_past_due: self.skipped.load(Ordering::SeqCst),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(tick_ms = self.config.tick.as_millis() as u64, "scheduler starting");
        let worker = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(worker.config.tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            while worker.running.load(Ordering::SeqCst) {
                ticker.tick().await;
                if let Err(e) = worker.poll_once().await {
                    warn!(error = %e, "scheduler poll failed");
                }
            }
        });
        *self.handle.lock() = Some(handle);
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("scheduler stopping");
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
            let _ = handle.await;
        }
    }

    /// One tick: fetch due entries, win the delivery race, deliver.
    /// Public so embedded hosts and tests can drive the clock themselves.
    pub async fn poll_once(&self) -> Result<usize, SchedulerError> {
        let now = Utc::now();
        let due = self.storage.get_due(now, self.config.batch_limit).await?;
        if due.is_empty() {
            return Ok(0);
        }
        metrics::gauge!("scheduler.due_entries").set(due.len() as f64);

        let mut delivered = 0;
        for entry in due {
            // Another worker (or a cancel) may get here first.
            if !self.storage.try_begin_delivery(entry.schedule_id).await? {
                debug!(schedule_id = %entry.schedule_id, "lost delivery race, skipping");
                continue;
            }
            if self.deliver(entry, now).await {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    async fn deliver(&self, entry: ScheduledEntry, now: chrono::DateTime<Utc>) -> bool {
        let grace = chrono::Duration::from_std(self.config.past_due_grace).unwrap_or_default();
        if entry.skip_if_past_due && entry.deliver_at + grace < now {
            self.skipped.fetch_add(1, Ordering::SeqCst);
            let _ = self
                .storage
                .mark_failed(entry.schedule_id, "skipped past due".to_string())
                .await;
            return false;
        }

        // Response-bearing messages cannot be delivered: there is no caller
        // to hand the value back to.
        if entry.message.kind.expects_response() {
            warn!(
                schedule_id = %entry.schedule_id,
                message_type = %entry.message.message_type,
                kind = %entry.message.kind,
                "refusing to deliver response-bearing scheduled message"
            );
            self.failed.fetch_add(1, Ordering::SeqCst);
            let _ = self
                .storage
                .mark_failed(
                    entry.schedule_id,
                    "scheduler cannot deliver response-bearing messages".to_string(),
                )
                .await;
            return false;
        }

        let outcome = match (&entry.destination, &self.queue_store) {
            // A destination routes through the durable queue.
            (Some(destination), Some(queue_store)) => queue_store
                .enqueue(
                    destination,
                    entry.message.clone(),
                    EnqueueOptions {
                        priority: entry.priority,
                        ..Default::default()
                    },
                )
                .await
                .map(|_| ProcessingResult::success())
                .unwrap_or_else(|e| {
                    ProcessingResult::failed(hm_common::ErrorKind::TransientIo, e.to_string())
                }),
            (Some(destination), None) => ProcessingResult::failed(
                hm_common::ErrorKind::InvalidOperation,
                format!("no queue store configured for destination '{destination}'"),
            ),
            // Commands and events dispatch in-process.
            (None, _) if matches!(entry.message.kind, MessageKind::Command | MessageKind::Event) => {
                self.dispatch.handle(&entry.message).await
            }
            // Anything else without an in-process route lands on the
            // default scheduled-messages queue.
            (None, Some(queue_store)) => queue_store
                .enqueue(
                    &self.config.default_queue,
                    entry.message.clone(),
                    EnqueueOptions {
                        priority: entry.priority,
                        ..Default::default()
                    },
                )
                .await
                .map(|_| ProcessingResult::success())
                .unwrap_or_else(|e| {
                    ProcessingResult::failed(hm_common::ErrorKind::TransientIo, e.to_string())
                }),
            (None, None) => ProcessingResult::failed(
                hm_common::ErrorKind::InvalidOperation,
                "no route for scheduled message",
            ),
        };

        match outcome {
            ProcessingResult::Success { .. } => {
                self.delivered.fetch_add(1, Ordering::SeqCst);
                metrics::counter!("scheduler.delivered_total").increment(1);
                let _ = self.storage.mark_delivered(entry.schedule_id).await;
                true
            }
            ProcessingResult::Failure { error } => {
                warn!(
                    schedule_id = %entry.schedule_id,
                    kind = %error.kind,
                    reason = %error.message,
                    "scheduled delivery failed"
                );
                self.failed.fetch_add(1, Ordering::SeqCst);
                metrics::counter!("scheduler.failed_total").increment(1);
                let _ = self
                    .storage
                    .mark_failed(entry.schedule_id, error.message)
                    .await;
                false
            }
        }
    }
}
