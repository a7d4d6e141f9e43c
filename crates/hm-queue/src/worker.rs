//! Queue consumer worker.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hm_common::ProcessingResult;
use hm_policy::{DeadLetterContext, DeadLetterQueue, RetryPolicy};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::{QueueEntry, QueueMessageHandler, QueueStore};

/// Consumer behavior knobs.
#[derive(Clone)]
pub struct ConsumerOptions {
    /// Concurrent in-process deliveries.
    pub concurrency: usize,
    /// Entries pulled per poll.
    pub prefetch: u32,
    /// Acknowledge on receipt instead of after successful processing.
    pub auto_ack: bool,
    /// Requeue failed deliveries (subject to the retry policy's cap).
    pub requeue_on_failure: bool,
    /// Governs redelivery delay and the delivery-attempt cap.
    pub retry_policy: Option<Arc<dyn RetryPolicy>>,
    /// Visibility timeout for dequeued entries.
    pub lock_duration: Duration,
    /// Process prefetched entries as one batch in arrival order.
    pub enable_batching: bool,
    pub batch_size: usize,
    /// Flush a partial batch after this long.
    pub batch_timeout: Duration,
    /// Start the worker as soon as it is built.
    pub start_immediately: bool,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            prefetch: 16,
            auto_ack: false,
            requeue_on_failure: true,
            retry_policy: None,
            lock_duration: Duration::from_secs(30),
            enable_batching: false,
            batch_size: 10,
            batch_timeout: Duration::from_millis(250),
            start_immediately: true,
        }
    }
}

/// Worker counters.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    pub polled: u64,
    pub acked: u64,
    pub nacked: u64,
    pub dead_lettered: u64,
}

/// Polls one queue and feeds deliveries to the handler, bounded by the
/// consumer options.
pub struct QueueWorker {
    queue: String,
    store: Arc<dyn QueueStore>,
    handler: Arc<dyn QueueMessageHandler>,
    options: ConsumerOptions,
    dead_letters: Option<Arc<dyn DeadLetterQueue>>,
    running: Arc<AtomicBool>,
    semaphore: Arc<Semaphore>,
    polled: Arc<AtomicU64>,
    acked: Arc<AtomicU64>,
    nacked: Arc<AtomicU64>,
    dead_lettered: Arc<AtomicU64>,
    handle: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl QueueWorker {
    pub fn new(
        queue: impl Into<String>,
        store: Arc<dyn QueueStore>,
        handler: Arc<dyn QueueMessageHandler>,
        options: ConsumerOptions,
    ) -> Self {
        let concurrency = options.concurrency.max(1);
        Self {
            queue: queue.into(),
            store,
            handler,
            options,
            dead_letters: None,
            running: Arc::new(AtomicBool::new(false)),
            semaphore: Arc::new(Semaphore::new(concurrency)),
            polled: Arc::new(AtomicU64::new(0)),
            acked: Arc::new(AtomicU64::new(0)),
            nacked: Arc::new(AtomicU64::new(0)),
            dead_lettered: Arc::new(AtomicU64::new(0)),
            handle: parking_lot::Mutex::new(None),
        }
    }

    pub fn with_dead_letter_queue(mut self, dlq: Arc<dyn DeadLetterQueue>) -> Self {
        self.dead_letters = Some(dlq);
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            polled: self.polled.load(Ordering::SeqCst),
            acked: self.acked.load(Ordering::SeqCst),
            nacked: self.nacked.load(Ordering::SeqCst),
            dead_lettered: self.dead_lettered.load(Ordering::SeqCst),
        }
    }

    /// Start the poll loop. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(queue = %self.queue, concurrency = self.options.concurrency, "queue worker starting");

        let worker = Arc::clone(self);
        let handle = tokio::spawn(async move {
            worker.run().await;
        });
        *self.handle.lock() = Some(handle);
    }

    /// Stop polling; in-flight deliveries finish.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(queue = %self.queue, "queue worker stopping");
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.await;
        }
    }

    async fn run(self: Arc<Self>) {
        let idle_backoff = Duration::from_millis(50);

        while self.running.load(Ordering::SeqCst) {
            let mut batch = Vec::new();
            for _ in 0..self.options.prefetch.max(1) {
                match self.store.dequeue(&self.queue, self.options.lock_duration).await {
                    Ok(Some(entry)) => {
                        self.polled.fetch_add(1, Ordering::SeqCst);
                        batch.push(entry);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(queue = %self.queue, error = %e, "dequeue failed");
                        break;
                    }
                }
                if self.options.enable_batching && batch.len() >= self.options.batch_size {
                    break;
                }
            }

            if batch.is_empty() {
                tokio::time::sleep(idle_backoff).await;
                continue;
            }

            // Top off a partial batch until batch_timeout elapses.
            if self.options.enable_batching && batch.len() < self.options.batch_size {
                let deadline = tokio::time::Instant::now() + self.options.batch_timeout;
                while batch.len() < self.options.batch_size
                    && tokio::time::Instant::now() < deadline
                    && self.running.load(Ordering::SeqCst)
                {
                    match self.store.dequeue(&self.queue, self.options.lock_duration).await {
                        Ok(Some(entry)) => {
                            self.polled.fetch_add(1, Ordering::SeqCst);
                            batch.push(entry);
                        }
                        Ok(None) => tokio::time::sleep(Duration::from_millis(5)).await,
                        Err(_) => break,
                    }
                }
            }

            if self.options.enable_batching {
                // One batch in arrival order on a single permit.
                let permit = match self.semaphore.clone().acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => break,
                };
                let worker = Arc::clone(&self);
                tokio::spawn(async move {
                    for entry in batch {
                        worker.deliver(entry).await;
                    }
                    drop(permit);
                });
            } else {
                for entry in batch {
                    let permit = match self.semaphore.clone().acquire_owned().await {
                        Ok(p) => p,
                        Err(_) => break,
                    };
                    let worker = Arc::clone(&self);
                    tokio::spawn(async move {
                        worker.deliver(entry).await;
                        drop(permit);
                    });
                }
            }
        }
        debug!(queue = %self.queue, "queue worker loop exited");
    }

    async fn deliver(&self, entry: QueueEntry) {
        if self.options.auto_ack {
            let _ = self.store.ack(&self.queue, entry.id).await;
            self.acked.fetch_add(1, Ordering::SeqCst);
        }

        let result = self.handler.handle(&entry.message).await;

        match result {
            ProcessingResult::Success { .. } => {
                if !self.options.auto_ack {
                    let _ = self.store.ack(&self.queue, entry.id).await;
                    self.acked.fetch_add(1, Ordering::SeqCst);
                }
            }
            ProcessingResult::Failure { error } => {
                warn!(
                    queue = %self.queue,
                    message_id = %entry.message.message_id,
                    kind = %error.kind,
                    reason = %error.message,
                    "queue delivery failed"
                );
                if self.options.auto_ack {
                    return;
                }

                let attempt = entry.dequeue_count.saturating_sub(1);
                let (should_requeue, delay) = match &self.options.retry_policy {
                    Some(policy) => (
                        self.options.requeue_on_failure && policy.should_retry(&error, attempt),
                        Some(policy.retry_delay(attempt)),
                    ),
                    None => (self.options.requeue_on_failure, None),
                };

                if should_requeue {
                    let _ = self.store.nack(&self.queue, entry.id, delay).await;
                    self.nacked.fetch_add(1, Ordering::SeqCst);
                } else {
                    // Delivery attempts exhausted; settle and dead-letter.
                    let _ = self.store.ack(&self.queue, entry.id).await;
                    if let Some(dlq) = &self.dead_letters {
                        dlq.send_to_dead_letter(
                            entry.message.clone(),
                            DeadLetterContext {
                                reason: error.message.clone(),
                                component: format!("queue:{}", self.queue),
                                retry_count: attempt,
                            },
                        )
                        .await;
                        self.dead_lettered.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
        }
    }
}
