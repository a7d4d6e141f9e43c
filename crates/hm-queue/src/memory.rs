//! Embedded in-memory queue store.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hm_common::SerializedMessage;
use parking_lot::Mutex;
use tracing::trace;
use uuid::Uuid;

use crate::{EnqueueOptions, QueueEntry, QueueStore, Result};

#[derive(Default)]
struct QueueState {
    ready: Vec<QueueEntry>,
    in_flight: HashMap<Uuid, (QueueEntry, DateTime<Utc>)>,
}

impl QueueState {
    /// Move expired in-flight entries back to ready (redelivery).
    fn reclaim_expired(&mut self, now: DateTime<Utc>) {
        let expired: Vec<Uuid> = self
            .in_flight
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some((entry, _)) = self.in_flight.remove(&id) {
                trace!(receipt = %id, "visibility timeout elapsed, requeueing");
                self.ready.push(entry);
            }
        }
    }

    /// Index of the best visible entry: priority desc, enqueued_at asc.
    fn next_index(&self, now: DateTime<Utc>) -> Option<usize> {
        self.ready
            .iter()
            .enumerate()
            .filter(|(_, e)| e.visible_at <= now)
            .min_by(|(_, a), (_, b)| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.enqueued_at.cmp(&b.enqueued_at))
            })
            .map(|(i, _)| i)
    }
}

/// In-memory queue store for tests and embedded hosts.
#[derive(Default)]
pub struct InMemoryQueueStore {
    queues: DashMap<String, Mutex<QueueState>>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_queue<T>(&self, queue: &str, f: impl FnOnce(&mut QueueState) -> T) -> T {
        let state = self
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| Mutex::new(QueueState::default()));
        let mut guard = state.lock();
        f(&mut guard)
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn enqueue(
        &self,
        queue: &str,
        message: SerializedMessage,
        options: EnqueueOptions,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let visible_at = match options.delay {
            Some(delay) => now + chrono::Duration::from_std(delay).unwrap_or_default(),
            None => now,
        };
        let mut message = message;
        if let Some(metadata) = options.metadata {
            message.metadata.extend(metadata);
        }

        self.with_queue(queue, |state| {
            state.ready.push(QueueEntry {
                id,
                message,
                priority: options.priority,
                enqueued_at: now,
                visible_at,
                dequeue_count: 0,
            });
        });
        Ok(id)
    }

    async fn dequeue(
        &self,
        queue: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<QueueEntry>> {
        let now = Utc::now();
        let deadline =
            now + chrono::Duration::from_std(visibility_timeout).unwrap_or_default();

        Ok(self.with_queue(queue, |state| {
            state.reclaim_expired(now);
            let index = state.next_index(now)?;
            let mut entry = state.ready.swap_remove(index);
            entry.dequeue_count += 1;
            state.in_flight.insert(entry.id, (entry.clone(), deadline));
            Some(entry)
        }))
    }

    async fn ack(&self, queue: &str, id: Uuid) -> Result<bool> {
        Ok(self.with_queue(queue, |state| state.in_flight.remove(&id).is_some()))
    }

    async fn nack(&self, queue: &str, id: Uuid, delay: Option<Duration>) -> Result<bool> {
        let now = Utc::now();
        Ok(self.with_queue(queue, |state| {
            match state.in_flight.remove(&id) {
                Some((mut entry, _)) => {
                    entry.visible_at = match delay {
                        Some(d) => now + chrono::Duration::from_std(d).unwrap_or_default(),
                        None => now,
                    };
                    state.ready.push(entry);
                    true
                }
                None => false,
            }
        }))
    }

    async fn depth(&self, queue: &str) -> Result<usize> {
        Ok(self.with_queue(queue, |state| state.ready.len() + state.in_flight.len()))
    }

    async fn queue_names(&self) -> Result<Vec<String>> {
        Ok(self.queues.iter().map(|e| e.key().clone()).collect())
    }
}
