//! Per-dispatch processing context and result.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ErrorKind, ProcessingError};

/// Mutable state owned by the pipeline for the duration of one dispatch.
///
/// Created at dispatch entry, dropped on return. Decorators read and update
/// it; handlers may stash typed items for downstream stages (the transaction
/// decorator publishes the active unit of work this way).
pub struct ProcessingContext {
    /// 0-based attempt number, bumped by the retry decorator.
    pub attempt: u32,
    /// Total retries performed so far (attempt - 1, floored at 0).
    pub retry_count: u32,
    /// Absolute deadline; converts to cancellation when it passes.
    pub deadline: Option<Instant>,
    pub cancellation: CancellationToken,
    pub trace_id: String,
    pub started_at: Instant,
    items: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl ProcessingContext {
    pub fn new() -> Self {
        Self {
            attempt: 0,
            retry_count: 0,
            deadline: None,
            cancellation: CancellationToken::new(),
            trace_id: Uuid::new_v4().to_string(),
            started_at: Instant::now(),
            items: HashMap::new(),
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        self.with_deadline(deadline)
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Remaining time before the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        if self.cancellation.is_cancelled() {
            return true;
        }
        matches!(self.deadline, Some(d) if Instant::now() >= d)
    }

    /// Suspension points call this before and after awaiting so cancellation
    /// and deadline expiry surface as classified failures, not as retries.
    pub fn check_cancelled(&self) -> Result<(), ProcessingError> {
        if self.cancellation.is_cancelled() {
            return Err(ProcessingError::cancelled());
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(ProcessingError::timeout("dispatch deadline exceeded"));
            }
        }
        Ok(())
    }

    pub fn insert_item<T: Send + Sync + 'static>(&mut self, item: T) {
        self.items.insert(TypeId::of::<T>(), Box::new(item));
    }

    pub fn item<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.items
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_ref::<T>())
    }

    pub fn remove_item<T: Send + Sync + 'static>(&mut self) -> Option<T> {
        self.items
            .remove(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast::<T>().ok())
            .map(|boxed| *boxed)
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl Default for ProcessingContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one pipeline traversal. Every decorator returns one of these;
/// only catastrophic failures (panics) escape the pipeline.
#[derive(Debug, Clone)]
pub enum ProcessingResult {
    Success { data: Option<serde_json::Value> },
    Failure { error: ProcessingError },
}

impl ProcessingResult {
    pub fn success() -> Self {
        ProcessingResult::Success { data: None }
    }

    pub fn success_with(data: serde_json::Value) -> Self {
        ProcessingResult::Success { data: Some(data) }
    }

    pub fn failure(error: ProcessingError) -> Self {
        ProcessingResult::Failure { error }
    }

    pub fn failed(kind: ErrorKind, message: impl Into<String>) -> Self {
        ProcessingResult::Failure {
            error: ProcessingError::new(kind, message),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ProcessingResult::Success { .. })
    }

    pub fn error(&self) -> Option<&ProcessingError> {
        match self {
            ProcessingResult::Success { .. } => None,
            ProcessingResult::Failure { error } => Some(error),
        }
    }

    pub fn data(&self) -> Option<&serde_json::Value> {
        match self {
            ProcessingResult::Success { data } => data.as_ref(),
            ProcessingResult::Failure { .. } => None,
        }
    }
}
