//! Metrics decorator.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use hm_common::{DynMessage, MetricsSink, ProcessingContext, ProcessingResult};

use crate::processor::MessageProcessor;

/// Measures wall-clock duration and emits per-message-type counters:
/// `started`, `succeeded`, `failed`, and `retried` (with the retry count).
/// The sink is fire-and-forget, so a broken backend cannot fail a dispatch.
pub struct MetricsDecorator {
    inner: Arc<dyn MessageProcessor>,
    sink: Arc<dyn MetricsSink>,
}

impl MetricsDecorator {
    pub fn new(inner: Arc<dyn MessageProcessor>, sink: Arc<dyn MetricsSink>) -> Self {
        Self { inner, sink }
    }
}

#[async_trait]
impl MessageProcessor for MetricsDecorator {
    async fn process(&self, message: &DynMessage, ctx: &mut ProcessingContext) -> ProcessingResult {
        let message_type = message.message_type();
        self.sink
            .counter(&format!("messaging.{message_type}.started"), 1);

        let start = Instant::now();
        let result = self.inner.process(message, ctx).await;
        self.sink
            .duration(&format!("messaging.{message_type}.duration"), start.elapsed());

        match &result {
            ProcessingResult::Success { .. } => {
                self.sink
                    .counter(&format!("messaging.{message_type}.succeeded"), 1);
            }
            ProcessingResult::Failure { error } => {
                self.sink
                    .counter(&format!("messaging.{message_type}.failed"), 1);
                // Unclassified and fatal failures are the "something threw"
                // bucket, distinct from expected business failures.
                if matches!(error.kind, hm_common::ErrorKind::Unknown | hm_common::ErrorKind::Fatal)
                {
                    self.sink
                        .counter(&format!("messaging.{message_type}.exceptions"), 1);
                }
            }
        }

        if ctx.retry_count > 0 {
            self.sink.counter(
                &format!("messaging.{message_type}.retried"),
                ctx.retry_count as u64,
            );
        }

        result
    }
}
