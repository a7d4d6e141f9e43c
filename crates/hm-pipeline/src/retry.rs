//! Retry decorator.

use std::sync::Arc;

use async_trait::async_trait;
use hm_common::{DynMessage, ErrorKind, ProcessingContext, ProcessingError, ProcessingResult};
use hm_policy::RetryPolicy;
use tracing::debug;

use crate::processor::MessageProcessor;

/// Re-runs the inner pipeline per the retry policy, up to
/// `max_retries + 1` total attempts. Cancellation is propagated immediately
/// and never retried; retry delays themselves honour cancellation.
pub struct RetryDecorator {
    inner: Arc<dyn MessageProcessor>,
    policy: Arc<dyn RetryPolicy>,
}

impl RetryDecorator {
    pub fn new(inner: Arc<dyn MessageProcessor>, policy: Arc<dyn RetryPolicy>) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl MessageProcessor for RetryDecorator {
    async fn process(&self, message: &DynMessage, ctx: &mut ProcessingContext) -> ProcessingResult {
        let cancellation = ctx.cancellation.clone();
        let mut attempt: u32 = 0;

        loop {
            ctx.attempt = attempt;
            if let Err(error) = ctx.check_cancelled() {
                return ProcessingResult::failure(error);
            }

            let result = self.inner.process(message, ctx).await;

            let error = match &result {
                ProcessingResult::Success { .. } => return result,
                ProcessingResult::Failure { error } => error.clone(),
            };

            if error.kind == ErrorKind::Cancelled {
                return result;
            }
            if !self.policy.should_retry(&error, attempt) {
                return result;
            }

            let delay = self.policy.retry_delay(attempt);
            attempt += 1;
            ctx.retry_count += 1;
            debug!(
                message_id = %message.message_id(),
                message_type = message.message_type(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                kind = %error.kind,
                "retrying dispatch"
            );

            tokio::select! {
                _ = cancellation.cancelled() => {
                    return ProcessingResult::failure(ProcessingError::cancelled());
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hm_common::{Envelope, Message, MessageKind};
    use hm_policy::{LinearRetryPolicy, NoRetryPolicy};
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Serialize, Deserialize)]
    struct Probe {
        envelope: Envelope,
    }

    impl Message for Probe {
        const TYPE: &'static str = "test.probe";

        fn envelope(&self) -> &Envelope {
            &self.envelope
        }

        fn envelope_mut(&mut self) -> &mut Envelope {
            &mut self.envelope
        }
    }

    /// Fails with a timeout until `succeed_after` attempts have happened.
    struct FlakyTerminal {
        calls: Arc<AtomicUsize>,
        succeed_after: usize,
    }

    #[async_trait]
    impl MessageProcessor for FlakyTerminal {
        async fn process(
            &self,
            _message: &DynMessage,
            _ctx: &mut ProcessingContext,
        ) -> ProcessingResult {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= self.succeed_after {
                ProcessingResult::success()
            } else {
                ProcessingResult::failed(ErrorKind::Timeout, "transient")
            }
        }
    }

    fn probe() -> DynMessage {
        DynMessage::new(
            Probe {
                envelope: Envelope::new(),
            },
            MessageKind::Command,
        )
    }

    #[tokio::test]
    async fn retries_until_success_and_counts_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let decorator = RetryDecorator::new(
            Arc::new(FlakyTerminal {
                calls: Arc::clone(&calls),
                succeed_after: 3,
            }),
            Arc::new(LinearRetryPolicy::new(5, Duration::from_millis(1))),
        );

        let mut ctx = ProcessingContext::new();
        let result = decorator.process(&probe(), &mut ctx).await;

        assert!(result.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(ctx.retry_count, 2);
        assert_eq!(ctx.attempt, 2);
    }

    #[tokio::test]
    async fn exhausted_retries_return_the_last_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let decorator = RetryDecorator::new(
            Arc::new(FlakyTerminal {
                calls: Arc::clone(&calls),
                succeed_after: usize::MAX,
            }),
            Arc::new(LinearRetryPolicy::new(2, Duration::from_millis(1))),
        );

        let mut ctx = ProcessingContext::new();
        let result = decorator.process(&probe(), &mut ctx).await;

        assert_eq!(result.error().unwrap().kind, ErrorKind::Timeout);
        // max_retries + 1 total attempts.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn no_retry_policy_runs_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let decorator = RetryDecorator::new(
            Arc::new(FlakyTerminal {
                calls: Arc::clone(&calls),
                succeed_after: usize::MAX,
            }),
            Arc::new(NoRetryPolicy),
        );

        let mut ctx = ProcessingContext::new();
        decorator.process(&probe(), &mut ctx).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_retries() {
        struct CancellingTerminal {
            calls: Arc<AtomicUsize>,
        }

        #[async_trait]
        impl MessageProcessor for CancellingTerminal {
            async fn process(
                &self,
                _message: &DynMessage,
                ctx: &mut ProcessingContext,
            ) -> ProcessingResult {
                self.calls.fetch_add(1, Ordering::SeqCst);
                ctx.cancellation.cancel();
                ProcessingResult::failed(ErrorKind::Timeout, "would retry without cancel")
            }
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let decorator = RetryDecorator::new(
            Arc::new(CancellingTerminal {
                calls: Arc::clone(&calls),
            }),
            Arc::new(LinearRetryPolicy::new(5, Duration::from_secs(60))),
        );

        let mut ctx = ProcessingContext::new();
        let result = decorator.process(&probe(), &mut ctx).await;

        assert_eq!(result.error().unwrap().kind, ErrorKind::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
