//! Idempotency decorator.

use std::sync::Arc;

use async_trait::async_trait;
use hm_common::{DynMessage, ProcessingContext, ProcessingResult};
use hm_idempotency::{IdempotencyPolicy, IdempotencyStatus, IdempotencyStore};
use tracing::debug;

use crate::processor::MessageProcessor;

/// Short-circuits duplicate dispatches with the cached outcome.
///
/// On a miss the inner pipeline runs exactly once; successes are cached for
/// `success_ttl` and deterministic failures for `failure_ttl`. Transient,
/// cancelled and unknown failures are never cached.
pub struct IdempotencyDecorator {
    inner: Arc<dyn MessageProcessor>,
    policy: IdempotencyPolicy,
    store: Arc<dyn IdempotencyStore>,
}

impl IdempotencyDecorator {
    pub fn new(
        inner: Arc<dyn MessageProcessor>,
        policy: IdempotencyPolicy,
        store: Arc<dyn IdempotencyStore>,
    ) -> Self {
        Self {
            inner,
            policy,
            store,
        }
    }
}

#[async_trait]
impl MessageProcessor for IdempotencyDecorator {
    async fn process(&self, message: &DynMessage, ctx: &mut ProcessingContext) -> ProcessingResult {
        let key = self.policy.key_generator.generate(message);

        if let Some(cached) = self.store.get(&key).await {
            debug!(
                key = %key,
                status = ?cached.status,
                message_id = %message.message_id(),
                "idempotency cache hit"
            );
            match cached.status {
                IdempotencyStatus::Success => {
                    return match cached.success_result {
                        Some(data) => ProcessingResult::success_with(data),
                        None => ProcessingResult::success(),
                    };
                }
                IdempotencyStatus::Failure => {
                    return ProcessingResult::failure(cached.reconstruct_failure());
                }
                IdempotencyStatus::Processing => {
                    return ProcessingResult::failure(hm_common::ProcessingError::invalid_operation(
                        "a dispatch for this message is already in progress",
                    ));
                }
            }
        }

        let result = self.inner.process(message, ctx).await;

        match &result {
            ProcessingResult::Success { data } => {
                self.store
                    .store_success(&key, data.clone(), self.policy.success_ttl)
                    .await;
            }
            ProcessingResult::Failure { error } => {
                if self.policy.cache_failures && (self.policy.is_idempotent_failure)(error) {
                    self.store
                        .store_failure(&key, error, self.policy.failure_ttl)
                        .await;
                }
            }
        }

        result
    }
}
