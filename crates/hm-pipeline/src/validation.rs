//! Validation decorator.

use std::sync::Arc;

use async_trait::async_trait;
use hm_common::{DynMessage, ProcessingContext, ProcessingError, ProcessingResult};
use tracing::debug;

use crate::processor::MessageProcessor;

/// Result of a single validator. Validators never fail the pipeline by
/// erroring; they report.
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub is_valid: bool,
    pub errors: Vec<String>,
}

impl ValidationOutcome {
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
        }
    }

    pub fn invalid(errors: Vec<String>) -> Self {
        Self {
            is_valid: false,
            errors,
        }
    }
}

pub trait MessageValidator: Send + Sync {
    /// Restrict this validator to one message type; `None` applies to all.
    fn message_type(&self) -> Option<&'static str> {
        None
    }

    fn validate(&self, message: &DynMessage) -> ValidationOutcome;
}

/// Runs every applicable validator and short-circuits the dispatch with the
/// aggregated error list when any of them reject.
pub struct ValidationDecorator {
    inner: Arc<dyn MessageProcessor>,
    validators: Arc<Vec<Arc<dyn MessageValidator>>>,
}

impl ValidationDecorator {
    pub fn new(
        inner: Arc<dyn MessageProcessor>,
        validators: Arc<Vec<Arc<dyn MessageValidator>>>,
    ) -> Self {
        Self { inner, validators }
    }
}

#[async_trait]
impl MessageProcessor for ValidationDecorator {
    async fn process(&self, message: &DynMessage, ctx: &mut ProcessingContext) -> ProcessingResult {
        let mut errors = Vec::new();
        for validator in self.validators.iter() {
            if let Some(scope) = validator.message_type() {
                if scope != message.message_type() {
                    continue;
                }
            }
            let outcome = validator.validate(message);
            if !outcome.is_valid {
                errors.extend(outcome.errors);
            }
        }

        if !errors.is_empty() {
            debug!(
                message_id = %message.message_id(),
                message_type = message.message_type(),
                error_count = errors.len(),
                "validation rejected message"
            );
            return ProcessingResult::failure(ProcessingError::validation(errors));
        }

        self.inner.process(message, ctx).await
    }
}
