//! Idempotency key generation.

use hm_common::DynMessage;

/// Keys are bounded so they fit indexed storage columns.
pub const MAX_KEY_LENGTH: usize = 450;

/// Derives the cache key for a message.
///
/// Keys must be deterministic (same message ⇒ same key), unique across
/// operations that should deduplicate independently, stable across
/// deployments, and at most [`MAX_KEY_LENGTH`] characters.
pub trait IdempotencyKeyGenerator: Send + Sync {
    fn generate(&self, message: &DynMessage) -> String;
}

/// Default generator: `idempotency:{message_id}`.
///
/// The message id is the deduplication handle, so resubmitting the same
/// message (same id) hits the cache while distinct messages never collide.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultKeyGenerator;

impl IdempotencyKeyGenerator for DefaultKeyGenerator {
    fn generate(&self, message: &DynMessage) -> String {
        format!("idempotency:{}", message.message_id())
    }
}
