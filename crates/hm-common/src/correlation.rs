//! Ambient correlation/causation propagation.
//!
//! A correlation scope is a tokio task-local frame holding the workflow id
//! and the message currently being processed. Scopes nest: entering a new
//! message shadows the previous frame and restores it on exit, and the frame
//! travels across await points within the same logical operation.

use std::future::Future;

use uuid::Uuid;

use crate::message::Message;

/// The ambient `(correlation_id, message_id)` pair for the current logical
/// flow.
#[derive(Debug, Clone)]
pub struct CorrelationFrame {
    pub correlation_id: Option<String>,
    pub message_id: Uuid,
}

impl CorrelationFrame {
    /// Frame for a message entering the pipeline. A message without an
    /// explicit correlation id starts a new workflow rooted at its own id.
    pub fn for_message<M: Message>(message: &M) -> Self {
        let envelope = message.envelope();
        Self {
            correlation_id: envelope
                .correlation_id
                .clone()
                .or_else(|| Some(envelope.message_id.to_string())),
            message_id: envelope.message_id,
        }
    }

    pub fn from_parts(correlation_id: Option<String>, message_id: Uuid) -> Self {
        Self {
            correlation_id,
            message_id,
        }
    }
}

tokio::task_local! {
    static CURRENT_FRAME: CorrelationFrame;
}

/// Run `fut` with `frame` as the ambient correlation context. The previous
/// frame (if any) is restored when the future completes.
pub async fn scope<F: Future>(frame: CorrelationFrame, fut: F) -> F::Output {
    CURRENT_FRAME.scope(frame, fut).await
}

/// The ambient frame, if a scope is active on this task.
pub fn current() -> Option<CorrelationFrame> {
    CURRENT_FRAME.try_with(|frame| frame.clone()).ok()
}

/// Stamp a message with the ambient correlation context.
///
/// Outside any scope the message is returned unchanged. Inside a scope the
/// message receives the ambient correlation id and the ambient message id as
/// its causation id. The message's own id is never touched.
pub fn with_correlation<M: Message>(mut message: M) -> M {
    if let Some(frame) = current() {
        let envelope = message.envelope_mut();
        envelope.correlation_id = frame.correlation_id.clone();
        envelope.causation_id = Some(frame.message_id.to_string());
    }
    message
}

/// Stamp a message with explicit correlation/causation ids, preserving the
/// message id.
pub fn with_correlation_ids<M: Message>(
    mut message: M,
    correlation_id: impl Into<String>,
    causation_id: Option<String>,
) -> M {
    let envelope = message.envelope_mut();
    envelope.correlation_id = Some(correlation_id.into());
    envelope.causation_id = causation_id;
    message
}
