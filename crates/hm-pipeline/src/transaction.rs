//! Transaction decorator: wraps the inner pipeline in a unit of work.

use std::sync::Arc;

use async_trait::async_trait;
use hm_common::{DynMessage, ErrorKind, ProcessingContext, ProcessingError, ProcessingResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::processor::MessageProcessor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl Default for IsolationLevel {
    fn default() -> Self {
        IsolationLevel::ReadCommitted
    }
}

/// An open transactional scope. Implementations bridge to whatever storage
/// adapter the host wired in.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    async fn commit(&self) -> Result<(), ProcessingError>;
    async fn rollback(&self) -> Result<(), ProcessingError>;
}

#[async_trait]
pub trait UnitOfWorkFactory: Send + Sync {
    async fn begin(&self, isolation: IsolationLevel) -> Result<Arc<dyn UnitOfWork>, ProcessingError>;
}

/// Context item exposing the open unit of work to handlers and stores
/// downstream in the same dispatch.
#[derive(Clone)]
pub struct ActiveUnitOfWork(pub Arc<dyn UnitOfWork>);

/// No-op factory for hosts without transactional storage.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopUnitOfWorkFactory;

struct NoopUnitOfWork;

#[async_trait]
impl UnitOfWork for NoopUnitOfWork {
    async fn commit(&self) -> Result<(), ProcessingError> {
        Ok(())
    }

    async fn rollback(&self) -> Result<(), ProcessingError> {
        Ok(())
    }
}

#[async_trait]
impl UnitOfWorkFactory for NoopUnitOfWorkFactory {
    async fn begin(
        &self,
        _isolation: IsolationLevel,
    ) -> Result<Arc<dyn UnitOfWork>, ProcessingError> {
        Ok(Arc::new(NoopUnitOfWork))
    }
}

/// Wraps the inner invocation in a unit of work: commit on success, roll
/// back on failure results (configurable) and always on cancellation.
pub struct TransactionDecorator {
    inner: Arc<dyn MessageProcessor>,
    factory: Arc<dyn UnitOfWorkFactory>,
    isolation: IsolationLevel,
    rollback_on_failure: bool,
}

impl TransactionDecorator {
    pub fn new(inner: Arc<dyn MessageProcessor>, factory: Arc<dyn UnitOfWorkFactory>) -> Self {
        Self {
            inner,
            factory,
            isolation: IsolationLevel::default(),
            rollback_on_failure: true,
        }
    }

    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_rollback_on_failure(mut self, rollback_on_failure: bool) -> Self {
        self.rollback_on_failure = rollback_on_failure;
        self
    }
}

#[async_trait]
impl MessageProcessor for TransactionDecorator {
    async fn process(&self, message: &DynMessage, ctx: &mut ProcessingContext) -> ProcessingResult {
        let uow = match self.factory.begin(self.isolation).await {
            Ok(uow) => uow,
            Err(e) => {
                error!(message_id = %message.message_id(), error = %e, "failed to begin unit of work");
                return ProcessingResult::failure(e);
            }
        };

        ctx.insert_item(ActiveUnitOfWork(Arc::clone(&uow)));
        let result = self.inner.process(message, ctx).await;
        ctx.remove_item::<ActiveUnitOfWork>();

        match &result {
            ProcessingResult::Success { .. } => {
                if let Err(e) = uow.commit().await {
                    error!(message_id = %message.message_id(), error = %e, "commit failed");
                    return ProcessingResult::failure(e);
                }
            }
            ProcessingResult::Failure { error } => {
                let must_rollback =
                    self.rollback_on_failure || error.kind == ErrorKind::Cancelled;
                if must_rollback {
                    if let Err(e) = uow.rollback().await {
                        error!(message_id = %message.message_id(), error = %e, "rollback failed");
                    }
                } else if let Err(e) = uow.commit().await {
                    error!(message_id = %message.message_id(), error = %e, "commit failed");
                    return ProcessingResult::failure(e);
                }
                debug!(
                    message_id = %message.message_id(),
                    kind = %error.kind,
                    rolled_back = must_rollback,
                    "unit of work closed after failure"
                );
            }
        }

        result
    }
}

/// Records begin/commit/rollback calls; for embedded use and tests.
#[derive(Default)]
pub struct RecordingUnitOfWorkFactory {
    pub begun: std::sync::atomic::AtomicUsize,
    pub committed: Arc<std::sync::atomic::AtomicUsize>,
    pub rolled_back: Arc<std::sync::atomic::AtomicUsize>,
}

struct RecordingUnitOfWork {
    committed: Arc<std::sync::atomic::AtomicUsize>,
    rolled_back: Arc<std::sync::atomic::AtomicUsize>,
}

#[async_trait]
impl UnitOfWork for RecordingUnitOfWork {
    async fn commit(&self) -> Result<(), ProcessingError> {
        self.committed
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self) -> Result<(), ProcessingError> {
        self.rolled_back
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl UnitOfWorkFactory for RecordingUnitOfWorkFactory {
    async fn begin(
        &self,
        _isolation: IsolationLevel,
    ) -> Result<Arc<dyn UnitOfWork>, ProcessingError> {
        self.begun.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(Arc::new(RecordingUnitOfWork {
            committed: Arc::clone(&self.committed),
            rolled_back: Arc::clone(&self.rolled_back),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hm_common::{Envelope, Message, MessageKind};
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::Ordering;

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

    struct Scripted {
        result: fn() -> ProcessingResult,
        sees_uow: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl MessageProcessor for Scripted {
        async fn process(
            &self,
            _message: &DynMessage,
            ctx: &mut ProcessingContext,
        ) -> ProcessingResult {
            self.sees_uow
                .store(ctx.item::<ActiveUnitOfWork>().is_some(), Ordering::SeqCst);
            (self.result)()
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

    async fn run(result: fn() -> ProcessingResult) -> (Arc<RecordingUnitOfWorkFactory>, bool) {
        let factory = Arc::new(RecordingUnitOfWorkFactory::default());
        let sees_uow = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let decorator = TransactionDecorator::new(
            Arc::new(Scripted {
                result,
                sees_uow: Arc::clone(&sees_uow),
            }),
            Arc::clone(&factory) as Arc<dyn UnitOfWorkFactory>,
        );

        let mut ctx = ProcessingContext::new();
        decorator.process(&probe(), &mut ctx).await;
        (factory, sees_uow.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn success_commits() {
        let (factory, saw_uow) = run(ProcessingResult::success).await;
        assert!(saw_uow);
        assert_eq!(factory.committed.load(Ordering::SeqCst), 1);
        assert_eq!(factory.rolled_back.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failure_rolls_back() {
        let (factory, _) =
            run(|| ProcessingResult::failed(ErrorKind::InvalidOperation, "rule broken")).await;
        assert_eq!(factory.committed.load(Ordering::SeqCst), 0);
        assert_eq!(factory.rolled_back.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_always_rolls_back() {
        let factory = Arc::new(RecordingUnitOfWorkFactory::default());
        let decorator = TransactionDecorator::new(
            Arc::new(Scripted {
                result: || ProcessingResult::failure(ProcessingError::cancelled()),
                sees_uow: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            }),
            Arc::clone(&factory) as Arc<dyn UnitOfWorkFactory>,
        )
        .with_rollback_on_failure(false);

        let mut ctx = ProcessingContext::new();
        decorator.process(&probe(), &mut ctx).await;
        assert_eq!(factory.rolled_back.load(Ordering::SeqCst), 1);
        assert_eq!(factory.committed.load(Ordering::SeqCst), 0);
    }
}
