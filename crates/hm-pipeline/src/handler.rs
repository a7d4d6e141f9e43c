//! Typed handlers, their type-erased form, and the registry.
//!
//! Handlers bind by the message's stable type token, populated at startup.
//! Commands and queries get exactly one handler; events get a set, and an
//! event may also be subscribed under alias tokens.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use hm_common::{
    Command, DynMessage, ErrorKind, Event, ProcessingContext, ProcessingError, ProcessingResult,
    Query,
};
use serde_json::Value;
use tracing::debug;

#[async_trait]
pub trait CommandHandler<C: Command>: Send + Sync {
    async fn handle(
        &self,
        command: &C,
        ctx: &mut ProcessingContext,
    ) -> Result<C::Response, ProcessingError>;
}

#[async_trait]
pub trait QueryHandler<Q: Query>: Send + Sync {
    async fn handle(
        &self,
        query: &Q,
        ctx: &mut ProcessingContext,
    ) -> Result<Q::Response, ProcessingError>;
}

#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync {
    async fn handle(&self, event: &E, ctx: &mut ProcessingContext)
        -> Result<(), ProcessingError>;
}

/// Object-safe handler invoker. Converts handler errors into failure
/// results; panics are catastrophic and propagate.
#[async_trait]
pub trait ErasedHandler: Send + Sync {
    async fn invoke(
        &self,
        message: &DynMessage,
        ctx: &mut ProcessingContext,
    ) -> ProcessingResult;

    fn handler_name(&self) -> &'static str;
}

fn downcast_failure(expected: &str, message: &DynMessage) -> ProcessingResult {
    ProcessingResult::failed(
        ErrorKind::InvalidOperation,
        format!(
            "handler for '{expected}' received incompatible message '{}'",
            message.message_type()
        ),
    )
}

fn response_to_result<R: serde::Serialize>(response: R) -> ProcessingResult {
    match serde_json::to_value(response) {
        Ok(Value::Null) => ProcessingResult::success(),
        Ok(value) => ProcessingResult::success_with(value),
        Err(e) => ProcessingResult::failed(
            ErrorKind::Format,
            format!("failed to serialize handler response: {e}"),
        ),
    }
}

struct CommandInvoker<C: Command, H: CommandHandler<C>> {
    handler: Arc<H>,
    _marker: PhantomData<fn(C)>,
}

#[async_trait]
impl<C: Command, H: CommandHandler<C> + 'static> ErasedHandler for CommandInvoker<C, H> {
    async fn invoke(&self, message: &DynMessage, ctx: &mut ProcessingContext) -> ProcessingResult {
        let Some(command) = message.downcast_ref::<C>() else {
            return downcast_failure(C::TYPE, message);
        };
        if let Err(error) = ctx.check_cancelled() {
            return ProcessingResult::failure(error);
        }
        match self.handler.handle(command, ctx).await {
            Ok(response) => response_to_result(response),
            Err(error) => ProcessingResult::failure(error),
        }
    }

    fn handler_name(&self) -> &'static str {
        std::any::type_name::<H>()
    }
}

struct QueryInvoker<Q: Query, H: QueryHandler<Q>> {
    handler: Arc<H>,
    _marker: PhantomData<fn(Q)>,
}

#[async_trait]
impl<Q: Query, H: QueryHandler<Q> + 'static> ErasedHandler for QueryInvoker<Q, H> {
    async fn invoke(&self, message: &DynMessage, ctx: &mut ProcessingContext) -> ProcessingResult {
        let Some(query) = message.downcast_ref::<Q>() else {
            return downcast_failure(Q::TYPE, message);
        };
        if let Err(error) = ctx.check_cancelled() {
            return ProcessingResult::failure(error);
        }
        match self.handler.handle(query, ctx).await {
            Ok(response) => response_to_result(response),
            Err(error) => ProcessingResult::failure(error),
        }
    }

    fn handler_name(&self) -> &'static str {
        std::any::type_name::<H>()
    }
}

struct EventInvoker<E: Event, H: EventHandler<E>> {
    handler: Arc<H>,
    _marker: PhantomData<fn(E)>,
}

#[async_trait]
impl<E: Event, H: EventHandler<E> + 'static> ErasedHandler for EventInvoker<E, H> {
    async fn invoke(&self, message: &DynMessage, ctx: &mut ProcessingContext) -> ProcessingResult {
        let Some(event) = message.downcast_ref::<E>() else {
            return downcast_failure(E::TYPE, message);
        };
        if let Err(error) = ctx.check_cancelled() {
            return ProcessingResult::failure(error);
        }
        match self.handler.handle(event, ctx).await {
            Ok(()) => ProcessingResult::success(),
            Err(error) => ProcessingResult::failure(error),
        }
    }

    fn handler_name(&self) -> &'static str {
        std::any::type_name::<H>()
    }
}

/// Handler registry keyed by message-type token.
#[derive(Default)]
pub struct HandlerRegistry {
    commands: DashMap<&'static str, Arc<dyn ErasedHandler>>,
    queries: DashMap<&'static str, Arc<dyn ErasedHandler>>,
    events: DashMap<&'static str, Vec<Arc<dyn ErasedHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the single handler for a command type. Replaces any
    /// previous registration for the same token.
    pub fn register_command<C: Command, H: CommandHandler<C> + 'static>(&self, handler: H) {
        debug!(message_type = C::TYPE, "registered command handler");
        self.commands.insert(
            C::TYPE,
            Arc::new(CommandInvoker::<C, H> {
                handler: Arc::new(handler),
                _marker: PhantomData,
            }),
        );
    }

    pub fn register_query<Q: Query, H: QueryHandler<Q> + 'static>(&self, handler: H) {
        debug!(message_type = Q::TYPE, "registered query handler");
        self.queries.insert(
            Q::TYPE,
            Arc::new(QueryInvoker::<Q, H> {
                handler: Arc::new(handler),
                _marker: PhantomData,
            }),
        );
    }

    /// Subscribe a handler to an event type (appends to the set).
    pub fn register_event<E: Event, H: EventHandler<E> + 'static>(&self, handler: H) {
        self.register_event_under::<E, H>(E::TYPE, handler);
    }

    /// Subscribe a handler under one of the event's alias tokens.
    pub fn register_event_under<E: Event, H: EventHandler<E> + 'static>(
        &self,
        token: &'static str,
        handler: H,
    ) {
        debug!(message_type = E::TYPE, token, "registered event handler");
        self.events.entry(token).or_default().push(Arc::new(
            EventInvoker::<E, H> {
                handler: Arc::new(handler),
                _marker: PhantomData,
            },
        ));
    }

    pub fn command_handler(&self, message_type: &str) -> Option<Arc<dyn ErasedHandler>> {
        self.commands.get(message_type).map(|h| Arc::clone(&h))
    }

    pub fn query_handler(&self, message_type: &str) -> Option<Arc<dyn ErasedHandler>> {
        self.queries.get(message_type).map(|h| Arc::clone(&h))
    }

    /// Every handler subscribed to any of `tokens`, in registration order.
    pub fn event_handlers(&self, tokens: &[&str]) -> Vec<Arc<dyn ErasedHandler>> {
        let mut handlers = Vec::new();
        for token in tokens {
            if let Some(set) = self.events.get(*token) {
                handlers.extend(set.iter().cloned());
            }
        }
        handlers
    }

    pub fn has_command(&self, message_type: &str) -> bool {
        self.commands.contains_key(message_type)
    }

    pub fn has_query(&self, message_type: &str) -> bool {
        self.queries.contains_key(message_type)
    }
}

/// The innermost pipeline stage: invokes one resolved handler.
pub struct HandlerTerminal {
    handler: Arc<dyn ErasedHandler>,
}

impl HandlerTerminal {
    pub fn new(handler: Arc<dyn ErasedHandler>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl crate::processor::MessageProcessor for HandlerTerminal {
    async fn process(&self, message: &DynMessage, ctx: &mut ProcessingContext) -> ProcessingResult {
        self.handler.invoke(message, ctx).await
    }
}
