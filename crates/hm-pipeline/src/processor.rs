//! The processor seam and pipeline composition.

use std::sync::Arc;

use async_trait::async_trait;
use hm_common::{DynMessage, ProcessingContext, ProcessingResult};

/// One stage of message processing. Decorators wrap an inner processor; the
/// innermost stage invokes the handler.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(
        &self,
        message: &DynMessage,
        ctx: &mut ProcessingContext,
    ) -> ProcessingResult;
}

type Layer = Arc<dyn Fn(Arc<dyn MessageProcessor>) -> Arc<dyn MessageProcessor> + Send + Sync>;

/// An ordered list of decorator layers, applied outside-in: the first layer
/// added is the outermost stage of every assembled chain.
#[derive(Clone, Default)]
pub struct Pipeline {
    layers: Vec<Layer>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder {
            pipeline: Pipeline::default(),
        }
    }

    /// Wrap `terminal` in every layer.
    pub fn assemble(&self, terminal: Arc<dyn MessageProcessor>) -> Arc<dyn MessageProcessor> {
        self.layers
            .iter()
            .rev()
            .fold(terminal, |inner, layer| layer(inner))
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

pub struct PipelineBuilder {
    pipeline: Pipeline,
}

impl PipelineBuilder {
    /// Append a layer; it wraps everything added after it.
    pub fn layer(
        mut self,
        layer: impl Fn(Arc<dyn MessageProcessor>) -> Arc<dyn MessageProcessor>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.pipeline.layers.push(Arc::new(layer));
        self
    }

    pub fn build(self) -> Pipeline {
        self.pipeline
    }
}
