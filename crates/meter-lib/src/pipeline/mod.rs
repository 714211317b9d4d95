//! Message pipeline
//!
//! A [`Pipeline`] runs every message through a fixed, ordered list of
//! [`Filter`]s. Within one `send` each filter sees the output of the previous
//! one and may:
//! - fail, aborting the chain with a [`FilterError`]
//! - stop the chain, which then ends successfully
//! - supersede the message, so every later filter sees the new one
//!
//! The pipeline keeps no per-message state of its own and may be shared
//! between concurrent senders.

mod dispatcher;
pub mod filters;


pub use dispatcher::{
    DispatchError, DispatchHandle, DispatchSummary, Dispatcher, DispatcherConfig,
};

use crate::message::Message;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, debug_span, Instrument, Span};

/// Per-call processing state handed to each filter
#[derive(Debug)]
pub struct ProcessingContext {
    span: Span,
    stopped: bool,
    next: Option<Message>,
}

impl ProcessingContext {
    pub fn new(span: Span) -> Self {
        Self {
            span,
            stopped: false,
            next: None,
        }
    }

    /// End processing once the current filter returns
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Supersede the current message for all later filters
    pub fn set_message(&mut self, message: Message) {
        self.next = Some(message);
    }

    /// Span of the `send` call this context belongs to
    pub fn span(&self) -> &Span {
        &self.span
    }

    pub(crate) fn take_message(&mut self) -> Option<Message> {
        self.next.take()
    }
}

/// A processing stage of the pipeline
#[async_trait]
pub trait Filter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, ctx: &mut ProcessingContext, message: &Message) -> anyhow::Result<()>;
}

/// A filter failed while handling a message
#[derive(Debug, Error)]
#[error("filter {filter} failed: {source:#}")]
pub struct FilterError {
    pub filter: &'static str,
    #[source]
    pub source: anyhow::Error,
}

/// Ordered chain of filters
#[derive(Clone, Default)]
pub struct Pipeline {
    filters: Vec<Arc<dyn Filter>>,
}

impl Pipeline {
    pub fn new(filters: Vec<Arc<dyn Filter>>) -> Self {
        Self { filters }
    }

    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Names of the filters, in order
    pub fn filter_names(&self) -> Vec<&'static str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    /// Run a message through the chain
    pub async fn send(&self, message: Message) -> Result<(), FilterError> {
        let span = debug_span!(
            "pipeline",
            message.id = %message.id(),
            message.kind = %message.message_type()
        );

        self.run(message, span.clone()).instrument(span).await
    }

    async fn run(&self, message: Message, span: Span) -> Result<(), FilterError> {
        let mut ctx = ProcessingContext::new(span);
        let mut current = message;

        for filter in &self.filters {
            filter
                .handle(&mut ctx, &current)
                .await
                .map_err(|source| FilterError {
                    filter: filter.name(),
                    source,
                })?;

            if ctx.is_stopped() {
                debug!(filter = filter.name(), "processing stopped");
                break;
            }

            if let Some(next) = ctx.take_message() {
                debug!(
                    filter = filter.name(),
                    message.id = %next.id(),
                    message.kind = %next.message_type(),
                    "message superseded"
                );
                current = next;
            }
        }

        Ok(())
    }
}

/// Builder for a [`Pipeline`]
#[derive(Default)]
pub struct PipelineBuilder {
    filters: Vec<Arc<dyn Filter>>,
}

impl PipelineBuilder {
    /// Append a filter to the chain
    pub fn filter(mut self, filter: impl Filter + 'static) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    pub fn filter_arc(mut self, filter: Arc<dyn Filter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn build(self) -> Pipeline {
        Pipeline::new(self.filters)
    }
}
