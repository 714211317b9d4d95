use crate::message::Message;
use crate::observability::MeterMetrics;
use crate::pipeline::{Filter, ProcessingContext};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

pub const NAME: &str = "not_handled";

/// Terminal filter: anything reaching it was not handled by the chain
pub struct NotHandledFilter {
    unhandled: AtomicU64,
    metrics: MeterMetrics,
}

impl Default for NotHandledFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl NotHandledFilter {
    pub fn new() -> Self {
        Self {
            unhandled: AtomicU64::new(0),
            metrics: MeterMetrics::new(),
        }
    }

    pub fn unhandled(&self) -> u64 {
        self.unhandled.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Filter for NotHandledFilter {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn handle(&self, ctx: &mut ProcessingContext, message: &Message) -> anyhow::Result<()> {
        self.unhandled.fetch_add(1, Ordering::Relaxed);
        self.metrics.inc_unhandled();
        warn!(
            message.id = %message.id(),
            message.kind = %message.message_type(),
            "message not handled"
        );
        ctx.stop();
        Ok(())
    }
}
