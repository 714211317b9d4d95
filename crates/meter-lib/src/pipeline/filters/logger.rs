use crate::message::Message;
use crate::pipeline::{Filter, ProcessingContext};
use async_trait::async_trait;
use tracing::debug;

pub const NAME: &str = "logger";

/// Debug-logs every message entering the chain
#[derive(Debug, Default)]
pub struct LoggerFilter;

#[async_trait]
impl Filter for LoggerFilter {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn handle(&self, _ctx: &mut ProcessingContext, message: &Message) -> anyhow::Result<()> {
        debug!(message.id = %message.id(), "processing {} message", message.message_type());
        Ok(())
    }
}
