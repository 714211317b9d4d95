use crate::collector::{Collector, CollectorError};
use crate::containers::ContainerDriver;
use crate::message::{Message, MessageBody};
use crate::models::ContainerState;
use crate::pipeline::{Filter, ProcessingContext};
use anyhow::Context;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

pub const NAME: &str = "sample_collector";

/// Starts sampling running containers and stops it for stopped ones
pub struct SampleCollectorFilter {
    driver: Arc<dyn ContainerDriver>,
    collector: Arc<Collector>,
}

impl SampleCollectorFilter {
    pub fn new(driver: Arc<dyn ContainerDriver>, collector: Arc<Collector>) -> Self {
        Self { driver, collector }
    }

    async fn start(&self, name: &str) -> anyhow::Result<()> {
        if self.collector.is_collecting(name) {
            debug!(container.name = %name, "already collecting");
            return Ok(());
        }

        let channel = self
            .driver
            .open_usage_channel(name)
            .await
            .with_context(|| format!("error opening usage channel for {}", name))?;

        match self.collector.collect(channel) {
            Ok(()) => Ok(()),
            // Lost a race against a concurrent start for the same container
            Err(CollectorError::AlreadyCollecting(_)) => Ok(()),
            Err(e) => Err(e).context("error starting collection"),
        }
    }

    async fn stop(&self, name: &str) -> anyhow::Result<()> {
        match self.collector.stop(name).await {
            Ok(channel) => {
                channel.close();
                Ok(())
            }
            Err(CollectorError::NotFound(_)) => {
                debug!(container.name = %name, "no active collection to stop");
                Ok(())
            }
            Err(e) => Err(e).context("error stopping collection"),
        }
    }
}

#[async_trait]
impl Filter for SampleCollectorFilter {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn handle(&self, _ctx: &mut ProcessingContext, message: &Message) -> anyhow::Result<()> {
        match message.body() {
            MessageBody::Discovery(info) => self.start(&info.name).await,
            MessageBody::StateChange(change) => match change.state {
                ContainerState::Running => self.start(change.container_name()).await,
                ContainerState::Stopped => self.stop(change.container_name()).await,
                ContainerState::Unknown => Ok(()),
            },
            _ => Ok(()),
        }
    }
}
