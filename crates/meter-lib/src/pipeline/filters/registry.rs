//! Admission and removal of tracked containers
//!
//! Discoveries of trackable containers enter the registry and continue as
//! a running state change. State changes for containers the registry does
//! not know end here, so nothing is ever reported about untracked
//! containers. A stopped state change removes its container before any
//! later filter runs.

use crate::message::{Message, MessageBody};
use crate::models::{ContainerEvent, ContainerState, StateChange};
use crate::observability::{MeterMetrics, StructuredLogger};
use crate::pipeline::{Filter, ProcessingContext};
use crate::registry::ContainerRegistry;
use anyhow::Context;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

pub const NAME: &str = "registry";

pub struct RegistryFilter {
    registry: Arc<ContainerRegistry>,
    logger: StructuredLogger,
    metrics: MeterMetrics,
}

impl RegistryFilter {
    pub fn new(registry: Arc<ContainerRegistry>, logger: StructuredLogger) -> Self {
        Self {
            registry,
            logger,
            metrics: MeterMetrics::new(),
        }
    }
}

#[async_trait]
impl Filter for RegistryFilter {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn handle(&self, ctx: &mut ProcessingContext, message: &Message) -> anyhow::Result<()> {
        match message.body() {
            MessageBody::Discovery(info) => {
                if !self.registry.is_trackable(info) {
                    debug!(container.name = %info.name, "container not trackable");
                    ctx.stop();
                    return Ok(());
                }
                let inserted = self
                    .registry
                    .register(info.clone())
                    .context("error registering container")?;
                if !inserted {
                    debug!(container.name = %info.name, "container already tracked");
                    ctx.stop();
                    return Ok(());
                }
                self.metrics.set_containers_tracked(self.registry.len());

                let event = ContainerEvent::existed(info.clone());
                self.logger.log_container_tracked(
                    &info.name,
                    &info.image_name,
                    event.event_type.as_str(),
                );
                ctx.set_message(Message::state_change(StateChange::from_event(event)));
            }

            MessageBody::StateChange(change) => {
                let name = change.container_name();
                if !self.registry.is_registered(name) {
                    debug!(container.name = %name, "state change for untracked container");
                    ctx.stop();
                    return Ok(());
                }

                if change.state == ContainerState::Stopped {
                    if !change.is_resolved() {
                        if let Some(info) = self.registry.get(name) {
                            ctx.set_message(Message::state_change(
                                change.clone().with_container(info),
                            ));
                        }
                    }

                    self.registry
                        .drop_container(name)
                        .context("error dropping container")?;
                    self.metrics.set_containers_tracked(self.registry.len());
                    self.logger
                        .log_container_dropped(name, change.source.event_type.as_str());
                }
            }

            _ => {}
        }

        Ok(())
    }
}
