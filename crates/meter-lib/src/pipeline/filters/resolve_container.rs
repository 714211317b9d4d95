use crate::containers::{ContainerDriver, DriverError};
use crate::message::{Message, MessageBody};
use crate::models::ContainerState;
use crate::pipeline::{Filter, ProcessingContext};
use crate::registry::ContainerRegistry;
use anyhow::Context;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

pub const NAME: &str = "container_resolver";

/// Attaches a descriptor to state changes that arrive without one
///
/// Running containers are looked up through the driver, stopped ones in the
/// registry. When neither knows the container the message continues
/// unresolved.
pub struct ContainerResolverFilter {
    driver: Arc<dyn ContainerDriver>,
    registry: Arc<ContainerRegistry>,
}

impl ContainerResolverFilter {
    pub fn new(driver: Arc<dyn ContainerDriver>, registry: Arc<ContainerRegistry>) -> Self {
        Self { driver, registry }
    }
}

#[async_trait]
impl Filter for ContainerResolverFilter {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn handle(&self, ctx: &mut ProcessingContext, message: &Message) -> anyhow::Result<()> {
        let MessageBody::StateChange(change) = message.body() else {
            return Ok(());
        };
        if change.is_resolved() {
            return Ok(());
        }

        let name = change.container_name();
        let resolved = match change.state {
            ContainerState::Running => match self.driver.get_container(name).await {
                Ok(info) => Some(Arc::new(info)),
                Err(DriverError::NotFound(_)) => {
                    debug!(container.name = %name, "container unknown to the driver");
                    None
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("error resolving container {}", name))
                }
            },
            ContainerState::Stopped => self.registry.get(name),
            ContainerState::Unknown => None,
        };

        match resolved {
            Some(info) => {
                ctx.set_message(Message::state_change(change.clone().with_container(info)))
            }
            None => debug!(container.name = %name, "state change continues unresolved"),
        }

        Ok(())
    }
}
