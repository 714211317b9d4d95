use crate::message::{Message, MessageBody};
use crate::pipeline::{Filter, ProcessingContext};
use async_trait::async_trait;
use tracing::{info, warn};

pub const NAME: &str = "service_resolver";

/// Logs state transitions together with the service the container belongs to
///
/// The service is read from the configured service-key label.
pub struct ServiceResolverFilter {
    service_key_label: String,
}

impl ServiceResolverFilter {
    pub fn new(service_key_label: impl Into<String>) -> Self {
        Self {
            service_key_label: service_key_label.into(),
        }
    }
}

#[async_trait]
impl Filter for ServiceResolverFilter {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn handle(&self, _ctx: &mut ProcessingContext, message: &Message) -> anyhow::Result<()> {
        let MessageBody::StateChange(change) = message.body() else {
            return Ok(());
        };

        let service = change
            .container
            .as_ref()
            .and_then(|info| info.label(&self.service_key_label));

        match service {
            Some(service) => info!(
                container.name = %change.container_name(),
                service = %service,
                "state => {}",
                change.state
            ),
            None => {
                warn!(
                    container.name = %change.container_name(),
                    label = %self.service_key_label,
                    "service key label missing"
                );
                info!(container.name = %change.container_name(), "state => {}", change.state);
            }
        }

        Ok(())
    }
}
