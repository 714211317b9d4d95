use crate::message::{Message, MessageBody};
use crate::pipeline::{Filter, ProcessingContext};
use crate::reporting::Report;
use async_trait::async_trait;

pub const NAME: &str = "report_generator";

/// Wraps samples and state changes into reports stamped with the meter id
pub struct ReportGeneratorFilter {
    meter_id: String,
}

impl ReportGeneratorFilter {
    pub fn new(meter_id: impl Into<String>) -> Self {
        Self {
            meter_id: meter_id.into(),
        }
    }
}

#[async_trait]
impl Filter for ReportGeneratorFilter {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn handle(&self, ctx: &mut ProcessingContext, message: &Message) -> anyhow::Result<()> {
        let report = match message.body() {
            MessageBody::Sample(sample) => Report::for_sample(&self.meter_id, sample.clone()),
            MessageBody::StateChange(change) => {
                Report::for_state_change(&self.meter_id, change.clone())
            }
            _ => return Ok(()),
        };

        ctx.set_message(Message::send_report(report));
        Ok(())
    }
}
