use crate::health::{components, HealthRegistry};
use crate::message::{Message, MessageBody};
use crate::observability::{MeterMetrics, StructuredLogger};
use crate::pipeline::{Filter, ProcessingContext};
use crate::reporting::Reporter;
use anyhow::Context;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

pub const NAME: &str = "reporter";

/// Delivers reports; a delivered report ends processing
pub struct ReporterFilter {
    reporter: Arc<dyn Reporter>,
    logger: StructuredLogger,
    health: Option<HealthRegistry>,
    metrics: MeterMetrics,
}

impl ReporterFilter {
    pub fn new(reporter: Arc<dyn Reporter>, logger: StructuredLogger) -> Self {
        Self {
            reporter,
            logger,
            health: None,
            metrics: MeterMetrics::new(),
        }
    }

    /// Reflect delivery outcomes in the reporter's health
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }
}

#[async_trait]
impl Filter for ReporterFilter {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn handle(&self, ctx: &mut ProcessingContext, message: &Message) -> anyhow::Result<()> {
        let MessageBody::SendReport(report) = message.body() else {
            return Ok(());
        };
        let container = report.data.container_name();

        let start = Instant::now();
        match self.reporter.report(report).await {
            Ok(receipt) => {
                self.metrics
                    .observe_report_sent(start.elapsed().as_secs_f64());
                self.logger
                    .log_report_sent(&report.event_type, container, receipt.as_str());
                if let Some(health) = &self.health {
                    health.set_healthy(components::REPORTER).await;
                }
                ctx.stop();
                Ok(())
            }
            Err(e) => {
                self.metrics.inc_reports_failed();
                self.logger
                    .log_report_failed(&report.event_type, container, &e.to_string());
                if let Some(health) = &self.health {
                    health
                        .set_degraded(components::REPORTER, format!("last report failed: {}", e))
                        .await;
                }
                Err(e).context("error performing report")
            }
        }
    }
}
