//! Observability infrastructure for the meter
//!
//! Provides:
//! - Prometheus metrics (message throughput, filter failures, sampling and reporting)
//! - Structured logging of lifecycle events with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for report delivery latency (in seconds)
const REPORT_LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

static GLOBAL_METRICS: OnceLock<MeterMetricsInner> = OnceLock::new();

struct MeterMetricsInner {
    messages_total: IntCounterVec,
    filter_errors_total: IntCounterVec,
    unhandled_messages_total: IntCounter,
    samples_emitted_total: IntCounter,
    samples_dropped_total: IntCounter,
    containers_tracked: IntGauge,
    collections_active: IntGauge,
    reports_sent_total: IntCounter,
    reports_failed_total: IntCounter,
    report_latency_seconds: Histogram,
}

impl MeterMetricsInner {
    fn new() -> Self {
        Self {
            messages_total: register_int_counter_vec!(
                "meter_agent_messages_total",
                "Messages dispatched into the pipeline, by type",
                &["type"]
            )
            .expect("Failed to register messages_total"),

            filter_errors_total: register_int_counter_vec!(
                "meter_agent_filter_errors_total",
                "Messages whose processing failed, by failing filter",
                &["filter"]
            )
            .expect("Failed to register filter_errors_total"),

            unhandled_messages_total: register_int_counter!(
                "meter_agent_unhandled_messages_total",
                "Messages that reached the end of the pipeline unhandled"
            )
            .expect("Failed to register unhandled_messages_total"),

            samples_emitted_total: register_int_counter!(
                "meter_agent_samples_emitted_total",
                "Usage samples emitted by the sampling collector"
            )
            .expect("Failed to register samples_emitted_total"),

            samples_dropped_total: register_int_counter!(
                "meter_agent_samples_dropped_total",
                "Usage samples dropped because the sample channel was full"
            )
            .expect("Failed to register samples_dropped_total"),

            containers_tracked: register_int_gauge!(
                "meter_agent_containers_tracked",
                "Number of containers currently registered"
            )
            .expect("Failed to register containers_tracked"),

            collections_active: register_int_gauge!(
                "meter_agent_collections_active",
                "Number of containers currently being sampled"
            )
            .expect("Failed to register collections_active"),

            reports_sent_total: register_int_counter!(
                "meter_agent_reports_sent_total",
                "Reports accepted by the reporting backend"
            )
            .expect("Failed to register reports_sent_total"),

            reports_failed_total: register_int_counter!(
                "meter_agent_reports_failed_total",
                "Reports the reporting backend failed to accept"
            )
            .expect("Failed to register reports_failed_total"),

            report_latency_seconds: register_histogram!(
                "meter_agent_report_latency_seconds",
                "Time spent delivering a report",
                REPORT_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register report_latency_seconds"),
        }
    }
}

/// Handle to the process-wide meter metrics
///
/// Clones share the same underlying collectors.
#[derive(Clone)]
pub struct MeterMetrics {
    inner: &'static MeterMetricsInner,
}

impl Default for MeterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MeterMetrics {
    pub fn new() -> Self {
        Self {
            inner: GLOBAL_METRICS.get_or_init(MeterMetricsInner::new),
        }
    }

    pub fn inc_messages(&self, message_type: &str) {
        self.inner
            .messages_total
            .with_label_values(&[message_type])
            .inc();
    }

    pub fn inc_filter_errors(&self, filter: &str) {
        self.inner
            .filter_errors_total
            .with_label_values(&[filter])
            .inc();
    }

    pub fn inc_unhandled(&self) {
        self.inner.unhandled_messages_total.inc();
    }

    pub fn inc_samples_emitted(&self) {
        self.inner.samples_emitted_total.inc();
    }

    pub fn inc_samples_dropped(&self) {
        self.inner.samples_dropped_total.inc();
    }

    pub fn set_containers_tracked(&self, count: usize) {
        self.inner.containers_tracked.set(count as i64);
    }

    pub fn set_collections_active(&self, count: usize) {
        self.inner.collections_active.set(count as i64);
    }

    /// Record a delivered report and how long delivery took
    pub fn observe_report_sent(&self, duration_secs: f64) {
        self.inner.reports_sent_total.inc();
        self.inner.report_latency_seconds.observe(duration_secs);
    }

    pub fn inc_reports_failed(&self) {
        self.inner.reports_failed_total.inc();
    }
}

/// Structured logger for meter lifecycle events
#[derive(Clone)]
pub struct StructuredLogger {
    meter_id: String,
}

impl StructuredLogger {
    pub fn new(meter_id: impl Into<String>) -> Self {
        Self {
            meter_id: meter_id.into(),
        }
    }

    pub fn meter_id(&self) -> &str {
        &self.meter_id
    }

    pub fn log_startup(&self, version: &str, driver: &str, reporter: &str) {
        info!(
            event = "meter_started",
            meter = %self.meter_id,
            meter_version = %version,
            container_driver = %driver,
            reporting_driver = %reporter,
            "Usage meter started"
        );
    }

    pub fn log_shutdown(&self, reason: &str, tracked: usize) {
        info!(
            event = "meter_shutdown",
            meter = %self.meter_id,
            reason = %reason,
            tracked_containers = tracked,
            "Usage meter shutting down"
        );
    }

    /// A container entered the registry
    pub fn log_container_tracked(&self, name: &str, image: &str, source_event: &str) {
        info!(
            event = "container_tracked",
            meter = %self.meter_id,
            container.name = %name,
            container.image = %image,
            source_event = %source_event,
            "Tracking container"
        );
    }

    /// A container left the registry
    pub fn log_container_dropped(&self, name: &str, source_event: &str) {
        info!(
            event = "container_dropped",
            meter = %self.meter_id,
            container.name = %name,
            source_event = %source_event,
            "Stopped tracking container"
        );
    }

    pub fn log_report_sent(&self, event_type: &str, container: &str, receipt: &str) {
        info!(
            event = "report_sent",
            meter = %self.meter_id,
            report.event_type = %event_type,
            container.name = %container,
            receipt = %receipt,
            "Report accepted"
        );
    }

    pub fn log_report_failed(&self, event_type: &str, container: &str, error: &str) {
        warn!(
            event = "report_failed",
            meter = %self.meter_id,
            report.event_type = %event_type,
            container.name = %container,
            error = %error,
            "Report delivery failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meter_metrics_handles_share_collectors() {
        let first = MeterMetrics::new();
        let second = MeterMetrics::new();

        first.inc_messages("state_change");
        second.inc_messages("state_change");
        first.inc_filter_errors("reporter");
        first.set_containers_tracked(3);
        first.observe_report_sent(0.02);

        let count = second
            .inner
            .messages_total
            .with_label_values(&["state_change"])
            .get();
        assert!(count >= 2);
        assert_eq!(second.inner.containers_tracked.get(), 3);
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("node-a");
        assert_eq!(logger.meter_id(), "node-a");
    }
}
