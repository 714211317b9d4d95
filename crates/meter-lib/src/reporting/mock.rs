use super::{Receipt, Report, Reporter, ReportingError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::info;

/// Reporter that accepts everything and keeps what it was sent
///
/// Receipts are `event#N`, numbered from 1.
#[derive(Debug, Default)]
pub struct MockReporter {
    counter: AtomicU64,
    failing: AtomicBool,
    reports: Mutex<Vec<Report>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent reports fail with `Unavailable`
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn reports(&self) -> Vec<Report> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of reports accepted so far
    pub fn count(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Reporter for MockReporter {
    async fn report(&self, report: &Report) -> Result<Receipt, ReportingError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ReportingError::Unavailable("mock reporter set to fail".into()));
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(report.clone());

        info!(
            report.number = n,
            report.event_type = %report.event_type,
            container.name = %report.data.container_name(),
            "mock report"
        );
        Ok(Receipt(format!("event#{}", n)))
    }
}
