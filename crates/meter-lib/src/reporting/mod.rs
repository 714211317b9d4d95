//! Reporting backends
//!
//! Reports wrap samples and state transitions with the identity of the
//! meter that produced them. A [`Reporter`] delivers a report and hands back
//! a receipt proving it was accepted.

mod http;
mod mock;

pub use http::HttpReporter;
pub use mock::MockReporter;

use crate::models::{Sample, StateChange};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Event type of reports carrying a usage sample
pub const EVENT_SAMPLE: &str = "stat_sample";
/// Event type of reports carrying a state transition
pub const EVENT_STATE_CHANGE: &str = "state_change";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReportData {
    StateChange(StateChange),
    Sample(Sample),
}

impl ReportData {
    pub fn container_name(&self) -> &str {
        match self {
            ReportData::StateChange(change) => change.container_name(),
            ReportData::Sample(sample) => &sample.container.name,
        }
    }
}

/// A report sent to the reporting backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub meter_id: String,
    pub event_type: String,
    /// Unix seconds at generation
    pub timestamp: i64,
    pub data: ReportData,
}

impl Report {
    pub fn for_sample(meter_id: impl Into<String>, sample: Sample) -> Self {
        Self::generate(meter_id, EVENT_SAMPLE, ReportData::Sample(sample))
    }

    pub fn for_state_change(meter_id: impl Into<String>, change: StateChange) -> Self {
        Self::generate(meter_id, EVENT_STATE_CHANGE, ReportData::StateChange(change))
    }

    fn generate(meter_id: impl Into<String>, event_type: &str, data: ReportData) -> Self {
        Self {
            meter_id: meter_id.into(),
            event_type: event_type.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            data,
        }
    }
}

/// Proof of acceptance returned by the reporting backend
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Receipt(pub String);

impl Receipt {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Receipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum ReportingError {
    #[error("invalid endpoint url: {0}")]
    InvalidEndpoint(String),
    #[error("invalid http method: {0}")]
    InvalidMethod(String),
    #[error("invalid header {0}")]
    InvalidHeader(String),
    #[error("received an invalid or empty receipt")]
    InvalidReceipt,
    #[error("unexpected response: {0}")]
    UnexpectedStatus(String),
    #[error("error sending report: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("error encoding report: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("reporting backend unavailable: {0}")]
    Unavailable(String),
}

/// Delivery backend for reports
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn report(&self, report: &Report) -> Result<Receipt, ReportingError>;
}

/// Parameters for building a reporting backend
#[derive(Debug, Clone)]
pub struct ReporterSettings {
    pub url: Option<String>,
    pub method: String,
    pub receipt_header: String,
    /// Extra headers added to every request
    pub headers: HashMap<String, String>,
    pub timeout: Duration,
    /// Meter version announced to the backend
    pub version: String,
}

impl Default for ReporterSettings {
    fn default() -> Self {
        Self {
            url: None,
            method: "POST".to_string(),
            receipt_header: http::DEFAULT_RECEIPT_HEADER.to_string(),
            headers: HashMap::new(),
            timeout: Duration::from_secs(30),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
