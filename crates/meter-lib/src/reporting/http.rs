//! HTTP reporting backend
//!
//! Each report is sent as a JSON body to a fixed endpoint. The backend must
//! answer with a 2xx status and put a non-empty receipt in the configured
//! response header.

use super::{Receipt, Report, Reporter, ReporterSettings, ReportingError};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::{Client, Method};
use tracing::debug;
use url::Url;

const CLIENT_USER_AGENT: &str = "usage-meter-http-reporter";
const CLIENT_VERSION_HEADER: &str = "X-Meter-Version";
pub(super) const DEFAULT_RECEIPT_HEADER: &str = "X-Meter-Receipt";

pub struct HttpReporter {
    client: Client,
    endpoint: Url,
    method: Method,
    receipt_header: HeaderName,
    headers: HeaderMap,
}

impl HttpReporter {
    pub fn new(settings: &ReporterSettings) -> Result<Self, ReportingError> {
        let endpoint = match settings.url.as_deref() {
            None | Some("") => {
                return Err(ReportingError::InvalidEndpoint("no url configured".into()))
            }
            Some(raw) => {
                Url::parse(raw).map_err(|e| ReportingError::InvalidEndpoint(e.to_string()))?
            }
        };
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(ReportingError::InvalidEndpoint(format!(
                "unsupported scheme {}",
                endpoint.scheme()
            )));
        }

        let method = if settings.method.is_empty() {
            Method::POST
        } else {
            Method::from_bytes(settings.method.to_ascii_uppercase().as_bytes())
                .map_err(|_| ReportingError::InvalidMethod(settings.method.clone()))?
        };

        let receipt_header = if settings.receipt_header.is_empty() {
            DEFAULT_RECEIPT_HEADER
        } else {
            settings.receipt_header.as_str()
        };
        let receipt_header = header_name(receipt_header)?;

        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            header_value(&format!("{}/{}", CLIENT_USER_AGENT, settings.version))?,
        );
        headers.insert(
            header_name(CLIENT_VERSION_HEADER)?,
            header_value(&settings.version)?,
        );
        for (name, value) in &settings.headers {
            headers.append(header_name(name)?, header_value(value)?);
        }

        let client = Client::builder().timeout(settings.timeout).build()?;

        Ok(Self {
            client,
            endpoint,
            method,
            receipt_header,
            headers,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

fn header_name(name: &str) -> Result<HeaderName, ReportingError> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| ReportingError::InvalidHeader(format!("name {:?}", name)))
}

fn header_value(value: &str) -> Result<HeaderValue, ReportingError> {
    HeaderValue::from_str(value)
        .map_err(|_| ReportingError::InvalidHeader(format!("value {:?}", value)))
}

#[async_trait]
impl Reporter for HttpReporter {
    async fn report(&self, report: &Report) -> Result<Receipt, ReportingError> {
        let body = serde_json::to_vec(report)?;

        let response = self
            .client
            .request(self.method.clone(), self.endpoint.clone())
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ReportingError::UnexpectedStatus(status.to_string()));
        }

        let receipt = response
            .headers()
            .get(&self.receipt_header)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or(ReportingError::InvalidReceipt)?;

        debug!(endpoint = %self.endpoint, receipt = %receipt, "report accepted");
        Ok(Receipt(receipt.to_string()))
    }
}
