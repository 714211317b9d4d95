//! Agent configuration
//!
//! An optional file (YAML, TOML or JSON, picked by extension) layered under
//! environment variables such as `METER__COLLECTOR__RATE_MS`.

use anyhow::{bail, Context, Result};
use meter_lib::agent::{DEFAULT_SERVICE_KEY_LABEL, DEFAULT_TRACK_LABEL};
use meter_lib::collector::CollectorConfig;
use meter_lib::containers::DriverSettings;
use meter_lib::pipeline::DispatcherConfig;
use meter_lib::registry::TrackingPolicy;
use meter_lib::reporting::ReporterSettings;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "METER";
const LOG_LEVELS: [&str; 4] = ["error", "warn", "info", "debug"];

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Meter identity attached to every report
    #[serde(default = "default_instance_id")]
    pub instance_id: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub collector: CollectorSection,

    #[serde(default)]
    pub tracking: TrackingSection,

    #[serde(default)]
    pub containers: ContainersSection,

    #[serde(default)]
    pub reporting: ReportingSection,

    #[serde(default)]
    pub dispatcher: DispatcherSection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectorSection {
    #[serde(default = "default_rate_ms")]
    pub rate_ms: u64,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackingSection {
    #[serde(default = "default_track_label")]
    pub label: String,
    /// Environment variable that also marks a container trackable
    #[serde(default)]
    pub env: String,
    #[serde(default = "default_service_key_label")]
    pub service_key_label: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainersSection {
    #[serde(default = "default_container_driver")]
    pub driver: String,
    #[serde(default = "default_cgroup_root")]
    pub cgroup_root: PathBuf,
    #[serde(default = "default_proc_root")]
    pub proc_root: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportingSection {
    #[serde(default = "default_reporting_driver")]
    pub driver: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub receipt_header: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherSection {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

fn default_instance_id() -> String {
    std::env::var("NODE_NAME")
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

fn default_rate_ms() -> u64 {
    10_000
}

fn default_buffer_size() -> usize {
    3000
}

fn default_track_label() -> String {
    DEFAULT_TRACK_LABEL.to_string()
}

fn default_service_key_label() -> String {
    DEFAULT_SERVICE_KEY_LABEL.to_string()
}

fn default_container_driver() -> String {
    "cgroup".to_string()
}

fn default_cgroup_root() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup")
}

fn default_proc_root() -> PathBuf {
    PathBuf::from("/proc")
}

fn default_reporting_driver() -> String {
    "mock".to_string()
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_workers() -> usize {
    4
}

fn default_queue_size() -> usize {
    1024
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for CollectorSection {
    fn default() -> Self {
        Self {
            rate_ms: default_rate_ms(),
            buffer_size: default_buffer_size(),
        }
    }
}

impl Default for TrackingSection {
    fn default() -> Self {
        Self {
            label: default_track_label(),
            env: String::new(),
            service_key_label: default_service_key_label(),
        }
    }
}

impl Default for ContainersSection {
    fn default() -> Self {
        Self {
            driver: default_container_driver(),
            cgroup_root: default_cgroup_root(),
            proc_root: default_proc_root(),
        }
    }
}

impl Default for ReportingSection {
    fn default() -> Self {
        Self {
            driver: default_reporting_driver(),
            url: None,
            method: default_method(),
            receipt_header: None,
            headers: HashMap::new(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_size: default_queue_size(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with(path, Self::environment())
    }

    fn environment() -> config::Environment {
        config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
    }

    fn load_with(path: Option<&Path>, environment: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let config: AgentConfig = builder
            .add_source(environment)
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !LOG_LEVELS.contains(&self.log.level.as_str()) {
            bail!(
                "invalid log level '{}', expected one of: {}",
                self.log.level,
                LOG_LEVELS.join(", ")
            );
        }
        if self.collector.rate_ms == 0 {
            bail!("collector.rate_ms must be greater than zero");
        }
        Ok(())
    }

    pub fn collector_config(&self) -> CollectorConfig {
        CollectorConfig {
            rate: Duration::from_millis(self.collector.rate_ms),
            buffer_size: self.collector.buffer_size,
        }
    }

    pub fn tracking_policy(&self) -> TrackingPolicy {
        TrackingPolicy::new(&self.tracking.label, &self.tracking.env)
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            workers: self.dispatcher.workers,
            queue_size: self.dispatcher.queue_size,
        }
    }

    pub fn driver_settings(&self) -> DriverSettings {
        DriverSettings {
            cgroup_root: self.containers.cgroup_root.clone(),
            proc_root: self.containers.proc_root.clone(),
            sample_rate: Duration::from_millis(self.collector.rate_ms),
        }
    }

    pub fn reporter_settings(&self) -> ReporterSettings {
        let defaults = ReporterSettings::default();
        ReporterSettings {
            url: self.reporting.url.clone(),
            method: self.reporting.method.clone(),
            receipt_header: self
                .reporting
                .receipt_header
                .clone()
                .unwrap_or(defaults.receipt_header),
            headers: self.reporting.headers.clone(),
            timeout: Duration::from_secs(self.reporting.timeout_secs),
            version: defaults.version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn env(vars: &[(&str, &str)]) -> config::Environment {
        let source = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<config::Map<String, String>>();
        AgentConfig::environment().source(Some(source))
    }

    fn yaml(content: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = AgentConfig::load_with(None, env(&[])).unwrap();

        assert!(!config.instance_id.is_empty());
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.log.level, "info");
        assert_eq!(config.log.format, LogFormat::Text);
        assert_eq!(config.collector.rate_ms, 10_000);
        assert_eq!(config.collector.buffer_size, 3000);
        assert_eq!(config.tracking.label, "com.usage-meter.track");
        assert_eq!(config.tracking.env, "");
        assert_eq!(config.tracking.service_key_label, "com.usage-meter.service");
        assert_eq!(config.containers.driver, "cgroup");
        assert_eq!(config.containers.cgroup_root, PathBuf::from("/sys/fs/cgroup"));
        assert_eq!(config.reporting.driver, "mock");
        assert_eq!(config.reporting.method, "POST");
        assert_eq!(config.reporting.timeout_secs, 30);
        assert_eq!(config.dispatcher.workers, 4);
        assert_eq!(config.dispatcher.queue_size, 1024);

        let settings = config.reporter_settings();
        assert_eq!(settings.receipt_header, "X-Meter-Receipt");
        assert_eq!(settings.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_file_values() {
        let file = yaml(
            r#"
instance_id: node-7
api_port: 9100
log:
  level: debug
  format: json
collector:
  rate_ms: 5000
tracking:
  label: acme.track
  env: ACME_TRACK
containers:
  driver: mock
reporting:
  driver: http
  url: http://collector.local/events
  method: put
  receipt_header: X-Receipt
  headers:
    x-api-key: abc123
dispatcher:
  workers: 2
"#,
        );

        let config = AgentConfig::load_with(Some(file.path()), env(&[])).unwrap();

        assert_eq!(config.instance_id, "node-7");
        assert_eq!(config.api_port, 9100);
        assert_eq!(config.log.format, LogFormat::Json);
        assert_eq!(config.collector_config().rate, Duration::from_secs(5));
        assert_eq!(config.collector_config().buffer_size, 3000);
        assert_eq!(config.driver_settings().sample_rate, Duration::from_secs(5));
        assert_eq!(config.tracking_policy().env_key(), "acme_track");
        assert_eq!(config.containers.driver, "mock");
        assert_eq!(config.dispatcher_config().workers, 2);
        assert_eq!(config.dispatcher_config().queue_size, 1024);

        let settings = config.reporter_settings();
        assert_eq!(settings.url.as_deref(), Some("http://collector.local/events"));
        assert_eq!(settings.method, "put");
        assert_eq!(settings.receipt_header, "X-Receipt");
        assert_eq!(
            settings.headers.get("x-api-key").map(String::as_str),
            Some("abc123")
        );
    }

    #[test]
    fn test_environment_overrides_file() {
        let file = yaml("api_port: 9100\ncollector:\n  rate_ms: 5000\n");

        let config = AgentConfig::load_with(
            Some(file.path()),
            env(&[
                ("METER__API_PORT", "9200"),
                ("METER__COLLECTOR__RATE_MS", "1000"),
                ("METER__REPORTING__DRIVER", "http"),
            ]),
        )
        .unwrap();

        assert_eq!(config.api_port, 9200);
        assert_eq!(config.collector.rate_ms, 1000);
        assert_eq!(config.reporting.driver, "http");
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let err =
            AgentConfig::load_with(None, env(&[("METER__LOG__LEVEL", "trace")])).unwrap_err();
        assert!(err.to_string().contains("invalid log level 'trace'"));
    }

    #[test]
    fn test_zero_rate_rejected() {
        let file = yaml("collector:\n  rate_ms: 0\n");
        assert!(AgentConfig::load_with(Some(file.path()), env(&[])).is_err());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = AgentConfig::load_with(Some(Path::new("/nonexistent/meter.yaml")), env(&[]));
        assert!(result.is_err());
    }
}
