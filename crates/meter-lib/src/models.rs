//! Core data models for the usage meter
//!
//! Containers, their lifecycle events and the usage snapshots taken while
//! they run. Everything here is plain data: the introspection backend builds
//! it, the pipeline routes it and the reporting backend serializes it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Host the containers are running on
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineInfo {
    pub system_uuid: String,
    pub cores: u32,
    pub memory_bytes: u64,
    pub cpu_frequency_khz: u64,
}

/// Capacity reserved for a container (cpu in cores, memory in bytes)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservedResources {
    pub cpu: f64,
    pub memory: u64,
}

/// Descriptor of a container as reported by the introspection backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    /// Unique per host
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Environment with lower-cased keys
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub image_name: String,
    #[serde(default)]
    pub image_tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine: Option<MachineInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserved: Option<ReservedResources>,
}

impl ContainerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Add an environment variable; the key is stored lower-cased
    pub fn with_env(mut self, key: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.env
            .insert(key.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_image(mut self, name: impl Into<String>, tag: impl Into<String>) -> Self {
        self.image_name = name.into();
        self.image_tag = tag.into();
        self
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Container lifecycle event types
///
/// `Existed` and `MeterShutdown` are synthetic: the first is emitted for
/// containers found running at startup, the second for containers still
/// tracked when the agent stops. Tags the meter does not know are kept
/// verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    Creation,
    Deletion,
    Oom,
    OomKill,
    Existed,
    MeterShutdown,
    Other(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::Creation => "container_creation",
            EventType::Deletion => "container_deletion",
            EventType::Oom => "oom",
            EventType::OomKill => "oom_kill",
            EventType::Existed => "container_existed",
            EventType::MeterShutdown => "meter_shutdown",
            EventType::Other(tag) => tag,
        }
    }
}

impl From<&str> for EventType {
    fn from(tag: &str) -> Self {
        match tag {
            "container_creation" => EventType::Creation,
            "container_deletion" => EventType::Deletion,
            "oom" => EventType::Oom,
            "oom_kill" => EventType::OomKill,
            "container_existed" => EventType::Existed,
            "meter_shutdown" => EventType::MeterShutdown,
            other => EventType::Other(other.to_string()),
        }
    }
}

impl From<String> for EventType {
    fn from(tag: String) -> Self {
        EventType::from(tag.as_str())
    }
}

impl From<EventType> for String {
    fn from(event_type: EventType) -> Self {
        event_type.as_str().to_string()
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state derived from an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Running,
    Stopped,
    Unknown,
}

impl ContainerState {
    /// Pure mapping from event type to the state it implies
    pub fn from_event(event_type: &EventType) -> Self {
        match event_type {
            EventType::Creation | EventType::Existed => ContainerState::Running,
            EventType::Deletion
            | EventType::Oom
            | EventType::OomKill
            | EventType::MeterShutdown => ContainerState::Stopped,
            EventType::Other(_) => ContainerState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Running => "running",
            ContainerState::Stopped => "stopped",
            ContainerState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A container lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub container_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<Arc<ContainerInfo>>,
    /// Unix seconds
    pub timestamp: i64,
}

impl ContainerEvent {
    pub fn new(event_type: EventType, container_name: impl Into<String>) -> Self {
        Self {
            event_type,
            container_name: container_name.into(),
            container: None,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    /// Synthetic event for a container that was already running at startup
    pub fn existed(container: Arc<ContainerInfo>) -> Self {
        Self::for_container(EventType::Existed, container)
    }

    /// Synthetic event for a container still tracked when the meter stops
    pub fn meter_shutdown(container: Arc<ContainerInfo>) -> Self {
        Self::for_container(EventType::MeterShutdown, container)
    }

    fn for_container(event_type: EventType, container: Arc<ContainerInfo>) -> Self {
        Self {
            event_type,
            container_name: container.name.clone(),
            container: Some(container),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// A container's state transition, derived from a lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub state: ContainerState,
    #[serde(rename = "source_event")]
    pub source: ContainerEvent,
    /// Resolved descriptor; absent until a filter resolves it
    #[serde(default)]
    pub container: Option<Arc<ContainerInfo>>,
}

impl StateChange {
    /// Derive the transition from an event, keeping any descriptor it carries
    pub fn from_event(source: ContainerEvent) -> Self {
        Self {
            state: ContainerState::from_event(&source.event_type),
            container: source.container.clone(),
            source,
        }
    }

    pub fn with_container(mut self, container: Arc<ContainerInfo>) -> Self {
        self.container = Some(container);
        self
    }

    /// Name of the container this transition is about
    pub fn container_name(&self) -> &str {
        match &self.container {
            Some(info) => &info.name,
            None => &self.source.container_name,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.container.is_some()
    }
}

/// Memory usage in bytes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterfaceUsage {
    pub name: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkUsage {
    pub total_rx_bytes: u64,
    pub total_tx_bytes: u64,
    #[serde(default)]
    pub interfaces: Vec<InterfaceUsage>,
}

/// CPU time consumed, in nanoseconds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuUsage {
    pub total: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub per_core: Vec<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskUsage {
    /// Bytes read and written per block device
    #[serde(default, rename = "per_disk_io_bytes", skip_serializing_if = "Vec::is_empty")]
    pub per_disk_io: Vec<u64>,
}

/// One usage snapshot from the introspection backend
///
/// Opaque to the pipeline; it is only carried through to the reporter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<DiskUsage>,
}

/// A periodic usage snapshot produced by the sampling collector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub container: Arc<ContainerInfo>,
    pub usage: Usage,
    /// Unix seconds at capture
    pub timestamp: i64,
    /// Sampling interval in effect when the sample was captured
    #[serde(rename = "frame_size_ms", with = "duration_ms")]
    pub frame_size: Duration,
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_from_event() {
        assert_eq!(
            ContainerState::from_event(&EventType::Creation),
            ContainerState::Running
        );
        assert_eq!(
            ContainerState::from_event(&EventType::Existed),
            ContainerState::Running
        );
        assert_eq!(
            ContainerState::from_event(&EventType::Deletion),
            ContainerState::Stopped
        );
        assert_eq!(
            ContainerState::from_event(&EventType::Oom),
            ContainerState::Stopped
        );
        assert_eq!(
            ContainerState::from_event(&EventType::OomKill),
            ContainerState::Stopped
        );
        assert_eq!(
            ContainerState::from_event(&EventType::from("container_paused")),
            ContainerState::Unknown
        );
    }

    #[test]
    fn test_event_type_tags() {
        assert_eq!(EventType::from("oom_kill"), EventType::OomKill);
        assert_eq!(EventType::OomKill.as_str(), "oom_kill");
        assert_eq!(
            EventType::from("restart"),
            EventType::Other("restart".to_string())
        );

        let json = serde_json::to_string(&EventType::Creation).unwrap();
        assert_eq!(json, "\"container_creation\"");
    }

    #[test]
    fn test_env_keys_are_lower_cased() {
        let info = ContainerInfo::new("web-1").with_env("METER_TRACK", "1");
        assert_eq!(info.env.get("meter_track"), Some(&"1".to_string()));
        assert!(info.env.get("METER_TRACK").is_none());
    }

    #[test]
    fn test_state_change_name_falls_back_to_event() {
        let change = StateChange::from_event(ContainerEvent::new(EventType::Deletion, "web-1"));
        assert_eq!(change.state, ContainerState::Stopped);
        assert_eq!(change.container_name(), "web-1");
        assert!(!change.is_resolved());

        let resolved = change.with_container(Arc::new(ContainerInfo::new("web-1")));
        assert!(resolved.is_resolved());
    }

    #[test]
    fn test_sample_serializes_frame_size_in_millis() {
        let sample = Sample {
            container: Arc::new(ContainerInfo::new("web-1")),
            usage: Usage::default(),
            timestamp: 1_700_000_000,
            frame_size: Duration::from_secs(10),
        };

        let value = serde_json::to_value(&sample).unwrap();
        assert_eq!(value["frame_size_ms"], 10_000);
        assert_eq!(value["container"]["name"], "web-1");
    }
}
