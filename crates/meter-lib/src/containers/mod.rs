//! Container introspection backends
//!
//! A [`ContainerDriver`] enumerates running containers, watches their
//! lifecycle events and opens per-container usage channels. The pipeline
//! only ever talks to this trait; [`CgroupDriver`] reads the cgroup v2
//! hierarchy and [`MockDriver`] is an in-memory backend for tests.

mod cgroup;
mod mock;
mod watcher;

pub use cgroup::CgroupDriver;
pub use mock::MockDriver;

use crate::models::{ContainerEvent, ContainerInfo, EventType, Usage};
use async_trait::async_trait;
use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("container not found: {0}")]
    NotFound(String),
    #[error("container driver unavailable: {0}")]
    Unavailable(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to watch container events: {0}")]
    Watch(#[from] notify::Error),
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Introspection backend consumed by the meter
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Containers currently running on the host
    async fn list_containers(&self) -> DriverResult<Vec<ContainerInfo>>;

    /// Stream lifecycle events of the given types
    async fn watch_events(&self, types: &[EventType]) -> DriverResult<EventStream>;

    /// Current descriptor of one container
    async fn get_container(&self, name: &str) -> DriverResult<ContainerInfo>;

    /// Open a channel of usage snapshots for one container
    async fn open_usage_channel(&self, name: &str) -> DriverResult<UsageChannel>;

    /// The only label keys this backend ever sets, or `None` when it passes
    /// the runtime's labels through
    fn label_keys(&self) -> Option<&'static [&'static str]> {
        None
    }
}

/// Per-container stream of usage snapshots
///
/// The producing side notices the channel being closed or dropped and stops
/// sampling. Once every sender is gone the channel reports itself as
/// disconnected, which means the backend lost the container.
#[derive(Debug)]
pub struct UsageChannel {
    container: Arc<ContainerInfo>,
    receiver: mpsc::Receiver<Usage>,
}

impl UsageChannel {
    pub fn new(container: Arc<ContainerInfo>, receiver: mpsc::Receiver<Usage>) -> Self {
        Self {
            container,
            receiver,
        }
    }

    /// Create a channel together with the sender a backend feeds it from
    pub fn open(container: Arc<ContainerInfo>, capacity: usize) -> (mpsc::Sender<Usage>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self::new(container, rx))
    }

    pub fn container(&self) -> &Arc<ContainerInfo> {
        &self.container
    }

    pub fn name(&self) -> &str {
        &self.container.name
    }

    /// Non-blocking read of the next snapshot
    pub fn try_recv(&mut self) -> Result<Usage, TryRecvError> {
        self.receiver.try_recv()
    }

    pub async fn recv(&mut self) -> Option<Usage> {
        self.receiver.recv().await
    }

    /// Release the channel against the backend
    pub fn close(mut self) {
        self.receiver.close();
    }
}

/// Stream of lifecycle events from a backend
///
/// Dropping the stream stops the watch.
pub struct EventStream {
    receiver: mpsc::Receiver<ContainerEvent>,
    _guard: Option<Box<dyn Any + Send>>,
}

impl EventStream {
    pub fn new(receiver: mpsc::Receiver<ContainerEvent>) -> Self {
        Self {
            receiver,
            _guard: None,
        }
    }

    /// Keep `guard` alive for as long as the stream is
    pub fn with_guard(
        receiver: mpsc::Receiver<ContainerEvent>,
        guard: impl Any + Send,
    ) -> Self {
        Self {
            receiver,
            _guard: Some(Box::new(guard)),
        }
    }

    pub async fn recv(&mut self) -> Option<ContainerEvent> {
        self.receiver.recv().await
    }

    pub fn close(mut self) {
        self.receiver.close();
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream").finish_non_exhaustive()
    }
}

/// Parameters for building a container driver
#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub cgroup_root: PathBuf,
    pub proc_root: PathBuf,
    /// How often a usage channel is fed
    pub sample_rate: Duration,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            proc_root: PathBuf::from("/proc"),
            sample_rate: Duration::from_secs(10),
        }
    }
}

/// Events the agent subscribes to
pub const WATCHED_EVENTS: [EventType; 4] = [
    EventType::Creation,
    EventType::Deletion,
    EventType::Oom,
    EventType::OomKill,
];
