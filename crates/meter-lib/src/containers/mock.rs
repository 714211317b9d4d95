//! In-memory container driver
//!
//! Containers, lifecycle events and usage snapshots are injected by hand,
//! which makes the backend usable in tests and in dry runs of the agent.

use super::{ContainerDriver, DriverError, DriverResult, EventStream, UsageChannel};
use crate::models::{ContainerEvent, ContainerInfo, EventType, Usage};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

const EVENT_BUFFER_SIZE: usize = 256;
const USAGE_BUFFER_SIZE: usize = 64;

#[derive(Default)]
struct MockState {
    containers: HashMap<String, ContainerInfo>,
    watchers: Vec<(Vec<EventType>, mpsc::Sender<ContainerEvent>)>,
    feeds: HashMap<String, mpsc::Sender<Usage>>,
    opened: HashMap<String, usize>,
}

/// Driver backed by in-memory state
#[derive(Default)]
pub struct MockDriver {
    state: Mutex<MockState>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a driver that already knows `containers`
    pub fn with_containers(containers: impl IntoIterator<Item = ContainerInfo>) -> Self {
        let driver = Self::new();
        for info in containers {
            driver.add_container(info);
        }
        driver
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_container(&self, info: ContainerInfo) {
        self.state().containers.insert(info.name.clone(), info);
    }

    /// Forget a container and disconnect its usage channel
    pub fn remove_container(&self, name: &str) {
        let mut state = self.state();
        state.containers.remove(name);
        state.feeds.remove(name);
    }

    /// Deliver an event to every watcher subscribed to its type
    ///
    /// Returns the number of watchers that received it.
    pub fn emit(&self, event: ContainerEvent) -> usize {
        let mut state = self.state();
        state.watchers.retain(|(_, tx)| !tx.is_closed());

        state
            .watchers
            .iter()
            .filter(|(types, _)| types.contains(&event.event_type))
            .filter(|(_, tx)| tx.try_send(event.clone()).is_ok())
            .count()
    }

    /// Queue a usage snapshot on a container's open channel
    pub fn push_usage(&self, name: &str, usage: Usage) -> bool {
        match self.state().feeds.get(name) {
            Some(tx) => tx.try_send(usage).is_ok(),
            None => false,
        }
    }

    /// Disconnect a container's usage channel, as if the backend lost it
    pub fn close_usage(&self, name: &str) {
        self.state().feeds.remove(name);
    }

    /// Whether the consumer side of a container's channel is still open
    pub fn usage_open(&self, name: &str) -> bool {
        self.state()
            .feeds
            .get(name)
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    /// How many usage channels were opened for a container
    pub fn opened_channels(&self, name: &str) -> usize {
        self.state().opened.get(name).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ContainerDriver for MockDriver {
    async fn list_containers(&self) -> DriverResult<Vec<ContainerInfo>> {
        Ok(self.state().containers.values().cloned().collect())
    }

    async fn watch_events(&self, types: &[EventType]) -> DriverResult<EventStream> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        self.state().watchers.push((types.to_vec(), tx));
        Ok(EventStream::new(rx))
    }

    async fn get_container(&self, name: &str) -> DriverResult<ContainerInfo> {
        self.state()
            .containers
            .get(name)
            .cloned()
            .ok_or_else(|| DriverError::NotFound(name.to_string()))
    }

    async fn open_usage_channel(&self, name: &str) -> DriverResult<UsageChannel> {
        let mut state = self.state();
        let info = state
            .containers
            .get(name)
            .cloned()
            .ok_or_else(|| DriverError::NotFound(name.to_string()))?;

        let (tx, channel) = UsageChannel::open(Arc::new(info), USAGE_BUFFER_SIZE);
        state.feeds.insert(name.to_string(), tx);
        *state.opened.entry(name.to_string()).or_default() += 1;
        debug!(container.name = %name, "opened mock usage channel");

        Ok(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_unknown_container_is_not_found() {
        let driver = MockDriver::new();
        let result = driver.get_container("ghost").await;

        assert!(matches!(result, Err(DriverError::NotFound(name)) if name == "ghost"));
    }

    #[tokio::test]
    async fn test_emit_respects_subscribed_types() {
        let driver = MockDriver::new();
        let mut creations = driver.watch_events(&[EventType::Creation]).await.unwrap();

        assert_eq!(
            driver.emit(ContainerEvent::new(EventType::Deletion, "web-1")),
            0
        );
        assert_eq!(
            driver.emit(ContainerEvent::new(EventType::Creation, "web-1")),
            1
        );

        let event = creations.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::Creation);
        assert_eq!(event.container_name, "web-1");
    }

    #[tokio::test]
    async fn test_usage_feed_round_trip() {
        let driver = MockDriver::with_containers([ContainerInfo::new("web-1")]);
        let mut channel = driver.open_usage_channel("web-1").await.unwrap();

        assert!(driver.push_usage("web-1", Usage::default()));
        assert!(channel.try_recv().is_ok());
        assert_eq!(driver.opened_channels("web-1"), 1);

        channel.close();
        assert!(!driver.usage_open("web-1"));
    }
}
