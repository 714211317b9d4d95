//! Meter orchestration
//!
//! The [`Agent`] wires the introspection backend, the sampling collector and
//! the message pipeline together:
//! - containers found at startup are sent as discoveries
//! - lifecycle events become state changes once their container is known
//! - collected samples are forwarded to the pipeline
//!
//! On shutdown every collection is stopped and each container still tracked
//! gets a final stopped state change before the dispatcher drains.

use crate::collector::{Collector, CollectorConfig};
use crate::containers::{ContainerDriver, DriverError, EventStream, WATCHED_EVENTS};
use crate::health::{components, HealthRegistry};
use crate::message::Message;
use crate::models::{ContainerEvent, ContainerInfo, ContainerState, Sample, StateChange};
use crate::observability::{MeterMetrics, StructuredLogger};
use crate::pipeline::filters::{standard_pipeline, PipelineDeps};
use crate::pipeline::{DispatchHandle, DispatchSummary, Dispatcher, DispatcherConfig};
use crate::registry::{ContainerRegistry, TrackingPolicy};
use crate::reporting::Reporter;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

pub const DEFAULT_TRACK_LABEL: &str = "com.usage-meter.track";
pub const DEFAULT_SERVICE_KEY_LABEL: &str = "com.usage-meter.service";

pub struct Agent {
    meter_id: String,
    driver: Arc<dyn ContainerDriver>,
    reporter: Arc<dyn Reporter>,
    registry: Arc<ContainerRegistry>,
    collector: Arc<Collector>,
    samples: mpsc::Receiver<Sample>,
    dispatcher_config: DispatcherConfig,
    service_key_label: String,
    health: HealthRegistry,
    logger: StructuredLogger,
    metrics: MeterMetrics,
}

impl Agent {
    pub fn builder() -> AgentBuilder {
        AgentBuilder::new()
    }

    pub fn meter_id(&self) -> &str {
        &self.meter_id
    }

    /// Registry of tracked containers, shared with the API
    pub fn registry(&self) -> Arc<ContainerRegistry> {
        self.registry.clone()
    }

    pub fn health(&self) -> HealthRegistry {
        self.health.clone()
    }

    /// Whether the tracking policy can match anything the driver describes
    fn tracking_reachable(&self) -> bool {
        let policy = self.registry.policy();
        if !policy.env_key().is_empty() {
            return true;
        }
        match self.driver.label_keys() {
            Some(keys) => keys.iter().any(|key| *key == policy.label()),
            None => !policy.label().is_empty(),
        }
    }

    /// Run until `shutdown` fires, then drain the pipeline
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<DispatchSummary> {
        if !self.tracking_reachable() {
            let policy = self.registry.policy();
            warn!(
                tracking.label = %policy.label(),
                tracking.env = %policy.env_key(),
                "tracking policy cannot match any container of this driver"
            );
        }

        for component in [
            components::EVENT_WATCHER,
            components::COLLECTOR,
            components::REPORTER,
            components::DISPATCHER,
        ] {
            self.health.register(component).await;
        }

        let pipeline = standard_pipeline(PipelineDeps {
            meter_id: self.meter_id.clone(),
            registry: self.registry.clone(),
            collector: self.collector.clone(),
            driver: self.driver.clone(),
            reporter: self.reporter.clone(),
            service_key_label: self.service_key_label.clone(),
            health: Some(self.health.clone()),
        });
        let dispatcher = Dispatcher::start(Arc::new(pipeline), self.dispatcher_config.clone());
        let handle = dispatcher.handle();

        // Subscribe before listing so nothing created in between is missed
        let mut events = match self.driver.watch_events(&WATCHED_EVENTS).await {
            Ok(events) => events,
            Err(e) => {
                self.health
                    .set_unhealthy(components::EVENT_WATCHER, e.to_string())
                    .await;
                drop(handle);
                dispatcher.shutdown().await;
                return Err(e).context("error watching container events");
            }
        };

        let discovered = self.discover(&handle).await;
        info!(containers = discovered, "Startup discovery complete");
        self.health.set_ready(true).await;

        let reason = self.event_loop(&handle, &mut events, &mut shutdown).await;
        events.close();

        let tracked = self.registry.len();
        let summary = self.shutdown(handle, dispatcher).await;
        self.logger.log_shutdown(reason, tracked);
        Ok(summary)
    }

    /// Send a discovery for every container the driver lists
    async fn discover(&self, handle: &DispatchHandle) -> usize {
        let containers = match self.driver.list_containers().await {
            Ok(containers) => containers,
            Err(e) => {
                warn!(error = %e, "failed to list containers at startup");
                return 0;
            }
        };

        let count = containers.len();
        for info in containers {
            self.dispatch(handle, Message::discovery(Arc::new(info))).await;
        }
        count
    }

    async fn event_loop(
        &mut self,
        handle: &DispatchHandle,
        events: &mut EventStream,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> &'static str {
        let mut watching = true;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    return "shutdown signal received";
                }
                event = events.recv(), if watching => match event {
                    Some(event) => self.handle_event(handle, event).await,
                    None => {
                        warn!("container event stream closed");
                        self.health
                            .set_unhealthy(components::EVENT_WATCHER, "event stream closed")
                            .await;
                        watching = false;
                    }
                },
                sample = self.samples.recv() => match sample {
                    Some(sample) => self.dispatch(handle, Message::sample(sample)).await,
                    None => {
                        return "sample stream closed";
                    }
                },
            }
        }
    }

    /// Turn a lifecycle event into a state change for a tracked container
    async fn handle_event(&self, handle: &DispatchHandle, event: ContainerEvent) {
        let container = match self.registry.get(&event.container_name) {
            Some(info) => info,
            None if ContainerState::from_event(&event.event_type) == ContainerState::Running => {
                match self.admit(&event).await {
                    Some(info) => info,
                    None => return,
                }
            }
            None => {
                debug!(
                    container.name = %event.container_name,
                    event = %event.event_type,
                    "event for untracked container"
                );
                return;
            }
        };

        let change = StateChange::from_event(event).with_container(container);
        self.dispatch(handle, Message::state_change(change)).await;
    }

    /// Resolve a newly running container and track it when the policy allows
    async fn admit(&self, event: &ContainerEvent) -> Option<Arc<ContainerInfo>> {
        let name = &event.container_name;
        let info = match self.driver.get_container(name).await {
            Ok(info) => info,
            Err(DriverError::NotFound(_)) => {
                debug!(container.name = %name, "container vanished before it was resolved");
                return None;
            }
            Err(e) => {
                warn!(container.name = %name, error = %e, "failed to resolve container");
                return None;
            }
        };

        if !self.registry.is_trackable(&info) {
            debug!(container.name = %name, "container not trackable");
            return None;
        }

        let info = Arc::new(info);
        match self.registry.register(info.clone()) {
            Ok(true) => {}
            Ok(false) => return self.registry.get(name),
            Err(e) => {
                warn!(container.name = %name, error = %e, "failed to register container");
                return None;
            }
        }
        self.metrics.set_containers_tracked(self.registry.len());
        self.logger
            .log_container_tracked(&info.name, &info.image_name, event.event_type.as_str());

        Some(info)
    }

    async fn dispatch(&self, handle: &DispatchHandle, message: Message) {
        if let Err(e) = handle.dispatch(message).await {
            warn!(error = %e, "failed to dispatch message");
            self.health
                .set_unhealthy(components::DISPATCHER, e.to_string())
                .await;
        }
    }

    async fn shutdown(&self, handle: DispatchHandle, dispatcher: Dispatcher) -> DispatchSummary {
        for channel in self.collector.stop_all().await {
            channel.close();
        }

        let tracked = self.registry.list();
        info!(containers = tracked.len(), "Reporting tracked containers as stopped");
        for info in tracked {
            let change = StateChange::from_event(ContainerEvent::meter_shutdown(info));
            self.dispatch(&handle, Message::state_change(change)).await;
        }

        drop(handle);
        let summary = dispatcher.shutdown().await;

        // Discoveries still queued at shutdown may have started collections
        for channel in self.collector.stop_all().await {
            channel.close();
        }

        summary
    }
}

/// Builder for [`Agent`]
pub struct AgentBuilder {
    meter_id: Option<String>,
    driver: Option<Arc<dyn ContainerDriver>>,
    reporter: Option<Arc<dyn Reporter>>,
    tracking: TrackingPolicy,
    collector: CollectorConfig,
    dispatcher: DispatcherConfig,
    service_key_label: String,
    health: Option<HealthRegistry>,
}

impl AgentBuilder {
    pub fn new() -> Self {
        Self {
            meter_id: None,
            driver: None,
            reporter: None,
            tracking: TrackingPolicy::new(DEFAULT_TRACK_LABEL, ""),
            collector: CollectorConfig::default(),
            dispatcher: DispatcherConfig::default(),
            service_key_label: DEFAULT_SERVICE_KEY_LABEL.to_string(),
            health: None,
        }
    }

    pub fn meter_id(mut self, meter_id: impl Into<String>) -> Self {
        self.meter_id = Some(meter_id.into());
        self
    }

    pub fn driver(mut self, driver: Arc<dyn ContainerDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn tracking(mut self, policy: TrackingPolicy) -> Self {
        self.tracking = policy;
        self
    }

    pub fn collector(mut self, config: CollectorConfig) -> Self {
        self.collector = config;
        self
    }

    pub fn dispatcher(mut self, config: DispatcherConfig) -> Self {
        self.dispatcher = config;
        self
    }

    pub fn service_key_label(mut self, label: impl Into<String>) -> Self {
        self.service_key_label = label.into();
        self
    }

    /// Share an existing health registry instead of creating one
    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn build(self) -> Result<Agent> {
        let meter_id = self
            .meter_id
            .ok_or_else(|| anyhow::anyhow!("meter_id is required"))?;
        let driver = self
            .driver
            .ok_or_else(|| anyhow::anyhow!("driver is required"))?;
        let reporter = self
            .reporter
            .ok_or_else(|| anyhow::anyhow!("reporter is required"))?;

        let (collector, samples) = Collector::new(self.collector);

        Ok(Agent {
            logger: StructuredLogger::new(meter_id.clone()),
            meter_id,
            driver,
            reporter,
            registry: Arc::new(ContainerRegistry::new(self.tracking)),
            collector: Arc::new(collector),
            samples,
            dispatcher_config: self.dispatcher,
            service_key_label: self.service_key_label,
            health: self.health.unwrap_or_default(),
            metrics: MeterMetrics::new(),
        })
    }
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}
