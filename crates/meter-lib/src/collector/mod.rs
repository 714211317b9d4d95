//! Sampling collector
//!
//! Turns per-container usage channels into a single stream of [`Sample`]s.
//! Every collected container gets its own poll loop that reads the channel
//! once per tick without ever waiting on it, so a silent backend costs
//! nothing but a skipped tick.

mod poll;


use crate::containers::UsageChannel;
use crate::models::Sample;
use crate::observability::MeterMetrics;
use poll::{PollContext, PollHandle};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Capacity of the multiplexed sample channel
pub const CHANNEL_BUFFER_SIZE: usize = 3000;

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("no collection for {0}")]
    NotFound(String),
    #[error("already collecting {0}")]
    AlreadyCollecting(String),
    #[error("poll loop for {0} failed: {1}")]
    TaskFailed(String, String),
}

/// Configuration for the sampling collector
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Interval between two reads of a usage channel (default: 10 seconds)
    pub rate: Duration,
    /// Capacity of the sample channel
    pub buffer_size: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            rate: Duration::from_millis(10_000),
            buffer_size: CHANNEL_BUFFER_SIZE,
        }
    }
}

pub(crate) type ActivePolls = Arc<Mutex<HashMap<String, PollHandle>>>;

pub(crate) fn lock(polls: &ActivePolls) -> MutexGuard<'_, HashMap<String, PollHandle>> {
    polls.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Collector of periodic usage samples
pub struct Collector {
    rate: Duration,
    polls: ActivePolls,
    samples_tx: mpsc::Sender<Sample>,
    generation: AtomicU64,
    metrics: MeterMetrics,
}

impl Collector {
    /// Create a collector together with the receiving end of its sample stream
    pub fn new(config: CollectorConfig) -> (Self, mpsc::Receiver<Sample>) {
        let (samples_tx, samples_rx) = mpsc::channel(config.buffer_size.max(1));

        let collector = Self {
            rate: config.rate.max(Duration::from_millis(1)),
            polls: Arc::new(Mutex::new(HashMap::new())),
            samples_tx,
            generation: AtomicU64::new(0),
            metrics: MeterMetrics::new(),
        };

        (collector, samples_rx)
    }

    pub fn rate(&self) -> Duration {
        self.rate
    }

    pub fn is_collecting(&self, name: &str) -> bool {
        lock(&self.polls).contains_key(name)
    }

    pub fn active_count(&self) -> usize {
        lock(&self.polls).len()
    }

    /// Start sampling the container behind `channel`
    ///
    /// A container already being sampled keeps its existing loop; the new
    /// channel is closed and `AlreadyCollecting` returned.
    pub fn collect(&self, channel: UsageChannel) -> Result<(), CollectorError> {
        let name = channel.name().to_string();
        let mut polls = lock(&self.polls);

        if polls.contains_key(&name) {
            drop(polls);
            channel.close();
            warn!(container.name = %name, "container already being collected");
            return Err(CollectorError::AlreadyCollecting(name));
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let ctx = PollContext {
            rate: self.rate,
            generation,
            samples: self.samples_tx.clone(),
            polls: self.polls.clone(),
            metrics: self.metrics.clone(),
        };
        let task = tokio::spawn(poll::run(channel, ctx, cancel_rx));

        polls.insert(
            name.clone(),
            PollHandle {
                generation,
                cancel: cancel_tx,
                task,
            },
        );
        self.metrics.set_collections_active(polls.len());
        drop(polls);

        info!(
            container.name = %name,
            rate_ms = self.rate.as_millis() as u64,
            "started collecting"
        );
        Ok(())
    }

    /// Stop sampling a container and hand back its channel
    ///
    /// Once this returns no further samples for `name` are emitted.
    pub async fn stop(&self, name: &str) -> Result<UsageChannel, CollectorError> {
        let handle = {
            let mut polls = lock(&self.polls);
            let handle = polls
                .remove(name)
                .ok_or_else(|| CollectorError::NotFound(name.to_string()))?;
            self.metrics.set_collections_active(polls.len());
            handle
        };

        let channel = handle.finish().await.map_err(|e| {
            CollectorError::TaskFailed(name.to_string(), e.to_string())
        })?;

        debug!(container.name = %name, "stopped collecting");
        Ok(channel)
    }

    /// Stop every poll loop, returning the channels that could be recovered
    pub async fn stop_all(&self) -> Vec<UsageChannel> {
        let handles: Vec<(String, PollHandle)> = {
            let mut polls = lock(&self.polls);
            let drained = polls.drain().collect();
            self.metrics.set_collections_active(0);
            drained
        };

        let mut channels = Vec::with_capacity(handles.len());
        for (name, handle) in handles {
            match handle.finish().await {
                Ok(channel) => channels.push(channel),
                Err(e) => warn!(container.name = %name, error = %e, "poll loop failed"),
            }
        }

        info!(count = channels.len(), "stopped all collections");
        channels
    }
}
