//! Bounded worker pool feeding the pipeline
//!
//! Producers enqueue messages through a [`DispatchHandle`]; a fixed number of
//! workers take them off a shared queue and run them through the pipeline.
//! A full queue makes producers wait.

use super::Pipeline;
use crate::message::Message;
use crate::observability::MeterMetrics;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatcher is shut down")]
    Closed,
}

/// Configuration for the dispatcher
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Number of concurrent workers (default: 4)
    pub workers: usize,
    /// Messages queued before producers wait (default: 1024)
    pub queue_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_size: 1024,
        }
    }
}

/// Outcome counts of a drained dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSummary {
    pub processed: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct DispatchStats {
    processed: AtomicU64,
    failed: AtomicU64,
}

/// Cloneable producer side of the dispatcher
#[derive(Debug, Clone)]
pub struct DispatchHandle {
    tx: mpsc::Sender<Message>,
}

impl DispatchHandle {
    /// Queue a message, waiting while the queue is full
    pub async fn dispatch(&self, message: Message) -> Result<(), DispatchError> {
        self.tx.send(message).await.map_err(|_| DispatchError::Closed)
    }
}

pub struct Dispatcher {
    tx: mpsc::Sender<Message>,
    workers: Vec<JoinHandle<()>>,
    stats: Arc<DispatchStats>,
}

impl Dispatcher {
    /// Spawn the workers
    pub fn start(pipeline: Arc<Pipeline>, config: DispatcherConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let stats = Arc::new(DispatchStats::default());
        let metrics = MeterMetrics::new();

        let workers = (0..config.workers.max(1))
            .map(|id| {
                tokio::spawn(worker(
                    id,
                    rx.clone(),
                    pipeline.clone(),
                    stats.clone(),
                    metrics.clone(),
                ))
            })
            .collect::<Vec<_>>();

        info!(
            workers = workers.len(),
            queue_size = config.queue_size,
            "Started message dispatcher"
        );

        Self { tx, workers, stats }
    }

    pub fn handle(&self) -> DispatchHandle {
        DispatchHandle {
            tx: self.tx.clone(),
        }
    }

    /// Messages the pipeline handled successfully
    pub fn processed(&self) -> u64 {
        self.stats.processed.load(Ordering::Relaxed)
    }

    /// Messages whose processing failed
    pub fn failed(&self) -> u64 {
        self.stats.failed.load(Ordering::Relaxed)
    }

    /// Close the queue and wait for the workers to drain it
    ///
    /// Completes once every outstanding [`DispatchHandle`] has been dropped.
    pub async fn shutdown(self) -> DispatchSummary {
        drop(self.tx);

        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "dispatcher worker panicked");
            }
        }

        let summary = DispatchSummary {
            processed: self.stats.processed.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
        };
        info!(
            processed = summary.processed,
            failed = summary.failed,
            "Message dispatcher drained"
        );
        summary
    }
}

async fn worker(
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Message>>>,
    pipeline: Arc<Pipeline>,
    stats: Arc<DispatchStats>,
    metrics: MeterMetrics,
) {
    loop {
        let next = rx.lock().await.recv().await;
        let Some(message) = next else {
            debug!(worker = id, "dispatch queue closed");
            break;
        };

        let message_id = message.id();
        let message_type = message.message_type();
        metrics.inc_messages(message_type.as_str());

        match pipeline.send(message).await {
            Ok(()) => {
                stats.processed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                metrics.inc_filter_errors(e.filter);
                error!(
                    worker = id,
                    message.id = %message_id,
                    message.kind = %message_type,
                    filter = e.filter,
                    error = %e,
                    "message processing failed"
                );
            }
        }
    }
}
