//! Per-container poll loop

use super::{lock, ActivePolls};
use crate::containers::UsageChannel;
use crate::models::{Sample, Usage};
use crate::observability::MeterMetrics;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// Entry of the active-poll map
pub(crate) struct PollHandle {
    pub generation: u64,
    pub cancel: oneshot::Sender<()>,
    pub task: JoinHandle<UsageChannel>,
}

impl PollHandle {
    /// Cancel the loop and wait for it to hand back its channel
    pub async fn finish(self) -> Result<UsageChannel, JoinError> {
        // The loop may already have ended on its own
        let _ = self.cancel.send(());
        self.task.await
    }
}

pub(crate) struct PollContext {
    pub rate: Duration,
    pub generation: u64,
    pub samples: mpsc::Sender<Sample>,
    pub polls: ActivePolls,
    pub metrics: MeterMetrics,
}

pub(crate) async fn run(
    mut channel: UsageChannel,
    ctx: PollContext,
    mut cancel: oneshot::Receiver<()>,
) -> UsageChannel {
    let mut ticker = interval_at(Instant::now() + ctx.rate, ctx.rate);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            _ = &mut cancel => break,
            _ = ticker.tick() => {
                match channel.try_recv() {
                    Ok(usage) => emit(&ctx, &channel, usage),
                    Err(TryRecvError::Empty) => {
                        trace!(container.name = %channel.name(), "no usage this tick");
                    }
                    Err(TryRecvError::Disconnected) => {
                        debug!(container.name = %channel.name(), "usage channel closed, ending collection");
                        release(&ctx, channel.name());
                        break;
                    }
                }
            }
        }
    }

    channel
}

fn emit(ctx: &PollContext, channel: &UsageChannel, usage: Usage) {
    let sample = Sample {
        container: channel.container().clone(),
        usage,
        timestamp: chrono::Utc::now().timestamp(),
        frame_size: ctx.rate,
    };

    match ctx.samples.try_send(sample) {
        Ok(()) => ctx.metrics.inc_samples_emitted(),
        Err(TrySendError::Full(_)) => {
            ctx.metrics.inc_samples_dropped();
            warn!(container.name = %channel.name(), "sample channel full, dropping sample");
        }
        Err(TrySendError::Closed(_)) => {
            debug!(container.name = %channel.name(), "sample channel closed, dropping sample");
        }
    }
}

/// Remove this loop's own entry, unless it was already replaced or stopped
fn release(ctx: &PollContext, name: &str) {
    let mut polls = lock(&ctx.polls);
    if polls
        .get(name)
        .is_some_and(|handle| handle.generation == ctx.generation)
    {
        polls.remove(name);
        ctx.metrics.set_collections_active(polls.len());
    }
}
