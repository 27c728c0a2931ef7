//! The claim loop: ask the queue for as much work as there is room for.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::channel::{self, Channel, ChannelError};
use crate::protocol::{ClaimPayload, ClaimReply, ClaimedRun, CLAIM};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkloopConfig {
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl Default for WorkloopConfig {
    fn default() -> Self {
        Self {
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(10),
        }
    }
}

/// Starts claimed runs. Implemented by the worker server.
#[async_trait]
pub trait RunLauncher: Send + Sync {
    /// How many more runs could start right now.
    fn free_capacity(&self) -> usize;

    /// Start `run` in the background.
    async fn launch(&self, run: ClaimedRun);
}

/// Doubling delay between idle polls, capped at `max`. Fixed when
/// `min == max`.
#[derive(Debug)]
struct Backoff {
    min: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    fn new(config: WorkloopConfig) -> Self {
        let min = config.backoff_min.max(Duration::from_millis(1));
        Self {
            min,
            max: config.backoff_max.max(min),
            current: None,
        }
    }

    fn next(&mut self) -> Duration {
        let delay = match self.current {
            None => self.min,
            Some(current) => (current * 2).min(self.max),
        };
        self.current = Some(delay);
        delay
    }

    fn reset(&mut self) {
        self.current = None;
    }
}

/// Ask for up to `demand` runs.
pub async fn claim(channel: &dyn Channel, demand: usize) -> Result<Vec<ClaimedRun>, ChannelError> {
    let reply: ClaimReply = channel::request(channel, CLAIM, &ClaimPayload { demand }).await?;
    Ok(reply.runs)
}

/// Poll until `cancel` fires.
///
/// An empty claim or a failed one backs off; a claim that returned runs polls
/// again straight away. Polls are skipped while there is no free capacity.
/// Cancellation stops further polls but does not interrupt a claim that is
/// already waiting for its reply.
pub async fn run_workloop(
    channel: Arc<dyn Channel>,
    launcher: Arc<dyn RunLauncher>,
    config: WorkloopConfig,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::new(config);
    let mut delay = Duration::ZERO;
    info!(
        min_ms = backoff.min.as_millis() as u64,
        max_ms = backoff.max.as_millis() as u64,
        "workloop started"
    );

    loop {
        if !delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if cancel.is_cancelled() {
            break;
        }

        let demand = launcher.free_capacity();
        if demand == 0 {
            trace!("no free capacity, skipping claim");
            delay = backoff.next();
            continue;
        }

        match claim(channel.as_ref(), demand).await {
            Ok(runs) if !runs.is_empty() => {
                debug!(claimed = runs.len(), demand, "claimed runs");
                for run in runs {
                    launcher.launch(run).await;
                }
                backoff.reset();
                delay = Duration::ZERO;
            }
            Ok(_) => {
                delay = backoff.next();
                trace!(next_ms = delay.as_millis() as u64, "nothing to claim");
            }
            Err(e) => {
                delay = backoff.next();
                warn!(error = %e, next_ms = delay.as_millis() as u64, "claim failed");
            }
        }
    }
    info!("workloop stopped");
}
