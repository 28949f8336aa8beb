//! Retention sweeper: periodic purge of stale jobs.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::SchedulerConfig;

use super::scheduler::Scheduler;

/// Handle to stop and join a running sweeper.
#[derive(Debug)]
pub struct SweeperHandle {
    stop: CancellationToken,
    join: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the timer and wait for the task to finish.
    pub async fn shutdown(self) {
        self.stop.cancel();
        if let Err(err) = self.join.await {
            warn!(error = %err, "retention sweeper task failed");
        }
    }
}

/// Removes jobs older than `retention` every `interval`, whatever their state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionSweeper {
    pub interval: Duration,
    pub retention: Duration,
}

impl RetentionSweeper {
    pub fn new(interval: Duration, retention: Duration) -> Self {
        Self {
            interval,
            retention,
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.sweep_interval, config.retention)
    }

    /// Spawn the timer on the current tokio runtime.
    ///
    /// The first sweep happens one `interval` after spawning.
    pub fn spawn(self, scheduler: Scheduler) -> SweeperHandle {
        let stop = CancellationToken::new();
        let token = stop.clone();

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            debug!(
                interval_secs = self.interval.as_secs(),
                retention_secs = self.retention.as_secs(),
                "retention sweeper started"
            );

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        scheduler.sweep_older_than(self.retention);
                    }
                }
            }

            debug!("retention sweeper stopped");
        });

        SweeperHandle { stop, join }
    }
}
