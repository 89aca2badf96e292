//! Periodic recovery sweep.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::coordinator::JobCoordinator;

/// Handle to stop a running reaper.
#[derive(Debug)]
pub struct ReaperHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ReaperHandle {
    /// Request graceful shutdown and wait for the current sweep to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.join.await;
    }
}

/// Runs [`JobCoordinator::reap`] every `interval`.
#[derive(Debug)]
pub struct Reaper {
    coordinator: JobCoordinator,
    interval: Duration,
}

impl Reaper {
    pub fn new(coordinator: JobCoordinator, interval: Duration) -> Self {
        Self {
            coordinator,
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    pub fn spawn(self) -> ReaperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(async move {
            info!(interval_ms = self.interval.as_millis() as u64, "reaper started");
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => match self.coordinator.reap().await {
                        Ok(report) => debug!(?report, "reaper sweep"),
                        Err(e) => warn!(error = %e, "reaper sweep failed"),
                    },
                }
            }
            info!("reaper stopped");
        });

        ReaperHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}
