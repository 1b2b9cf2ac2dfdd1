//! Scheduler background worker.
//!
//! Runs the scheduler pass on the `run_poll` interval, picking up interval
//! changes from settings reloads.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, instrument};

use super::reconciler::EngineScheduler;
use crate::settings::SharedSettings;

/// Scheduler worker that runs scheduling passes until shutdown.
pub struct SchedulerWorker {
    scheduler: EngineScheduler,
    settings: SharedSettings,
}

impl SchedulerWorker {
    pub fn new(scheduler: EngineScheduler, settings: SharedSettings) -> Self {
        Self {
            scheduler,
            settings,
        }
    }

    /// Run the scheduler worker until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut period = self.settings.current().run_poll;
        info!(interval_secs = period.as_secs(), "Starting scheduler worker");

        let mut interval = poll_interval(period);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.scheduler.schedule().await {
                        error!(error = %e, "Scheduling pass failed");
                    }

                    let current = self.settings.current().run_poll;
                    if current != period {
                        info!(
                            from_secs = period.as_secs(),
                            to_secs = current.as_secs(),
                            "Run poll interval changed"
                        );
                        period = current;
                        interval = poll_interval(period);
                        interval.tick().await;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Scheduler worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// A zero period would make `tokio::time::interval` panic.
pub(crate) fn poll_interval(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period.max(Duration::from_secs(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval
}
