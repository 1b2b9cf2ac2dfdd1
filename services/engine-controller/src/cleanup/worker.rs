use tokio::sync::watch;
use tracing::{error, info, instrument};

use super::pods::RunPodCleanup;
use crate::scheduler::worker::poll_interval;
use crate::settings::SharedSettings;

/// Runs pod cleanup on the run poll interval.
pub struct CleanupWorker {
    cleanup: RunPodCleanup,
    settings: SharedSettings,
}

impl CleanupWorker {
    pub fn new(cleanup: RunPodCleanup, settings: SharedSettings) -> Self {
        Self { cleanup, settings }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut period = self.settings.current().run_poll;
        info!(interval_secs = period.as_secs(), "Starting cleanup worker");

        let mut interval = poll_interval(period);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.cleanup.cleanup().await {
                        Ok(stats) if stats.deleted > 0 => {
                            info!(deleted = stats.deleted, "Cleanup pass complete");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Failed to clean up engine pods"),
                    }

                    let current = self.settings.current().run_poll;
                    if current != period {
                        period = current;
                        interval = poll_interval(period);
                        interval.tick().await;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Cleanup worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}
