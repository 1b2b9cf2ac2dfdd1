//! Interrupt background worker.
//!
//! Two triggers feed the same collection rules:
//! - A full sweep on the interrupt poll interval, first one interval after start
//! - An ad-hoc pass over the runs named by the status watcher's queue

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument};

use super::collector::InterruptCollector;
use super::processor::{InterruptProcessor, ProcessStats};
use crate::scheduler::worker::poll_interval;
use crate::watcher::RunStatusChange;

/// Collects and processes interrupted runs until shutdown.
pub struct InterruptWorker {
    collector: InterruptCollector,
    processor: InterruptProcessor,
    changes: mpsc::Receiver<RunStatusChange>,
    interval: Duration,
}

impl InterruptWorker {
    pub fn new(
        collector: InterruptCollector,
        processor: InterruptProcessor,
        changes: mpsc::Receiver<RunStatusChange>,
        interval: Duration,
    ) -> Self {
        Self {
            collector,
            processor,
            changes,
            interval,
        }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting interrupt worker"
        );

        let mut interval = poll_interval(self.interval);
        interval.tick().await;
        let mut watching = true;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep().await;
                }
                received = self.changes.recv(), if watching => match received {
                    Some(first) => {
                        let names = self.drain(first);
                        self.inspect(&names).await;
                    }
                    None => {
                        info!("Watch queue closed, relying on periodic sweeps");
                        watching = false;
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Interrupt worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Collect and process every interrupted run that is due.
    pub async fn sweep(&self) -> Option<ProcessStats> {
        match self.collector.collect().await {
            Ok(events) if events.is_empty() => None,
            Ok(events) => Some(self.processor.process_events(events).await),
            Err(e) => {
                error!(error = %e, "Failed to collect interrupted runs");
                None
            }
        }
    }

    /// Collect and process the named runs if they are due.
    pub async fn inspect(&self, run_names: &BTreeSet<String>) -> Option<ProcessStats> {
        debug!(runs = run_names.len(), "Inspecting changed runs");
        match self.collector.collect_for_runs(run_names).await {
            Ok(events) if events.is_empty() => None,
            Ok(events) => Some(self.processor.process_events(events).await),
            Err(e) => {
                error!(error = %e, "Failed to collect changed runs");
                None
            }
        }
    }

    /// Everything already queued behind `first`, deduplicated by run.
    fn drain(&mut self, first: RunStatusChange) -> BTreeSet<String> {
        let mut names = BTreeSet::from([first.run_name]);
        while let Ok(change) = self.changes.try_recv() {
            names.insert(change.run_name);
        }
        names
    }
}
