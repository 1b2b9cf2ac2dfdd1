//! Status-store watch translation.
//!
//! Turns raw `run.<name>.<suffix>` change notifications into run-level
//! signals on a bounded queue. The interrupt worker drains that queue to
//! inspect the named runs without waiting for the next full sweep.
//!
//! The watcher makes no registry or cluster calls. Anything it drops is
//! still caught by the periodic sweep.

use enginectl_runs::{RunKey, RunKeySuffix, StatusChange, WatchEventType};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, instrument, warn};

/// A change to a run's status or interrupt reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunStatusChange {
    pub run_name: String,
    pub suffix: RunKeySuffix,
    pub event_type: WatchEventType,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

impl RunStatusChange {
    /// Translate a raw notification. Returns `None` for anything that is not
    /// a change to a run's `status` or `interruptReason` key.
    pub fn from_notification(change: &StatusChange) -> Option<Self> {
        let key = change.key.as_deref()?;
        let event_type = change.event_type?;
        let parsed = RunKey::parse(key)?;
        let suffix = parsed.known_suffix()?;
        if !matches!(suffix, RunKeySuffix::Status | RunKeySuffix::InterruptReason) {
            return None;
        }
        Some(Self {
            run_name: parsed.run_name,
            suffix,
            event_type,
            old_value: change.old_value.clone(),
            new_value: change.new_value.clone(),
        })
    }
}

/// Feeds run-level changes into a bounded queue.
pub struct StatusWatcher {
    queue: mpsc::Sender<RunStatusChange>,
}

impl StatusWatcher {
    /// Create a watcher and the receiving end of its queue.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<RunStatusChange>) {
        let (queue, rx) = mpsc::channel(capacity.max(1));
        (Self { queue }, rx)
    }

    /// Handle one notification. Returns true if an entry was queued.
    ///
    /// A full or closed queue drops the entry.
    pub fn on_change(&self, change: &StatusChange) -> bool {
        let Some(entry) = RunStatusChange::from_notification(change) else {
            return false;
        };
        debug!(
            run_name = %entry.run_name,
            suffix = %entry.suffix,
            event_type = %entry.event_type,
            old = ?entry.old_value,
            new = ?entry.new_value,
            "Run changed"
        );
        match self.queue.try_send(entry) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(entry)) => {
                warn!(run_name = %entry.run_name, "Watch queue full, dropping change");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Consume notifications until shutdown or until the feed closes.
    #[instrument(skip_all)]
    pub async fn run(
        self,
        mut feed: broadcast::Receiver<StatusChange>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Starting status watcher");

        loop {
            tokio::select! {
                received = feed.recv() => match received {
                    Ok(change) => {
                        self.on_change(&change);
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Status watcher lagged, relying on the next sweep");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Status feed closed, stopping watcher");
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Status watcher shutting down");
                        break;
                    }
                }
            }
        }
    }
}
