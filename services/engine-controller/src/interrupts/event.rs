//! Interrupt events.

use chrono::{DateTime, Utc};
use enginectl_runs::{ArchiveAction, InterruptReason, RunStatus};

/// A run that must be torn down now.
///
/// Events are transient. Losing one is harmless: the next collection pass
/// derives it again from the registry and the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterruptEvent {
    pub run_name: String,
    pub reason: InterruptReason,
    pub interrupted_at: Option<DateTime<Utc>>,
    /// Run status when the event was collected.
    pub status_at_detection: RunStatus,
    /// Archive record of the attempt being torn down, if the run has one.
    pub archive_run_id: Option<String>,
    pub archive_actions: Vec<ArchiveAction>,
}
