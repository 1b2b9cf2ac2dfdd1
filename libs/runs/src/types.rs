//! Run record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RunError;

// =============================================================================
// Result Constants
// =============================================================================

/// Result strings written to run and archive records.
pub mod results {
    pub const CANCELLED: &str = "cancelled";
    pub const REQUEUED: &str = "requeued";
    pub const HUNG: &str = "hung";
    pub const ENV_FAIL: &str = "EnvFail";
}

// =============================================================================
// Status Enums
// =============================================================================

/// Run lifecycle status.
///
/// Moves forward in the common case but can be reset back to `Queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Building,
    Generating,
    Allocated,
    Waiting,
    Started,
    Provstart,
    Running,
    Ending,
    Cancelling,
    Rundone,
    Finished,
}

impl RunStatus {
    /// Every status in lifecycle order.
    pub const ALL: [RunStatus; 12] = [
        RunStatus::Queued,
        RunStatus::Building,
        RunStatus::Generating,
        RunStatus::Allocated,
        RunStatus::Waiting,
        RunStatus::Started,
        RunStatus::Provstart,
        RunStatus::Running,
        RunStatus::Ending,
        RunStatus::Cancelling,
        RunStatus::Rundone,
        RunStatus::Finished,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Building => "building",
            RunStatus::Generating => "generating",
            RunStatus::Allocated => "allocated",
            RunStatus::Waiting => "waiting",
            RunStatus::Started => "started",
            RunStatus::Provstart => "provstart",
            RunStatus::Running => "running",
            RunStatus::Ending => "ending",
            RunStatus::Cancelling => "cancelling",
            RunStatus::Rundone => "rundone",
            RunStatus::Finished => "finished",
        }
    }

    /// Returns true once the controller has nothing left to do for the run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Finished)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = RunError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        RunStatus::ALL
            .iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(trimmed))
            .copied()
            .ok_or_else(|| RunError::UnknownStatus(s.to_string()))
    }
}

/// Why a run was interrupted.
///
/// Anything outside the known vocabulary is preserved verbatim and handled
/// like a cancellation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum InterruptReason {
    Cancelled,
    Requeued,
    Hung,
    Other(String),
}

impl InterruptReason {
    pub fn as_str(&self) -> &str {
        match self {
            InterruptReason::Cancelled => results::CANCELLED,
            InterruptReason::Requeued => results::REQUEUED,
            InterruptReason::Hung => results::HUNG,
            InterruptReason::Other(reason) => reason,
        }
    }

    /// Returns true if the run should go back on the queue rather than finish.
    pub fn is_requeue(&self) -> bool {
        matches!(self, InterruptReason::Requeued)
    }
}

impl From<&str> for InterruptReason {
    fn from(value: &str) -> Self {
        match value.trim() {
            results::CANCELLED => InterruptReason::Cancelled,
            results::REQUEUED => InterruptReason::Requeued,
            results::HUNG => InterruptReason::Hung,
            other => InterruptReason::Other(other.to_string()),
        }
    }
}

impl From<String> for InterruptReason {
    fn from(value: String) -> Self {
        InterruptReason::from(value.as_str())
    }
}

impl From<InterruptReason> for String {
    fn from(value: InterruptReason) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for InterruptReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Records
// =============================================================================

/// A pending update to a result-archive record.
///
/// Applied once the run's pod is confirmed torn down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveAction {
    pub archive_run_id: String,
    pub status: RunStatus,
    pub result: String,
}

impl ArchiveAction {
    pub fn new(archive_run_id: impl Into<String>, status: RunStatus, result: impl Into<String>) -> Self {
        Self {
            archive_run_id: archive_run_id.into(),
            status,
            result: result.into(),
        }
    }
}

/// A test run as recorded in the status store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub name: String,
    pub status: RunStatus,
    #[serde(default)]
    pub interrupt_reason: Option<InterruptReason>,
    /// When the interrupt was requested. `None` means "unknown", not "now".
    #[serde(default)]
    pub interrupted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pending_archive_actions: Vec<ArchiveAction>,
    /// Id of the archive record for the current attempt.
    #[serde(default)]
    pub archive_run_id: Option<String>,
    #[serde(default)]
    pub queued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<String>,
    /// Controller pod that allocated the run.
    #[serde(default)]
    pub controller: Option<String>,
    /// Runs executed outside the cluster are never scheduled here.
    #[serde(default)]
    pub local: bool,
    #[serde(default)]
    pub trace: bool,
}

impl Run {
    pub fn new(name: impl Into<String>, status: RunStatus) -> Self {
        Self {
            name: name.into(),
            status,
            interrupt_reason: None,
            interrupted_at: None,
            pending_archive_actions: Vec::new(),
            archive_run_id: None,
            queued_at: None,
            result: None,
            controller: None,
            local: false,
            trace: false,
        }
    }

    pub fn with_interrupt(
        mut self,
        reason: impl Into<InterruptReason>,
        interrupted_at: Option<DateTime<Utc>>,
    ) -> Self {
        self.interrupt_reason = Some(reason.into());
        self.interrupted_at = interrupted_at;
        self
    }

    pub fn with_archive_run_id(mut self, id: impl Into<String>) -> Self {
        self.archive_run_id = Some(id.into());
        self
    }

    pub fn with_archive_action(mut self, action: ArchiveAction) -> Self {
        self.pending_archive_actions.push(action);
        self
    }

    pub fn with_queued_at(mut self, queued_at: DateTime<Utc>) -> Self {
        self.queued_at = Some(queued_at);
        self
    }

    pub fn local(mut self) -> Self {
        self.local = true;
        self
    }

    pub fn traced(mut self) -> Self {
        self.trace = true;
        self
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt_reason.is_some()
    }

    /// Interrupted and not yet finished, so the controller owes it a teardown.
    pub fn needs_teardown(&self) -> bool {
        self.is_interrupted() && !self.status.is_terminal()
    }

    /// Queued, schedulable on this cluster and not already interrupted.
    pub fn is_schedulable(&self) -> bool {
        self.status == RunStatus::Queued && !self.local && !self.is_interrupted()
    }
}
