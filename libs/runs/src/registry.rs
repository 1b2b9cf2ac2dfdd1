//! Collaborator interfaces for the status store and result archive.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::{ArchiveError, RegistryError};
use crate::keys::StatusChange;
use crate::types::{ArchiveAction, Run, RunStatus};

/// Query and mutate run records in the status store.
///
/// Writes are limited to the transitions the controller owns: allocation,
/// cancellation of queued runs, requeue and finish.
#[async_trait]
pub trait RunRegistry: Send + Sync {
    /// Every run currently carrying an interrupt reason, finished or not.
    async fn get_interrupted_runs(&self) -> Result<Vec<Run>, RegistryError>;

    /// Every run in `queued` status.
    async fn get_queued_runs(&self) -> Result<Vec<Run>, RegistryError>;

    /// Look up a single run.
    async fn get_run(&self, run_name: &str) -> Result<Option<Run>, RegistryError>;

    /// Every run the store knows about.
    async fn all_runs(&self) -> Result<Vec<Run>, RegistryError>;

    /// Atomically move a run from `queued` to `allocated`, recording the
    /// controller that owns it. Returns false if the run was not queued.
    async fn try_allocate(&self, run_name: &str, controller: &str) -> Result<bool, RegistryError>;

    /// Atomically move a run from `expected` to `cancelling`. Returns false
    /// if the run's status no longer matches.
    async fn mark_cancelling(
        &self,
        run_name: &str,
        expected: RunStatus,
    ) -> Result<bool, RegistryError>;

    /// Reset a run back to `queued`, clearing its interrupt fields, pending
    /// archive actions and result. Fails with
    /// [`RegistryError::InvalidTransition`] for finished runs.
    async fn mark_queued(&self, run_name: &str) -> Result<Run, RegistryError>;

    /// Move a run to `finished` with the given result.
    async fn mark_finished(&self, run_name: &str, result: &str) -> Result<(), RegistryError>;

    /// Append an archive update to be applied once the run's pod is gone.
    async fn append_archive_action(
        &self,
        run_name: &str,
        action: ArchiveAction,
    ) -> Result<(), RegistryError>;

    /// Point a run at the archive record for its current attempt.
    async fn set_archive_run_id(
        &self,
        run_name: &str,
        archive_run_id: &str,
    ) -> Result<(), RegistryError>;
}

/// Update records in the result archive.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Set the status and result of an existing record.
    async fn update_record_status(
        &self,
        record_id: &str,
        status: RunStatus,
        result: &str,
    ) -> Result<(), ArchiveError>;

    /// Create a record for a new attempt of a run and return its id.
    async fn create_record(&self, run_name: &str, status: RunStatus)
        -> Result<String, ArchiveError>;
}

/// Source of status-store change notifications.
pub trait StatusFeed: Send + Sync {
    /// Subscribe to changes under the run key prefix.
    fn subscribe(&self) -> broadcast::Receiver<StatusChange>;
}
