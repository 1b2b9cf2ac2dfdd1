//! Deletes the pod serving a run.

use tracing::{debug, warn};

use crate::facade::EngineFacade;

/// Best-effort deletion of a run's pod.
///
/// Deleting a run that has no pod is a successful no-op, so an interrupt
/// can be processed again after a partial failure.
#[derive(Clone)]
pub struct PodDeleter {
    facade: EngineFacade,
}

impl PodDeleter {
    pub fn new(facade: EngineFacade) -> Self {
        Self { facade }
    }

    /// Delete the pod for `run_name` if there is one. Returns true if a pod
    /// was found. Orchestrator errors are logged and absorbed.
    pub async fn delete_run_pod(&self, run_name: &str) -> bool {
        match self.facade.pod_for_run(run_name).await {
            Ok(Some(pod)) => {
                self.facade.delete_pod(&pod).await;
                true
            }
            Ok(None) => {
                debug!(run_name = %run_name, "No pod to delete for run");
                false
            }
            Err(e) => {
                warn!(run_name = %run_name, error = %e, "Failed to look up pod for run");
                false
            }
        }
    }
}
