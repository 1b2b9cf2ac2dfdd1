//! Interrupt collection.
//!
//! A pass reads every interrupted run that has not finished yet and decides
//! whether it can be torn down now:
//! - No pod: eligible at once, there is nothing to wait for
//! - A pod: eligible once the grace period since `interrupted_at` has passed
//!
//! Nothing is collected while the status store or archive is not ready.
//! Eligibility is always derived from the registry and the cluster, so a
//! run that failed to process is picked up again by the next pass.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use enginectl_reconcile::{grace_period_elapsed, Clock};
use enginectl_runs::{ArchiveAction, RegistryError, Run, RunRegistry, RunStatus};
use tracing::{debug, info, instrument, warn};

use super::event::InterruptEvent;
use crate::calls::registry_call;
use crate::facade::EngineFacade;
use crate::settings::SharedSettings;

/// Finds interrupted runs that are ready to be torn down.
#[derive(Clone)]
pub struct InterruptCollector {
    facade: EngineFacade,
    registry: Arc<dyn RunRegistry>,
    settings: SharedSettings,
    clock: Arc<dyn Clock>,
    call_timeout: Duration,
}

impl InterruptCollector {
    pub fn new(
        facade: EngineFacade,
        registry: Arc<dyn RunRegistry>,
        settings: SharedSettings,
        clock: Arc<dyn Clock>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            facade,
            registry,
            settings,
            clock,
            call_timeout,
        }
    }

    /// Collect events for every interrupted run that is due for teardown.
    #[instrument(skip(self))]
    pub async fn collect(&self) -> Result<Vec<InterruptEvent>, RegistryError> {
        if !self.facade.dependencies_ready().await {
            warn!("Status store or archive not ready, not collecting interrupted runs");
            return Ok(Vec::new());
        }

        let runs = registry_call(self.call_timeout, self.registry.get_interrupted_runs()).await?;
        let events = self.evaluate_all(runs).await;
        if !events.is_empty() {
            info!(count = events.len(), "Collected interrupted runs");
        }
        Ok(events)
    }

    /// Collect events for the named runs only, using the same rules as
    /// [`collect`](Self::collect).
    #[instrument(skip(self, run_names))]
    pub async fn collect_for_runs(
        &self,
        run_names: &BTreeSet<String>,
    ) -> Result<Vec<InterruptEvent>, RegistryError> {
        if !self.facade.dependencies_ready().await {
            warn!("Status store or archive not ready, not collecting interrupted runs");
            return Ok(Vec::new());
        }

        let mut runs = Vec::with_capacity(run_names.len());
        for name in run_names {
            match registry_call(self.call_timeout, self.registry.get_run(name)).await? {
                Some(run) => runs.push(run),
                None => debug!(run_name = %name, "Run no longer exists"),
            }
        }
        Ok(self.evaluate_all(runs).await)
    }

    async fn evaluate_all(&self, runs: Vec<Run>) -> Vec<InterruptEvent> {
        let grace = self.settings.current().interrupt_grace_period;
        let mut events = Vec::new();
        for run in runs.into_iter().filter(Run::needs_teardown) {
            if let Some(event) = self.evaluate(run, grace).await {
                events.push(event);
            }
        }
        events
    }

    async fn evaluate(&self, mut run: Run, grace: Duration) -> Option<InterruptEvent> {
        let reason = run.interrupt_reason.clone()?;

        let pod = match self.facade.pod_for_run(&run.name).await {
            Ok(pod) => pod,
            Err(e) => {
                warn!(run_name = %run.name, error = %e, "Failed to look up pod for interrupted run");
                return None;
            }
        };

        if pod.is_some() && !grace_period_elapsed(run.interrupted_at, self.clock.now(), grace) {
            debug!(
                run_name = %run.name,
                grace_secs = grace.as_secs(),
                "Interrupted run still within grace period"
            );
            return None;
        }

        if let Some(archive_run_id) = run.archive_run_id.clone() {
            let provisioned = run
                .pending_archive_actions
                .iter()
                .any(|action| action.archive_run_id == archive_run_id);
            if !provisioned {
                let action = ArchiveAction::new(archive_run_id, RunStatus::Finished, reason.as_str());
                if let Err(e) = registry_call(
                    self.call_timeout,
                    self.registry.append_archive_action(&run.name, action.clone()),
                )
                .await
                {
                    warn!(run_name = %run.name, error = %e, "Failed to record archive action");
                    return None;
                }
                run.pending_archive_actions.push(action);
            }
        }

        debug!(run_name = %run.name, reason = %reason, has_pod = pod.is_some(), "Run due for teardown");
        Some(InterruptEvent {
            run_name: run.name,
            reason,
            interrupted_at: run.interrupted_at,
            status_at_detection: run.status,
            archive_run_id: run.archive_run_id,
            archive_actions: run.pending_archive_actions,
        })
    }
}
