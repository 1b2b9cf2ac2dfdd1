//! Interrupt processing.
//!
//! Each event is applied in order:
//! 1. Update the archive records named by its pending archive actions
//! 2. Delete the run's pod
//! 3. For `requeued`, create the archive record of the next attempt
//! 4. Requeue the run or finish it with the reason as result
//!
//! The status write comes last because it clears the interrupt: once it
//! lands the run is never collected again. A failure before it leaves the
//! run interrupted and without a pod, so the next pass picks it up
//! immediately. A failure stops that event only; the rest of the batch
//! still runs.

use std::sync::Arc;
use std::time::Duration;

use enginectl_runs::{ArchiveError, ArchiveStore, RegistryError, RunRegistry, RunStatus};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::deleter::PodDeleter;
use super::event::InterruptEvent;
use crate::calls::{archive_call, registry_call};
use crate::facade::EngineFacade;

/// Errors that stop a single interrupt event.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("status store update for run {run} failed: {source}")]
    Registry {
        run: String,
        #[source]
        source: RegistryError,
    },

    #[error("archive update of record {record} for run {run} failed: {source}")]
    Archive {
        run: String,
        record: String,
        #[source]
        source: ArchiveError,
    },
}

/// Outcome of processing a batch of events.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcessStats {
    /// False if the batch was dropped because dependencies were not ready.
    pub dependencies_ready: bool,
    pub events: usize,
    pub requeued: usize,
    pub finished: usize,
    /// Queued runs another controller allocated before they could be cancelled.
    pub skipped: usize,
    pub failed: usize,
    pub pods_deleted: usize,
}

enum Outcome {
    Requeued { pod_deleted: bool },
    Finished { pod_deleted: bool },
    Skipped,
}

/// Applies interrupt events to the registry, the archive and the cluster.
#[derive(Clone)]
pub struct InterruptProcessor {
    facade: EngineFacade,
    registry: Arc<dyn RunRegistry>,
    archive: Arc<dyn ArchiveStore>,
    deleter: PodDeleter,
    call_timeout: Duration,
}

impl InterruptProcessor {
    pub fn new(
        facade: EngineFacade,
        registry: Arc<dyn RunRegistry>,
        archive: Arc<dyn ArchiveStore>,
        call_timeout: Duration,
    ) -> Self {
        let deleter = PodDeleter::new(facade.clone());
        Self {
            facade,
            registry,
            archive,
            deleter,
            call_timeout,
        }
    }

    /// Process a batch of events.
    ///
    /// Dependency readiness is checked once for the whole batch: if the
    /// status store or archive is not ready, nothing is written.
    #[instrument(skip(self, events), fields(events = events.len()))]
    pub async fn process_events(&self, events: Vec<InterruptEvent>) -> ProcessStats {
        let mut stats = ProcessStats {
            events: events.len(),
            ..ProcessStats::default()
        };
        if events.is_empty() {
            return stats;
        }

        if !self.facade.dependencies_ready().await {
            warn!(
                events = events.len(),
                "Status store or archive not ready, not processing interrupted runs"
            );
            return stats;
        }
        stats.dependencies_ready = true;

        for event in &events {
            match self.process_event(event).await {
                Ok(Outcome::Requeued { pod_deleted }) => {
                    stats.requeued += 1;
                    stats.pods_deleted += usize::from(pod_deleted);
                }
                Ok(Outcome::Finished { pod_deleted }) => {
                    stats.finished += 1;
                    stats.pods_deleted += usize::from(pod_deleted);
                }
                Ok(Outcome::Skipped) => stats.skipped += 1,
                Err(e) => {
                    warn!(run_name = %event.run_name, error = %e, "Failed to process interrupted run");
                    stats.failed += 1;
                }
            }
        }

        info!(
            requeued = stats.requeued,
            finished = stats.finished,
            skipped = stats.skipped,
            failed = stats.failed,
            "Interrupt processing complete"
        );
        stats
    }

    async fn process_event(&self, event: &InterruptEvent) -> Result<Outcome, ProcessError> {
        let run_name = event.run_name.as_str();
        let registry_err = |source| ProcessError::Registry {
            run: run_name.to_string(),
            source,
        };

        if event.status_at_detection == RunStatus::Queued {
            let cancelling = registry_call(
                self.call_timeout,
                self.registry.mark_cancelling(run_name, RunStatus::Queued),
            )
            .await
            .map_err(registry_err)?;
            if !cancelling {
                info!(run_name = %run_name, "Queued run was allocated before it could be cancelled");
                return Ok(Outcome::Skipped);
            }
        }

        for action in &event.archive_actions {
            let updated = archive_call(
                self.call_timeout,
                self.archive
                    .update_record_status(&action.archive_run_id, action.status, &action.result),
            )
            .await;
            match updated {
                Ok(()) => debug!(
                    run_name = %run_name,
                    record = %action.archive_run_id,
                    status = %action.status,
                    result = %action.result,
                    "Archive record updated"
                ),
                Err(ArchiveError::NotFound(record)) => {
                    warn!(run_name = %run_name, record = %record, "Archive record no longer exists");
                }
                Err(source) => {
                    return Err(ProcessError::Archive {
                        run: run_name.to_string(),
                        record: action.archive_run_id.clone(),
                        source,
                    })
                }
            }
        }

        let pod_deleted = self.deleter.delete_run_pod(run_name).await;

        if !event.reason.is_requeue() {
            registry_call(
                self.call_timeout,
                self.registry.mark_finished(run_name, event.reason.as_str()),
            )
            .await
            .map_err(registry_err)?;
            info!(run_name = %run_name, result = %event.reason, "Interrupted run finished");
            return Ok(Outcome::Finished { pod_deleted });
        }

        let record = if event.archive_run_id.is_some() {
            let record = archive_call(
                self.call_timeout,
                self.archive.create_record(run_name, RunStatus::Queued),
            )
            .await
            .map_err(|source| ProcessError::Archive {
                run: run_name.to_string(),
                record: "new".to_string(),
                source,
            })?;
            Some(record)
        } else {
            None
        };

        registry_call(self.call_timeout, self.registry.mark_queued(run_name))
            .await
            .map_err(registry_err)?;
        info!(run_name = %run_name, "Interrupted run requeued");

        if let Some(record) = record {
            registry_call(
                self.call_timeout,
                self.registry.set_archive_run_id(run_name, &record),
            )
            .await
            .map_err(registry_err)?;
            debug!(run_name = %run_name, record = %record, "Archive record created for new attempt");
        }
        Ok(Outcome::Requeued { pod_deleted })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enginectl_runs::memory::{InMemoryArchive, InMemoryRunRegistry};
    use enginectl_runs::{results, ArchiveAction, InterruptReason, Run};

    use crate::cluster::{EnginePod, MockCluster, RUN_LABEL_KEY};

    const NS: &str = "engines";
    const INSTALL: &str = "inst";

    struct Fixture {
        cluster: Arc<MockCluster>,
        registry: Arc<InMemoryRunRegistry>,
        archive: Arc<InMemoryArchive>,
        processor: InterruptProcessor,
    }

    async fn fixture() -> Fixture {
        let cluster = Arc::new(MockCluster::new());
        cluster.add_ready_dependencies(NS, INSTALL).await;
        let registry = Arc::new(InMemoryRunRegistry::new());
        let archive = Arc::new(InMemoryArchive::new());
        let processor = InterruptProcessor::new(
            EngineFacade::new(cluster.clone(), NS, INSTALL, Duration::from_secs(5)),
            registry.clone(),
            archive.clone(),
            Duration::from_secs(5),
        );
        Fixture {
            cluster,
            registry,
            archive,
            processor,
        }
    }

    /// A running run with a pod and an archive record, interrupted for `reason`.
    async fn interrupted(f: &Fixture, name: &str, reason: &str) -> InterruptEvent {
        let record = format!("arc_{name}");
        let action = ArchiveAction::new(&record, RunStatus::Finished, reason);
        f.archive.insert(&record, name, RunStatus::Running).await;
        f.registry
            .insert(
                Run::new(name, RunStatus::Running)
                    .with_interrupt(reason, None)
                    .with_archive_run_id(&record)
                    .with_archive_action(action.clone()),
            )
            .await;
        f.cluster
            .add_pod(
                NS,
                EnginePod::new(format!("engine-{}", name.to_lowercase())).with_label(RUN_LABEL_KEY, name),
            )
            .await;
        InterruptEvent {
            run_name: name.to_string(),
            reason: InterruptReason::from(reason),
            interrupted_at: None,
            status_at_detection: RunStatus::Running,
            archive_run_id: Some(record),
            archive_actions: vec![action],
        }
    }

    #[tokio::test]
    async fn test_cancel_finishes_run_and_archive_record() {
        let f = fixture().await;
        let event = interrupted(&f, "U1", "cancelled").await;

        let stats = f.processor.process_events(vec![event]).await;
        assert_eq!(stats.finished, 1);
        assert_eq!(stats.pods_deleted, 1);

        let run = f.registry.get_run("U1").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Finished);
        assert_eq!(run.result.as_deref(), Some(results::CANCELLED));
        let record = f.archive.record("arc_U1").await.unwrap();
        assert_eq!(record.status, RunStatus::Finished);
        assert_eq!(record.result.as_deref(), Some(results::CANCELLED));
        assert!(f.cluster.pod(NS, "engine-u1").await.is_none());
    }

    #[tokio::test]
    async fn test_requeue_resets_run_and_opens_new_record() {
        let f = fixture().await;
        let event = interrupted(&f, "U1", "requeued").await;

        let stats = f.processor.process_events(vec![event]).await;
        assert_eq!(stats.requeued, 1);

        let run = f.registry.get_run("U1").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Queued);
        assert!(run.interrupt_reason.is_none());
        let old = f.archive.record("arc_U1").await.unwrap();
        assert_eq!(old.status, RunStatus::Finished);
        assert_eq!(old.result.as_deref(), Some(results::REQUEUED));

        let new_id = run.archive_run_id.unwrap();
        assert_ne!(new_id, "arc_U1");
        assert_eq!(f.archive.record(&new_id).await.unwrap().status, RunStatus::Queued);
        assert!(f.cluster.pod(NS, "engine-u1").await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_reason_is_treated_as_cancel() {
        let f = fixture().await;
        let event = interrupted(&f, "U1", "operator-abort").await;

        f.processor.process_events(vec![event]).await;
        let run = f.registry.get_run("U1").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Finished);
        assert_eq!(run.result.as_deref(), Some("operator-abort"));
    }

    #[tokio::test]
    async fn test_failure_is_isolated_to_one_event() {
        let f = fixture().await;
        let first = interrupted(&f, "U1", "cancelled").await;
        let second = interrupted(&f, "U2", "cancelled").await;
        f.registry.fail_writes_for("U1").await;

        let stats = f.processor.process_events(vec![first, second]).await;
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.finished, 1);

        assert!(f.cluster.pod(NS, "engine-u1").await.is_none());
        assert!(f.cluster.pod(NS, "engine-u2").await.is_none());
        let u1 = f.registry.get_run("U1").await.unwrap().unwrap();
        assert_eq!(u1.status, RunStatus::Running);
        assert!(u1.interrupt_reason.is_some());
        let u2 = f.registry.get_run("U2").await.unwrap().unwrap();
        assert_eq!(u2.status, RunStatus::Finished);
        assert_eq!(
            f.archive.record("arc_U2").await.unwrap().status,
            RunStatus::Finished
        );
    }

    #[tokio::test]
    async fn test_requeue_record_failure_keeps_run_interrupted() {
        let f = fixture().await;
        let event = interrupted(&f, "U1", "requeued").await;
        f.archive.set_fail_creates(true);

        let stats = f.processor.process_events(vec![event.clone()]).await;
        assert_eq!(stats.failed, 1);
        assert!(f.cluster.pod(NS, "engine-u1").await.is_none());
        let run = f.registry.get_run("U1").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.interrupt_reason.is_some());
        assert_eq!(run.archive_run_id.as_deref(), Some("arc_U1"));

        f.archive.set_fail_creates(false);
        let stats = f.processor.process_events(vec![event]).await;
        assert_eq!(stats.requeued, 1);
        assert_eq!(stats.pods_deleted, 0);
        let run = f.registry.get_run("U1").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Queued);
        assert_ne!(run.archive_run_id.as_deref(), Some("arc_U1"));
        assert_eq!(f.archive.records_for("U1").await.len(), 2);
    }

    #[tokio::test]
    async fn test_requeue_without_archive_record_creates_none() {
        let f = fixture().await;
        let mut event = interrupted(&f, "U1", "requeued").await;
        event.archive_run_id = None;
        event.archive_actions.clear();

        let stats = f.processor.process_events(vec![event]).await;
        assert_eq!(stats.requeued, 1);
        assert_eq!(f.archive.records_for("U1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_archive_failure_leaves_run_for_next_pass() {
        let f = fixture().await;
        let event = interrupted(&f, "U1", "cancelled").await;
        f.archive.set_fail_writes(true);

        let stats = f.processor.process_events(vec![event]).await;
        assert_eq!(stats.failed, 1);
        let run = f.registry.get_run("U1").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert!(f.cluster.pod(NS, "engine-u1").await.is_some());
    }

    #[tokio::test]
    async fn test_batch_dropped_when_dependencies_not_ready() {
        let f = fixture().await;
        let event = interrupted(&f, "U1", "cancelled").await;
        f.cluster.fail_list_selector("app=inst-etcd").await;

        let stats = f.processor.process_events(vec![event]).await;
        assert!(!stats.dependencies_ready);
        assert_eq!(stats.finished + stats.failed, 0);
        let run = f.registry.get_run("U1").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn test_queued_run_allocated_elsewhere_is_skipped() {
        let f = fixture().await;
        f.registry
            .insert(Run::new("U1", RunStatus::Allocated).with_interrupt("cancelled", None))
            .await;
        let event = InterruptEvent {
            run_name: "U1".to_string(),
            reason: InterruptReason::Cancelled,
            interrupted_at: None,
            status_at_detection: RunStatus::Queued,
            archive_run_id: None,
            archive_actions: Vec::new(),
        };

        let stats = f.processor.process_events(vec![event]).await;
        assert_eq!(stats.skipped, 1);
        let run = f.registry.get_run("U1").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Allocated);
    }

    #[tokio::test]
    async fn test_queued_run_without_pod_is_cancelled() {
        let f = fixture().await;
        f.registry
            .insert(Run::new("U1", RunStatus::Queued).with_interrupt("cancelled", None))
            .await;
        let event = InterruptEvent {
            run_name: "U1".to_string(),
            reason: InterruptReason::Cancelled,
            interrupted_at: None,
            status_at_detection: RunStatus::Queued,
            archive_run_id: None,
            archive_actions: Vec::new(),
        };

        let stats = f.processor.process_events(vec![event]).await;
        assert_eq!(stats.finished, 1);
        assert_eq!(stats.pods_deleted, 0);
        let run = f.registry.get_run("U1").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Finished);
    }
}
