//! Terminated engine pod cleanup.
//!
//! Engine pods stay around after their run completes so their logs can be
//! read. Once a pod has terminated and its run is finished, or the run is
//! gone from the registry, the pod is deleted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use enginectl_runs::{Run, RunRegistry, RunStatus};
use tracing::{debug, info, instrument, warn};

use crate::calls::registry_call;
use crate::facade::EngineFacade;
use crate::settings::SharedSettings;

/// Outcome of a cleanup pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupStats {
    /// False if the pass was skipped because dependencies were not ready.
    pub dependencies_ready: bool,
    pub terminated: usize,
    pub deleted: usize,
}

/// Deletes terminated engine pods whose run no longer needs them.
#[derive(Clone)]
pub struct RunPodCleanup {
    facade: EngineFacade,
    registry: Arc<dyn RunRegistry>,
    settings: SharedSettings,
    call_timeout: Duration,
}

impl RunPodCleanup {
    pub fn new(
        facade: EngineFacade,
        registry: Arc<dyn RunRegistry>,
        settings: SharedSettings,
        call_timeout: Duration,
    ) -> Self {
        Self {
            facade,
            registry,
            settings,
            call_timeout,
        }
    }

    #[instrument(skip(self))]
    pub async fn cleanup(&self) -> Result<CleanupStats> {
        let mut stats = CleanupStats::default();

        if !self.facade.dependencies_ready().await {
            warn!("Status store or archive not ready, not cleaning up engine pods");
            return Ok(stats);
        }
        stats.dependencies_ready = true;

        let engine_label = self.settings.current().engine_label.clone();
        let pods = self
            .facade
            .pods_for_engine(&engine_label)
            .await
            .context("failed to list engine pods")?;
        let terminated = EngineFacade::terminated_pods(&pods);
        stats.terminated = terminated.len();
        if terminated.is_empty() {
            return Ok(stats);
        }

        let runs: HashMap<String, Run> = registry_call(self.call_timeout, self.registry.all_runs())
            .await
            .context("failed to list runs")?
            .into_iter()
            .map(|run| (run.name.clone(), run))
            .collect();

        for pod in &terminated {
            let Some(run_name) = pod.run_label() else {
                debug!(pod_name = %pod.name, "Terminated pod has no run label, leaving it");
                continue;
            };

            let remove = match runs.get(run_name) {
                None => true,
                Some(run) => run.status == RunStatus::Finished,
            };
            if remove {
                info!(pod_name = %pod.name, run_name = %run_name, "Deleting terminated engine pod");
                self.facade.delete_pod(pod).await;
                stats.deleted += 1;
            }
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enginectl_runs::memory::InMemoryRunRegistry;

    use crate::cluster::{EnginePod, MockCluster, PodPhase, ENGINE_LABEL_KEY, RUN_LABEL_KEY};
    use crate::settings::Settings;

    const NS: &str = "engines";
    const INSTALL: &str = "inst";

    fn engine_pod(name: &str, run: Option<&str>, phase: PodPhase) -> EnginePod {
        let pod = EnginePod::new(name)
            .with_label(ENGINE_LABEL_KEY, &Settings::default().engine_label)
            .with_phase(phase);
        match run {
            Some(run) => pod.with_label(RUN_LABEL_KEY, run),
            None => pod,
        }
    }

    async fn cleanup_with(cluster: Arc<MockCluster>, registry: Arc<InMemoryRunRegistry>) -> RunPodCleanup {
        RunPodCleanup::new(
            EngineFacade::new(cluster, NS, INSTALL, Duration::from_secs(5)),
            registry,
            SharedSettings::new(Settings::default()),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_deletes_terminated_pods_of_finished_or_missing_runs() {
        let cluster = Arc::new(MockCluster::new());
        cluster.add_ready_dependencies(NS, INSTALL).await;
        let registry = Arc::new(InMemoryRunRegistry::new());
        registry.insert(Run::new("U1", RunStatus::Finished)).await;
        registry.insert(Run::new("U2", RunStatus::Rundone)).await;
        registry.insert(Run::new("U4", RunStatus::Finished)).await;

        cluster.add_pod(NS, engine_pod("e-u1", Some("U1"), PodPhase::Succeeded)).await;
        cluster.add_pod(NS, engine_pod("e-u2", Some("U2"), PodPhase::Failed)).await;
        cluster.add_pod(NS, engine_pod("e-u3", Some("U3"), PodPhase::Failed)).await;
        cluster.add_pod(NS, engine_pod("e-u4", Some("U4"), PodPhase::Running)).await;
        cluster.add_pod(NS, engine_pod("e-none", None, PodPhase::Succeeded)).await;

        let stats = cleanup_with(cluster.clone(), registry).await.cleanup().await.unwrap();
        assert_eq!(stats.terminated, 4);
        assert_eq!(stats.deleted, 2);

        let mut deleted = cluster.deleted().await;
        deleted.sort();
        assert_eq!(deleted, vec!["e-u1", "e-u3"]);
    }

    #[tokio::test]
    async fn test_skipped_when_dependencies_not_ready() {
        let cluster = Arc::new(MockCluster::new());
        let registry = Arc::new(InMemoryRunRegistry::new());
        cluster.add_pod(NS, engine_pod("e-u1", Some("U1"), PodPhase::Succeeded)).await;

        let stats = cleanup_with(cluster.clone(), registry).await.cleanup().await.unwrap();
        assert!(!stats.dependencies_ready);
        assert!(cluster.deleted().await.is_empty());
    }
}
