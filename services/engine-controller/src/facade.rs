//! Engine-level operations over the cluster client.
//!
//! The facade knows which pods belong to this controller, which pod serves a
//! run, and whether the status store and result archive are up. Every call
//! into the cluster is bounded by the configured per-call timeout.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, info, instrument, warn};

use crate::cluster::{
    dependency_app_labels, label_selector, ClusterClient, ClusterError, ConfigMapData, EnginePod,
    APP_LABEL_KEY, ENGINE_LABEL_KEY, RUN_LABEL_KEY,
};

/// Domain view of the orchestrator for one namespace.
#[derive(Clone)]
pub struct EngineFacade {
    client: Arc<dyn ClusterClient>,
    namespace: String,
    install_name: String,
    call_timeout: Duration,
}

impl EngineFacade {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        namespace: impl Into<String>,
        install_name: impl Into<String>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            install_name: install_name.into(),
            call_timeout,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Every pod owned by controllers using `engine_label`.
    pub async fn pods_for_engine(&self, engine_label: &str) -> Result<Vec<EnginePod>, ClusterError> {
        let selector = label_selector(&[(ENGINE_LABEL_KEY, engine_label)]);
        self.call(self.client.list_pods(&self.namespace, &selector)).await
    }

    /// The pod executing `run_name`, if there is one.
    pub async fn pod_for_run(&self, run_name: &str) -> Result<Option<EnginePod>, ClusterError> {
        let selector = label_selector(&[(RUN_LABEL_KEY, run_name)]);
        let pods = self
            .call(self.client.list_pods(&self.namespace, &selector))
            .await?;
        if pods.len() > 1 {
            warn!(run_name = %run_name, count = pods.len(), "More than one pod found for run");
        }
        Ok(pods.into_iter().next())
    }

    /// Pods that are neither succeeded nor failed.
    pub fn active_pods(pods: &[EnginePod]) -> Vec<EnginePod> {
        pods.iter().filter(|pod| !pod.is_terminated()).cloned().collect()
    }

    /// Pods that have succeeded or failed.
    pub fn terminated_pods(pods: &[EnginePod]) -> Vec<EnginePod> {
        pods.iter().filter(|pod| pod.is_terminated()).cloned().collect()
    }

    /// Delete a pod. Failures are logged, never returned.
    pub async fn delete_pod(&self, pod: &EnginePod) {
        info!(pod_name = %pod.name, "Deleting pod");
        match self.call(self.client.delete_pod(&self.namespace, &pod.name)).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(pod_name = %pod.name, "Pod already gone");
            }
            Err(e) => {
                warn!(pod_name = %pod.name, error = %e, "Failed to delete engine pod");
            }
        }
    }

    /// True only if the status-store and archive pods all report every
    /// container ready. An app with no pods, or any error while looking,
    /// counts as not ready.
    #[instrument(skip(self))]
    pub async fn dependencies_ready(&self) -> bool {
        for app in dependency_app_labels(&self.install_name) {
            let selector = label_selector(&[(APP_LABEL_KEY, app.as_str())]);
            let pods = match self
                .call(self.client.list_pods(&self.namespace, &selector))
                .await
            {
                Ok(pods) => pods,
                Err(e) => {
                    warn!(app = %app, error = %e, "Failed to check dependency pods");
                    return false;
                }
            };

            if pods.is_empty() {
                warn!(app = %app, "No dependency pods found");
                return false;
            }

            if let Some(pod) = pods.iter().find(|pod| !pod.all_containers_ready()) {
                warn!(app = %app, pod_name = %pod.name, "Dependency pod not ready");
                return false;
            }
        }
        true
    }

    pub async fn create_pod(&self, pod: &Pod) -> Result<EnginePod, ClusterError> {
        self.call(self.client.create_pod(&self.namespace, pod)).await
    }

    pub async fn read_config_map(&self, name: &str) -> Result<ConfigMapData, ClusterError> {
        self.call(self.client.read_config_map(&self.namespace, name)).await
    }

    async fn call<T>(
        &self,
        fut: impl Future<Output = Result<T, ClusterError>>,
    ) -> Result<T, ClusterError> {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ClusterError::Timeout(self.call_timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{MockCluster, PodPhase};
    use async_trait::async_trait;

    const NS: &str = "engines";
    const INSTALL: &str = "inst";

    fn facade(cluster: Arc<MockCluster>) -> EngineFacade {
        EngineFacade::new(cluster, NS, INSTALL, Duration::from_secs(5))
    }

    #[test]
    fn test_classify_pods() {
        let pods = vec![
            EnginePod::new("running").with_phase(PodPhase::Running),
            EnginePod::new("pending").with_phase(PodPhase::Pending),
            EnginePod::new("no-status"),
            EnginePod::new("ok").with_phase(PodPhase::Succeeded),
            EnginePod::new("bad").with_phase(PodPhase::Failed),
        ];

        let active: Vec<_> = EngineFacade::active_pods(&pods)
            .into_iter()
            .map(|p| p.name)
            .collect();
        let terminated: Vec<_> = EngineFacade::terminated_pods(&pods)
            .into_iter()
            .map(|p| p.name)
            .collect();

        assert_eq!(active, vec!["running", "pending", "no-status"]);
        assert_eq!(terminated, vec!["ok", "bad"]);
    }

    #[tokio::test]
    async fn test_dependencies_ready() {
        let cluster = Arc::new(MockCluster::new());
        cluster.add_ready_dependencies(NS, INSTALL).await;
        assert!(facade(cluster).dependencies_ready().await);
    }

    #[tokio::test]
    async fn test_dependencies_not_ready_when_archive_missing() {
        let cluster = Arc::new(MockCluster::new());
        cluster.add_dependency(NS, "etcd-0", "inst-etcd", true).await;
        assert!(!facade(cluster).dependencies_ready().await);
    }

    #[tokio::test]
    async fn test_dependencies_not_ready_when_one_pod_unready() {
        let cluster = Arc::new(MockCluster::new());
        cluster.add_ready_dependencies(NS, INSTALL).await;
        cluster.add_dependency(NS, "ras-1", "inst-ras", false).await;
        assert!(!facade(cluster).dependencies_ready().await);
    }

    #[tokio::test]
    async fn test_dependencies_not_ready_on_error() {
        let cluster = Arc::new(MockCluster::new());
        cluster.add_ready_dependencies(NS, INSTALL).await;
        cluster.fail_list_selector("app=inst-ras").await;
        assert!(!facade(cluster).dependencies_ready().await);
    }

    #[tokio::test]
    async fn test_pod_for_run() {
        let cluster = Arc::new(MockCluster::new());
        cluster
            .add_pod(NS, EnginePod::new("engine-u1").with_label(RUN_LABEL_KEY, "U1"))
            .await;
        let facade = facade(cluster);

        let pod = facade.pod_for_run("U1").await.unwrap();
        assert_eq!(pod.map(|p| p.name).as_deref(), Some("engine-u1"));
        assert!(facade.pod_for_run("U2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_pod_swallows_errors() {
        let cluster = Arc::new(MockCluster::new());
        let facade = facade(cluster.clone());

        // Not found
        facade.delete_pod(&EnginePod::new("ghost")).await;

        // Transport failure
        cluster.add_pod(NS, EnginePod::new("p1")).await;
        cluster.set_fail_deletes(true);
        facade.delete_pod(&EnginePod::new("p1")).await;
        assert!(cluster.pod(NS, "p1").await.is_some());
    }

    struct StalledCluster;

    #[async_trait]
    impl ClusterClient for StalledCluster {
        async fn list_pods(&self, _: &str, _: &str) -> Result<Vec<EnginePod>, ClusterError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }

        async fn create_pod(&self, _: &str, _: &Pod) -> Result<EnginePod, ClusterError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(ClusterError::Other("unreachable".to_string()))
        }

        async fn delete_pod(&self, _: &str, _: &str) -> Result<(), ClusterError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }

        async fn read_config_map(&self, _: &str, _: &str) -> Result<ConfigMapData, ClusterError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(ConfigMapData::default())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_calls_time_out() {
        let facade = EngineFacade::new(Arc::new(StalledCluster), NS, INSTALL, Duration::from_secs(1));

        let err = facade.pods_for_engine("engine").await.unwrap_err();
        assert!(matches!(err, ClusterError::Timeout(_)));
        assert!(!facade.dependencies_ready().await);
    }
}
