//! In-memory cluster for testing and dry runs.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use super::{
    dependency_app_labels, ClusterClient, ClusterError, ConfigMapData, EnginePod, PodPhase,
    APP_LABEL_KEY,
};

type Key = (String, String);

/// Mock cluster holding pods and config maps in memory.
///
/// Created pods start `Pending` with one unready container. Failure hooks
/// simulate creation conflicts, list outages and delete failures.
pub struct MockCluster {
    pods: RwLock<BTreeMap<Key, EnginePod>>,
    config_maps: RwLock<BTreeMap<Key, ConfigMapData>>,

    /// Number of upcoming creates that fail with a conflict.
    conflicts_remaining: AtomicU32,
    create_attempts: AtomicU32,
    failing_selectors: Mutex<HashSet<String>>,
    fail_lists: AtomicBool,
    fail_deletes: AtomicBool,
    deleted: Mutex<Vec<String>>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self {
            pods: RwLock::new(BTreeMap::new()),
            config_maps: RwLock::new(BTreeMap::new()),
            conflicts_remaining: AtomicU32::new(0),
            create_attempts: AtomicU32::new(0),
            failing_selectors: Mutex::new(HashSet::new()),
            fail_lists: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
            deleted: Mutex::new(Vec::new()),
        }
    }

    /// Add or replace a pod.
    pub async fn add_pod(&self, namespace: &str, pod: EnginePod) {
        self.pods
            .write()
            .await
            .insert((namespace.to_string(), pod.name.clone()), pod);
    }

    /// Add ready status-store and archive pods for an install.
    pub async fn add_ready_dependencies(&self, namespace: &str, install_name: &str) {
        for app in dependency_app_labels(install_name) {
            self.add_pod(namespace, dependency_pod(&format!("{app}-0"), &app, true))
                .await;
        }
    }

    /// Add a single dependency pod for `app` with the given readiness.
    pub async fn add_dependency(&self, namespace: &str, name: &str, app: &str, ready: bool) {
        self.add_pod(namespace, dependency_pod(name, app, ready)).await;
    }

    pub async fn set_phase(&self, namespace: &str, name: &str, phase: PodPhase) {
        if let Some(pod) = self
            .pods
            .write()
            .await
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            pod.phase = Some(phase);
        }
    }

    pub async fn set_config_map(&self, namespace: &str, name: &str, data: ConfigMapData) {
        self.config_maps
            .write()
            .await
            .insert((namespace.to_string(), name.to_string()), data);
    }

    /// Every pod in a namespace, by name.
    pub async fn pods(&self, namespace: &str) -> Vec<EnginePod> {
        self.pods
            .read()
            .await
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, pod)| pod.clone())
            .collect()
    }

    pub async fn pod(&self, namespace: &str, name: &str) -> Option<EnginePod> {
        self.pods
            .read()
            .await
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Fail the next `count` creates with a conflict.
    pub fn inject_conflicts(&self, count: u32) {
        self.conflicts_remaining.store(count, Ordering::SeqCst);
    }

    pub fn create_attempts(&self) -> u32 {
        self.create_attempts.load(Ordering::SeqCst)
    }

    /// Fail every list using exactly this selector.
    pub async fn fail_list_selector(&self, selector: &str) {
        self.failing_selectors
            .lock()
            .await
            .insert(selector.to_string());
    }

    pub fn set_fail_lists(&self, fail: bool) {
        self.fail_lists.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Names of pods deleted so far, in order.
    pub async fn deleted(&self) -> Vec<String> {
        self.deleted.lock().await.clone()
    }
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

fn dependency_pod(name: &str, app: &str, ready: bool) -> EnginePod {
    EnginePod::new(name)
        .with_label(APP_LABEL_KEY, app)
        .with_phase(PodPhase::Running)
        .with_containers_ready(&[ready])
}

#[async_trait]
impl ClusterClient for MockCluster {
    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<EnginePod>, ClusterError> {
        if self.fail_lists.load(Ordering::SeqCst)
            || self.failing_selectors.lock().await.contains(label_selector)
        {
            return Err(ClusterError::Other(format!(
                "[MOCK] list failed for {label_selector}"
            )));
        }

        Ok(self
            .pods
            .read()
            .await
            .iter()
            .filter(|((ns, _), pod)| ns == namespace && pod.matches_selector(label_selector))
            .map(|(_, pod)| pod.clone())
            .collect())
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<EnginePod, ClusterError> {
        self.create_attempts.fetch_add(1, Ordering::SeqCst);

        let name = pod.metadata.name.clone().unwrap_or_default();
        let injected = self
            .conflicts_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            debug!(pod_name = %name, "[MOCK] Injected create conflict");
            return Err(ClusterError::Conflict(format!("pod {name} already exists")));
        }

        let key = (namespace.to_string(), name.clone());
        let mut pods = self.pods.write().await;
        if pods.contains_key(&key) {
            return Err(ClusterError::Conflict(format!("pod {name} already exists")));
        }

        let mut created = EnginePod::from_pod(pod);
        created.phase = Some(PodPhase::Pending);
        created.container_ready = vec![false];
        pods.insert(key, created.clone());

        info!(pod_name = %name, namespace = %namespace, "[MOCK] Created pod");
        Ok(created)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(ClusterError::Other(format!("[MOCK] delete failed for {name}")));
        }

        let removed = self
            .pods
            .write()
            .await
            .remove(&(namespace.to_string(), name.to_string()));
        match removed {
            Some(_) => {
                self.deleted.lock().await.push(name.to_string());
                info!(pod_name = %name, namespace = %namespace, "[MOCK] Deleted pod");
                Ok(())
            }
            None => Err(ClusterError::NotFound(format!("pod {name}"))),
        }
    }

    async fn read_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ConfigMapData, ClusterError> {
        self.config_maps
            .read()
            .await
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(format!("config map {name}")))
    }
}
