//! Container orchestrator interface.
//!
//! [`ClusterClient`] is the thin boundary to the orchestrator: list, create
//! and delete pods, and read config maps. It carries no retry or business
//! logic. Orchestrator failures come back as [`ClusterError`] variants so
//! callers can match on conflict and not-found instead of inspecting
//! transport errors.
//!
//! Two implementations are provided:
//! - [`KubeClusterClient`]: talks to a real Kubernetes API server
//! - [`MockCluster`]: in-memory pods and config maps for tests and dry runs

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use thiserror::Error;

mod kube_client;
mod mock;

pub use kube_client::KubeClusterClient;
pub use mock::MockCluster;

/// Label carrying the engine label of the controller that owns a pod.
pub const ENGINE_LABEL_KEY: &str = "engine-controller";

/// Label carrying the name of the run a pod executes.
pub const RUN_LABEL_KEY: &str = "engine-run";

/// Label identifying the app a dependency pod belongs to.
pub const APP_LABEL_KEY: &str = "app";

/// Orchestrator errors.
#[derive(Debug, Error, Clone)]
pub enum ClusterError {
    /// An object with the same name already exists, or a write raced another.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The call did not complete within the per-call timeout.
    #[error("orchestrator call timed out after {0:?}")]
    Timeout(Duration),

    /// The API server rejected the request.
    #[error("api error {code}: {message}")]
    Api { code: u16, message: String },

    /// Transport or client-side failure.
    #[error("{0}")]
    Other(String),
}

impl ClusterError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, ClusterError::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }
}

/// Pod lifecycle phase as reported by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    /// Parse a phase string. Anything unrecognised is `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s {
            "Pending" => PodPhase::Pending,
            "Running" => PodPhase::Running,
            "Succeeded" => PodPhase::Succeeded,
            "Failed" => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PodPhase::Pending => "Pending",
            PodPhase::Running => "Running",
            PodPhase::Succeeded => "Succeeded",
            PodPhase::Failed => "Failed",
            PodPhase::Unknown => "Unknown",
        }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }
}

impl std::fmt::Display for PodPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The parts of a pod the controller looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnginePod {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    /// `None` when the orchestrator has not reported a status yet.
    pub phase: Option<PodPhase>,
    /// Readiness of each container, in status order.
    pub container_ready: Vec<bool>,
}

impl EnginePod {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: BTreeMap::new(),
            phase: None,
            container_ready: Vec::new(),
        }
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_phase(mut self, phase: PodPhase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn with_containers_ready(mut self, ready: &[bool]) -> Self {
        self.container_ready = ready.to_vec();
        self
    }

    /// Name of the run this pod executes, absent for non-test pods.
    pub fn run_label(&self) -> Option<&str> {
        self.labels.get(RUN_LABEL_KEY).map(String::as_str)
    }

    pub fn engine_label(&self) -> Option<&str> {
        self.labels.get(ENGINE_LABEL_KEY).map(String::as_str)
    }

    /// Succeeded or failed. A pod without a status is still active.
    pub fn is_terminated(&self) -> bool {
        self.phase.is_some_and(|phase| phase.is_terminated())
    }

    /// True if the pod reports at least one container and all are ready.
    pub fn all_containers_ready(&self) -> bool {
        !self.container_ready.is_empty() && self.container_ready.iter().all(|ready| *ready)
    }

    /// True if every `key=value` pair in `selector` matches a label.
    pub fn matches_selector(&self, selector: &str) -> bool {
        parse_selector(selector)
            .iter()
            .all(|(key, value)| self.labels.get(*key).map(String::as_str) == Some(*value))
    }

    /// Extract the controller's view of an orchestrator pod.
    pub fn from_pod(pod: &Pod) -> Self {
        let status = pod.status.as_ref();
        Self {
            name: pod.metadata.name.clone().unwrap_or_default(),
            labels: pod.metadata.labels.clone().unwrap_or_default(),
            phase: status
                .and_then(|s| s.phase.as_deref())
                .map(PodPhase::parse),
            container_ready: status
                .and_then(|s| s.container_statuses.as_ref())
                .map(|statuses| statuses.iter().map(|c| c.ready).collect())
                .unwrap_or_default(),
        }
    }
}

/// Contents of a config map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigMapData {
    pub resource_version: Option<String>,
    pub data: BTreeMap<String, String>,
}

/// App labels of the status-store and archive pods for an install.
pub fn dependency_app_labels(install_name: &str) -> [String; 2] {
    [format!("{install_name}-etcd"), format!("{install_name}-ras")]
}

/// Build an equality label selector from `key=value` pairs.
pub fn label_selector(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Split an equality selector into `(key, value)` pairs. Terms without `=`
/// are ignored.
pub fn parse_selector(selector: &str) -> Vec<(&str, &str)> {
    selector
        .split(',')
        .filter_map(|term| term.trim().split_once('='))
        .map(|(key, value)| (key.trim(), value.trim()))
        .collect()
}

/// Orchestrator operations used by the controller.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// List pods in `namespace` matching an equality label selector.
    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<EnginePod>, ClusterError>;

    /// Create a pod. Fails with [`ClusterError::Conflict`] if the name is taken.
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<EnginePod, ClusterError>;

    /// Delete a pod by name. Fails with [`ClusterError::NotFound`] if absent.
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    /// Read a config map.
    async fn read_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ConfigMapData, ClusterError>;
}
