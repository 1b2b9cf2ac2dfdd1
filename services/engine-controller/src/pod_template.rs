//! Engine pod definitions.
//!
//! A pod definition is a pure function of the settings snapshot, the run and
//! the environment forwarded from the controller's own process.

use std::collections::BTreeMap;
use std::path::Path;

use k8s_openapi::api::core::v1::{
    Affinity, Container, EnvVar, NodeAffinity, NodeSelectorRequirement, NodeSelectorTerm, Pod,
    PodSpec, PreferredSchedulingTerm, ResourceRequirements, SecretVolumeSource, Toleration,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::warn;

use crate::cluster::{ENGINE_LABEL_KEY, RUN_LABEL_KEY};
use crate::config::{Config, ENCRYPTION_KEYS_PATH_ENV};
use crate::settings::Settings;

const CONTAINER_NAME: &str = "engine";
const ENCRYPTION_KEYS_VOLUME: &str = "encryption-keys";
const ARCH_NODE_LABEL: &str = "kubernetes.io/arch";

/// Name of the pod that executes `run_name`.
pub fn engine_pod_name(engine_label: &str, run_name: &str) -> String {
    format!("{engine_label}-{}", run_name.to_lowercase())
}

/// Builds engine pod definitions.
#[derive(Debug, Clone, Default)]
pub struct PodTemplate {
    forwarded_env: BTreeMap<String, String>,
    encryption_keys_path: Option<String>,
}

impl PodTemplate {
    pub fn new(
        forwarded_env: BTreeMap<String, String>,
        encryption_keys_path: Option<String>,
    ) -> Self {
        Self {
            forwarded_env,
            encryption_keys_path,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.engine_env.clone(), config.encryption_keys_path.clone())
    }

    /// The pod definition for one run.
    pub fn build(&self, settings: &Settings, run_name: &str, trace: bool) -> Pod {
        let name = engine_pod_name(&settings.engine_label, run_name);
        let labels = BTreeMap::from([
            (ENGINE_LABEL_KEY.to_string(), settings.engine_label.clone()),
            (RUN_LABEL_KEY.to_string(), run_name.to_string()),
        ]);

        let node_selector = (!settings.node_arch.is_empty()).then(|| {
            BTreeMap::from([(ARCH_NODE_LABEL.to_string(), settings.node_arch.clone())])
        });

        let tolerations = parse_tolerations(&settings.node_tolerations);

        Pod {
            metadata: ObjectMeta {
                name: Some(name),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(PodSpec {
                restart_policy: Some("Never".to_string()),
                node_selector,
                affinity: preferred_affinity(&settings.node_preferred_affinity),
                tolerations: (!tolerations.is_empty()).then_some(tolerations),
                volumes: self.volumes(settings),
                containers: vec![self.container(settings, run_name, trace)],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn container(&self, settings: &Settings, run_name: &str, trace: bool) -> Container {
        Container {
            name: CONTAINER_NAME.to_string(),
            image: Some(settings.engine_image.clone()),
            image_pull_policy: Some("Always".to_string()),
            command: Some(vec!["java".to_string()]),
            args: Some(engine_args(settings, run_name, trace)),
            resources: Some(resources(settings)),
            env: Some(self.env(settings)),
            volume_mounts: self.volume_mounts(settings),
            ..Default::default()
        }
    }

    fn env(&self, settings: &Settings) -> Vec<EnvVar> {
        let mut env = vec![env_var("MAX_HEAP", &format!("{}m", settings.memory_heap_mi))];
        if let Some(path) = &self.encryption_keys_path {
            env.push(env_var(ENCRYPTION_KEYS_PATH_ENV, path));
        }
        env.extend(
            self.forwarded_env
                .iter()
                .map(|(name, value)| env_var(name, value)),
        );
        env
    }

    fn volumes(&self, settings: &Settings) -> Option<Vec<Volume>> {
        if settings.encryption_keys_secret_name.is_empty() {
            return None;
        }
        Some(vec![Volume {
            name: ENCRYPTION_KEYS_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(settings.encryption_keys_secret_name.clone()),
                ..Default::default()
            }),
            ..Default::default()
        }])
    }

    /// The keys directory is mounted at the parent of the keys file path.
    fn volume_mounts(&self, settings: &Settings) -> Option<Vec<VolumeMount>> {
        if settings.encryption_keys_secret_name.is_empty() {
            return None;
        }
        let path = self.encryption_keys_path.as_deref()?;
        let mount_path = Path::new(path).parent()?.to_str()?.to_string();
        if mount_path.is_empty() {
            return None;
        }
        Some(vec![VolumeMount {
            name: ENCRYPTION_KEYS_VOLUME.to_string(),
            mount_path,
            read_only: Some(true),
            ..Default::default()
        }])
    }
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn engine_args(settings: &Settings, run_name: &str, trace: bool) -> Vec<String> {
    let mut args = Vec::new();
    if settings.memory_heap_mi > 0 {
        args.push(format!("-Xmx{}m", settings.memory_heap_mi));
    }
    args.extend(
        ["-jar", "boot.jar", "--obr", "file:engine.obr", "--run", run_name]
            .iter()
            .map(|s| s.to_string()),
    );
    if trace {
        args.push("--trace".to_string());
    }
    args
}

fn resources(settings: &Settings) -> ResourceRequirements {
    let mut requests = BTreeMap::from([(
        "memory".to_string(),
        Quantity(format!("{}Mi", settings.memory_request_mi)),
    )]);
    let mut limits = BTreeMap::from([(
        "memory".to_string(),
        Quantity(format!("{}Mi", settings.memory_limit_mi)),
    )]);

    if settings.cpu_request_m > 0 {
        requests.insert(
            "cpu".to_string(),
            Quantity(format!("{}m", settings.cpu_request_m)),
        );
    }
    if settings.cpu_limit_m > 0 {
        limits.insert(
            "cpu".to_string(),
            Quantity(format!("{}m", settings.cpu_limit_m)),
        );
    }

    ResourceRequirements {
        requests: Some(requests),
        limits: Some(limits),
        ..Default::default()
    }
}

fn preferred_affinity(raw: &str) -> Option<Affinity> {
    let (key, value) = raw.split_once('=')?;
    if key.is_empty() || value.is_empty() || value.contains('=') {
        warn!(value = %raw, "Badly formatted node affinity, ignoring");
        return None;
    }

    Some(Affinity {
        node_affinity: Some(NodeAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                PreferredSchedulingTerm {
                    weight: 1,
                    preference: NodeSelectorTerm {
                        match_expressions: Some(vec![NodeSelectorRequirement {
                            key: key.to_string(),
                            operator: "In".to_string(),
                            values: Some(vec![value.to_string()]),
                        }]),
                        ..Default::default()
                    },
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Parse `key=Operator:Effect,...`. Malformed entries are logged and skipped.
pub fn parse_tolerations(raw: &str) -> Vec<Toleration> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let parsed = entry.split_once('=').and_then(|(key, rest)| {
                let (operator, effect) = rest.split_once(':')?;
                (!key.is_empty() && !operator.is_empty() && !effect.is_empty())
                    .then_some((key, operator, effect))
            });
            match parsed {
                Some((key, operator, effect)) => Some(Toleration {
                    key: Some(key.to_string()),
                    operator: Some(operator.to_string()),
                    effect: Some(effect.to_string()),
                    ..Default::default()
                }),
                None => {
                    warn!(toleration = %entry, "Badly formatted toleration, ignoring");
                    None
                }
            }
        })
        .collect()
}
