//! Engine settings read from a config map, with live reload.
//!
//! Settings are parsed once at startup and then re-read on a fixed cadence.
//! A new snapshot is swapped in only when the config map's resource version
//! changes. Readers always see a complete, consistent snapshot.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use enginectl_reconcile::{
    DEFAULT_INTERRUPT_GRACE_PERIOD, DEFAULT_LAUNCH_INTERVAL, DEFAULT_MAX_POD_RETRIES,
    DEFAULT_RUN_POLL, DEFAULT_SETTINGS_REFRESH,
};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, instrument};

use crate::cluster::ClusterError;
use crate::facade::EngineFacade;

/// Errors that can occur when loading settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// A numeric setting holds something that is not a valid number.
    #[error("invalid value {value:?} for setting {key}")]
    InvalidNumber { key: &'static str, value: String },

    /// The config map could not be read.
    #[error("failed to read config map {name}: {source}")]
    ConfigMap {
        name: String,
        #[source]
        source: ClusterError,
    },
}

/// Engine settings snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub max_engines: u32,
    pub engine_label: String,
    pub engine_image: String,
    pub memory_request_mi: u32,
    pub memory_limit_mi: u32,
    pub memory_heap_mi: u32,
    /// Millicores. Zero or less leaves the request unset.
    pub cpu_request_m: i64,
    /// Millicores. Zero or less leaves the limit unset.
    pub cpu_limit_m: i64,
    pub node_arch: String,
    /// `key=value`, applied as a weight-1 preferred node affinity.
    pub node_preferred_affinity: String,
    /// `key=Operator:Effect,...`
    pub node_tolerations: String,
    pub run_poll: Duration,
    pub launch_interval: Duration,
    pub max_pod_retries: u32,
    pub interrupt_grace_period: Duration,
    pub encryption_keys_secret_name: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_engines: 1,
            engine_label: "k8s-standard-engine".to_string(),
            engine_image: "ghcr.io/enginectl/engine-boot-embedded-amd64".to_string(),
            memory_request_mi: 150,
            memory_limit_mi: 200,
            memory_heap_mi: 150,
            cpu_request_m: 400,
            cpu_limit_m: 1000,
            node_arch: String::new(),
            node_preferred_affinity: String::new(),
            node_tolerations: String::new(),
            run_poll: DEFAULT_RUN_POLL,
            launch_interval: DEFAULT_LAUNCH_INTERVAL,
            max_pod_retries: DEFAULT_MAX_POD_RETRIES,
            interrupt_grace_period: DEFAULT_INTERRUPT_GRACE_PERIOD,
            encryption_keys_secret_name: String::new(),
        }
    }
}

impl Settings {
    /// Parse settings from config map data. Missing or blank keys take their
    /// defaults.
    pub fn from_config_map(data: &BTreeMap<String, String>) -> Result<Self, SettingsError> {
        let defaults = Settings::default();
        let reader = Reader { data };

        let launch_interval = match reader.number::<u64>("kube_launch_interval_milliseconds") {
            Ok(Some(ms)) => Duration::from_millis(ms),
            Ok(None) => defaults.launch_interval,
            Err(_) => {
                info!(
                    key = "kube_launch_interval_milliseconds",
                    default_ms = defaults.launch_interval.as_millis() as u64,
                    "Launch interval is not a number, using default"
                );
                defaults.launch_interval
            }
        };

        Ok(Self {
            max_engines: reader.number("max_engines")?.unwrap_or(defaults.max_engines),
            engine_label: reader.string("engine_label", &defaults.engine_label),
            engine_image: reader.string("engine_image", &defaults.engine_image),
            memory_request_mi: reader
                .number("engine_memory_request")?
                .unwrap_or(defaults.memory_request_mi),
            memory_limit_mi: reader
                .number("engine_memory_limit")?
                .unwrap_or(defaults.memory_limit_mi),
            memory_heap_mi: reader
                .number("engine_memory_heap")?
                .unwrap_or(defaults.memory_heap_mi),
            cpu_request_m: reader
                .number("engine_cpu_request")?
                .unwrap_or(defaults.cpu_request_m),
            cpu_limit_m: reader
                .number("engine_cpu_limit")?
                .unwrap_or(defaults.cpu_limit_m),
            node_arch: reader.string("node_arch", ""),
            node_preferred_affinity: reader.string("node_preferred_affinity", ""),
            node_tolerations: reader.string("node_tolerations", ""),
            run_poll: reader
                .number("run_poll")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.run_poll),
            launch_interval,
            max_pod_retries: reader
                .number("max_test_pod_retry_limit")?
                .unwrap_or(defaults.max_pod_retries),
            interrupt_grace_period: reader
                .number("interrupted_test_run_cleanup_grace_period_seconds")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.interrupt_grace_period),
            encryption_keys_secret_name: reader.string("encryption_keys_secret_name", ""),
        })
    }

    /// Setting values by config map key, for change logging.
    fn describe(&self) -> Vec<(&'static str, String)> {
        vec![
            ("max_engines", self.max_engines.to_string()),
            ("engine_label", self.engine_label.clone()),
            ("engine_image", self.engine_image.clone()),
            ("engine_memory_request", self.memory_request_mi.to_string()),
            ("engine_memory_limit", self.memory_limit_mi.to_string()),
            ("engine_memory_heap", self.memory_heap_mi.to_string()),
            ("engine_cpu_request", self.cpu_request_m.to_string()),
            ("engine_cpu_limit", self.cpu_limit_m.to_string()),
            ("node_arch", self.node_arch.clone()),
            ("node_preferred_affinity", self.node_preferred_affinity.clone()),
            ("node_tolerations", self.node_tolerations.clone()),
            ("run_poll", self.run_poll.as_secs().to_string()),
            (
                "kube_launch_interval_milliseconds",
                self.launch_interval.as_millis().to_string(),
            ),
            ("max_test_pod_retry_limit", self.max_pod_retries.to_string()),
            (
                "interrupted_test_run_cleanup_grace_period_seconds",
                self.interrupt_grace_period.as_secs().to_string(),
            ),
            (
                "encryption_keys_secret_name",
                self.encryption_keys_secret_name.clone(),
            ),
        ]
    }
}

struct Reader<'a> {
    data: &'a BTreeMap<String, String>,
}

impl Reader<'_> {
    fn raw(&self, key: &str) -> Option<&str> {
        self.data
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.raw(key).unwrap_or(default).to_string()
    }

    fn number<T: std::str::FromStr>(&self, key: &'static str) -> Result<Option<T>, SettingsError> {
        match self.raw(key) {
            None => Ok(None),
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| SettingsError::InvalidNumber {
                    key,
                    value: raw.to_string(),
                }),
        }
    }
}

/// Shared handle to the current settings snapshot.
#[derive(Clone)]
pub struct SharedSettings {
    inner: Arc<ArcSwap<Settings>>,
}

impl SharedSettings {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(settings)),
        }
    }

    /// The current snapshot. Later reloads do not affect it.
    pub fn current(&self) -> Arc<Settings> {
        self.inner.load_full()
    }

    /// Swap in a new snapshot, logging every changed value.
    pub fn replace(&self, settings: Settings) {
        let old = self.inner.load();
        for ((key, before), (_, after)) in old.describe().into_iter().zip(settings.describe()) {
            if before != after {
                info!(key = key, from = %before, to = %after, "Setting changed");
            }
        }
        self.inner.store(Arc::new(settings));
    }
}

/// Re-reads the settings config map and swaps in changed snapshots.
pub struct SettingsRefresher {
    facade: EngineFacade,
    config_map_name: String,
    shared: SharedSettings,
    resource_version: Option<String>,
    interval: Duration,
}

impl SettingsRefresher {
    /// Load the initial snapshot. Any error here is fatal to startup.
    pub async fn load(
        facade: EngineFacade,
        config_map_name: impl Into<String>,
    ) -> Result<(Self, SharedSettings), SettingsError> {
        let config_map_name = config_map_name.into();
        let config_map = facade
            .read_config_map(&config_map_name)
            .await
            .map_err(|source| SettingsError::ConfigMap {
                name: config_map_name.clone(),
                source,
            })?;
        let settings = Settings::from_config_map(&config_map.data)?;
        info!(
            config_map = %config_map_name,
            engine_label = %settings.engine_label,
            max_engines = settings.max_engines,
            "Settings loaded"
        );

        let shared = SharedSettings::new(settings);
        let refresher = Self {
            facade,
            config_map_name,
            shared: shared.clone(),
            resource_version: config_map.resource_version,
            interval: DEFAULT_SETTINGS_REFRESH,
        };
        Ok((refresher, shared))
    }

    /// Re-read the config map. Returns true if a new snapshot was swapped in.
    #[instrument(skip(self), fields(config_map = %self.config_map_name))]
    pub async fn refresh(&mut self) -> Result<bool, SettingsError> {
        let config_map = self
            .facade
            .read_config_map(&self.config_map_name)
            .await
            .map_err(|source| SettingsError::ConfigMap {
                name: self.config_map_name.clone(),
                source,
            })?;

        if config_map.resource_version.is_some() && config_map.resource_version == self.resource_version
        {
            return Ok(false);
        }

        let settings = Settings::from_config_map(&config_map.data)?;
        info!("Settings config map changed, reloading");
        self.shared.replace(settings);
        self.resource_version = config_map.resource_version;
        Ok(true)
    }

    /// Refresh on a fixed cadence until shutdown. Failed refreshes keep the
    /// previous snapshot.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting settings refresher"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.refresh().await {
                        error!(error = %e, "Settings refresh failed, keeping previous values");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Settings refresher shutting down");
                        break;
                    }
                }
            }
        }
    }
}
