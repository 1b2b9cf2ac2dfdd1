//! Process configuration for the engine controller.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use enginectl_reconcile::{DEFAULT_CALL_TIMEOUT, DEFAULT_INTERRUPT_POLL};

/// Environment variables copied into every engine pod when set.
pub const FORWARDED_ENV_VARS: &[&str] = &[
    "ENGINE_CONFIG_STORE",
    "ENGINE_STATUS_STORE",
    "ENGINE_CREDENTIALS_STORE",
    "ENGINE_EXTRA_BUNDLES",
    "ENGINE_ARCHIVE_TOKEN",
    "ENGINE_EVENT_STREAMS_TOKEN",
];

/// Path of the encryption keys file inside engine pods.
pub const ENCRYPTION_KEYS_PATH_ENV: &str = "ENGINE_ENCRYPTION_KEYS_PATH";

/// Engine controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Namespace the controller and its engine pods live in.
    pub namespace: String,

    /// Name of this controller's own pod, recorded on allocated runs.
    pub pod_name: String,

    /// Name of the config map holding engine settings.
    pub config_map_name: String,

    /// Prefix of the status-store and archive app labels.
    pub install_name: String,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Timeout applied to each orchestrator, status-store and archive call.
    pub call_timeout: Duration,

    /// Interval between full interrupt sweeps.
    pub interrupt_poll: Duration,

    /// Capacity of the watch-driven inspection queue.
    pub watch_queue_capacity: usize,

    /// Environment forwarded into engine pods.
    pub engine_env: BTreeMap<String, String>,

    pub encryption_keys_path: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let call_timeout_secs = parse_var(&lookup, "ENGINE_CALL_TIMEOUT_SECS")?
            .unwrap_or(DEFAULT_CALL_TIMEOUT.as_secs());
        let interrupt_poll_secs = parse_var(&lookup, "ENGINE_INTERRUPT_POLL_SECS")?
            .unwrap_or(DEFAULT_INTERRUPT_POLL.as_secs());
        let watch_queue_capacity: usize =
            parse_var(&lookup, "ENGINE_WATCH_QUEUE_CAPACITY")?.unwrap_or(1024);
        if watch_queue_capacity == 0 {
            anyhow::bail!("ENGINE_WATCH_QUEUE_CAPACITY must be greater than zero");
        }

        let engine_env = FORWARDED_ENV_VARS
            .iter()
            .filter_map(|key| {
                lookup(key)
                    .filter(|v| !v.trim().is_empty())
                    .map(|v| (key.to_string(), v))
            })
            .collect();

        Ok(Self {
            namespace: var("NAMESPACE", "default"),
            pod_name: var("PODNAME", "engine-controller"),
            config_map_name: var("CONFIG", "config"),
            install_name: var("ENGINE_INSTALL_NAME", ""),
            log_level: var("ENGINE_LOG_LEVEL", "info"),
            call_timeout: Duration::from_secs(call_timeout_secs),
            interrupt_poll: Duration::from_secs(interrupt_poll_secs),
            watch_queue_capacity,
            engine_env,
            encryption_keys_path: lookup(ENCRYPTION_KEYS_PATH_ENV).filter(|v| !v.trim().is_empty()),
        })
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key).filter(|v| !v.trim().is_empty()) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
    }
}
