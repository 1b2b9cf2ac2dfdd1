//! Per-call timeouts for status-store and archive calls.

use std::future::Future;
use std::time::Duration;

use enginectl_runs::{ArchiveError, RegistryError};

/// Bound a registry call by `timeout`.
pub(crate) async fn registry_call<T>(
    timeout: Duration,
    fut: impl Future<Output = Result<T, RegistryError>>,
) -> Result<T, RegistryError> {
    tokio::time::timeout(timeout, fut)
        .await
        .unwrap_or(Err(RegistryError::Timeout(timeout)))
}

/// Bound an archive call by `timeout`.
pub(crate) async fn archive_call<T>(
    timeout: Duration,
    fut: impl Future<Output = Result<T, ArchiveError>>,
) -> Result<T, ArchiveError> {
    tokio::time::timeout(timeout, fut)
        .await
        .unwrap_or(Err(ArchiveError::Timeout(timeout)))
}
