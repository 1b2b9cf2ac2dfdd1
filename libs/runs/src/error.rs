//! Error types for run records and their stores.

use std::time::Duration;

use thiserror::Error;

use crate::types::RunStatus;

/// Errors that can occur when parsing run fields.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RunError {
    /// The lifecycle status is not part of the vocabulary.
    #[error("unknown run status: {0}")]
    UnknownStatus(String),

    /// The status-store key suffix is not part of the vocabulary.
    #[error("unknown run key suffix: {0}")]
    UnknownSuffix(String),

    /// A `rasActions` value that is not base64-encoded JSON.
    #[error("malformed archive actions: {0}")]
    MalformedArchiveActions(String),
}

/// Errors returned by a [`crate::RunRegistry`].
#[derive(Debug, Error, Clone)]
pub enum RegistryError {
    /// The run does not exist.
    #[error("run not found: {0}")]
    NotFound(String),

    /// The requested status change is not allowed from the current status.
    #[error("run {run} cannot move from {from} to {to}")]
    InvalidTransition {
        run: String,
        from: RunStatus,
        to: RunStatus,
    },

    /// The status store rejected or failed the request.
    #[error("status store error: {0}")]
    Backend(String),

    /// The call did not complete in time.
    #[error("status store call timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors returned by an [`crate::ArchiveStore`].
#[derive(Debug, Error, Clone)]
pub enum ArchiveError {
    /// The archive record does not exist.
    #[error("archive record not found: {0}")]
    NotFound(String),

    /// The archive rejected or failed the request.
    #[error("archive error: {0}")]
    Backend(String),

    /// The call did not complete in time.
    #[error("archive call timed out after {0:?}")]
    Timeout(Duration),
}
