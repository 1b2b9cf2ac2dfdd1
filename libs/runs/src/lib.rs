//! # enginectl-runs
//!
//! Run records and the collaborator interfaces the engine controller talks to.
//!
//! ## Design Principles
//!
//! - A run is identified by its short name (for example `U1234`)
//! - The status store is the source of truth for run lifecycle and interrupts
//! - The result archive holds the final outcome of every attempt
//! - The controller only ever writes `queued`, `allocated`, `cancelling` and
//!   `finished`; every other status is written by the engine inside the pod
//!
//! ## Status Store Keys
//!
//! Run fields live under `run.<name>.<suffix>`, for example
//! `run.U1234.status` or `run.U1234.interruptReason`. Change notifications
//! for those keys are delivered as [`StatusChange`] values.
//!
//! ## Collaborators
//!
//! - [`RunRegistry`]: query and mutate run records
//! - [`ArchiveStore`]: update result-archive records
//! - [`StatusFeed`]: subscribe to status-store change notifications
//!
//! In-memory implementations live in [`memory`] and back both the tests and
//! the controller binary until a persistent backend is wired in.

mod encoding;
mod error;
mod keys;
pub mod memory;
mod registry;
mod types;

pub use encoding::{decode_archive_actions, encode_archive_actions};
pub use error::{ArchiveError, RegistryError, RunError};
pub use keys::*;
pub use registry::{ArchiveStore, RunRegistry, StatusFeed};
pub use types::*;
