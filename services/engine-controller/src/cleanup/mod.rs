//! Cleanup of engine pods left behind by finished runs.

mod pods;
mod worker;

pub use pods::{CleanupStats, RunPodCleanup};
pub use worker::CleanupWorker;
