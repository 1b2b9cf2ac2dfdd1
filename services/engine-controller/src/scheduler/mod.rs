//! Engine scheduler.
//!
//! The scheduler is responsible for:
//! - Keeping this controller's engine pods supplied with queued runs
//! - Never running more than `max_engines` active pods
//! - Spacing pod launches by the configured launch interval
//! - Retrying conflicting pod creations up to the configured ceiling

mod reconciler;
pub(crate) mod worker;

pub use reconciler::{EngineScheduler, SchedulerStats};
pub use worker::SchedulerWorker;
