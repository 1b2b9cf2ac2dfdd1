//! Interrupted-run teardown.
//!
//! A run is interrupted when something sets its `interruptReason`, either
//! a user cancel (`cancelled`), a reset (`requeued`) or a hang detector
//! (`hung`). Teardown is split into:
//! - [`InterruptCollector`]: decides which interrupted runs are due
//! - [`InterruptProcessor`]: writes the outcome and removes the pod
//! - [`PodDeleter`]: idempotent pod removal
//! - [`InterruptWorker`]: drives the above from a sweep and the watch queue

mod collector;
mod deleter;
mod event;
mod processor;
mod worker;

pub use collector::InterruptCollector;
pub use deleter::PodDeleter;
pub use event::InterruptEvent;
pub use processor::{InterruptProcessor, ProcessError, ProcessStats};
pub use worker::InterruptWorker;
