//! Engine controller library.
//!
//! The controller keeps test engine pods in step with the run registry:
//! - [`scheduler`] launches pods for queued runs, up to `max_engines`
//! - [`interrupts`] tears down runs that were cancelled, reset or hung
//! - [`cleanup`] removes terminated pods of finished runs
//! - [`watcher`] turns status-store notifications into prompt inspections
//!
//! Every pass is gated on the status store and result archive being ready.
//! The binary wires these workers together; the library surface exists so
//! integration tests can drive them directly.

pub mod cleanup;
pub mod cluster;
pub mod config;
pub mod facade;
pub mod interrupts;
pub mod pod_template;
pub mod scheduler;
pub mod settings;
pub mod watcher;

mod calls;
