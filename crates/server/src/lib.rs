//! Pantry backend daemon.
//!
//! This crate wires the stores together and runs the content lifecycle:
//! - Startup migration gate and orphaned pass recovery
//! - Expired group reconciliation across the metadata and object stores
//! - Single-flight scheduler that triggers passes on an interval
//! - Health, pass history and Prometheus endpoints

pub mod bootstrap;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod reconcile;
pub mod reporter;
pub mod routes;
pub mod scheduler;
pub mod state;

pub use error::ApiError;
pub use reconcile::{GroupOutcome, PassSummary, ReconcileError, Reconciler};
pub use reporter::{ErrorReporter, LogReporter, NoopReporter, SentryReporter};
pub use routes::create_router;
pub use scheduler::{Scheduler, SkipReason, TriggerOutcome};
pub use state::AppState;
