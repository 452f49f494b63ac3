//! Core shared types for the Pantry backend.
//!
//! This crate defines what every other crate agrees on:
//! - Application configuration (server, storage, metadata, reconciliation, telemetry)
//! - The clock abstraction used to decide group expiry
//! - The delete outcome shared by the metadata and object stores

pub mod clock;
pub mod config;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::AppConfig;

/// Result of an idempotent delete against either store.
///
/// Both variants mean the target is now absent; `NotFound` only records that
/// somebody else got there first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

impl DeleteOutcome {
    pub fn was_deleted(self) -> bool {
        matches!(self, Self::Deleted)
    }
}

/// Default interval between reconciliation passes: 1 hour.
pub const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 3600;
