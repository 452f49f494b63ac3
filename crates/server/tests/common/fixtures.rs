//! Test fixtures for groups, clocks and reporters.

use pantry_core::FixedClock;
use pantry_core::config::ReconcileConfig;
use pantry_metadata::MetadataStore;
use pantry_metadata::models::NewGroup;
use pantry_server::reconcile::GroupFailure;
use pantry_server::reporter::ErrorReporter;
use std::sync::{Arc, Mutex};
use time::macros::datetime;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

/// The instant every reconciliation test treats as "now".
#[allow(dead_code)]
pub const TEST_NOW: OffsetDateTime = datetime!(2024-06-01 12:00 UTC);

#[allow(dead_code)]
pub fn test_clock() -> Arc<FixedClock> {
    Arc::new(FixedClock::new(TEST_NOW))
}

/// A group expiring `offset` away from [`TEST_NOW`] (negative = already expired).
#[allow(dead_code)]
pub fn group(name: &str, offset: Duration, keys: &[&str]) -> NewGroup {
    NewGroup {
        group_id: Uuid::new_v4(),
        name: name.to_string(),
        expires_at: TEST_NOW + offset,
        object_keys: keys.iter().map(|k| k.to_string()).collect(),
    }
}

/// Insert groups and return their ids in the same order.
#[allow(dead_code)]
pub async fn insert_groups(metadata: &dyn MetadataStore, groups: &[NewGroup]) -> Vec<Uuid> {
    for g in groups {
        metadata
            .create_group(g)
            .await
            .expect("Failed to create group");
    }
    groups.iter().map(|g| g.group_id).collect()
}

/// Reconcile settings for tests: retry every pass, short timeout.
#[allow(dead_code)]
pub fn test_reconcile_config() -> ReconcileConfig {
    ReconcileConfig {
        group_timeout_secs: 5,
        ..ReconcileConfig::default()
    }
}

/// Error reporter that keeps everything it receives.
#[allow(dead_code)]
#[derive(Default)]
pub struct RecordingReporter {
    failures: Mutex<Vec<GroupFailure>>,
    errors: Mutex<Vec<(&'static str, String)>>,
}

#[allow(dead_code)]
impl RecordingReporter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failures(&self) -> Vec<GroupFailure> {
        self.failures.lock().unwrap().clone()
    }

    pub fn failures_for(&self, group_id: Uuid) -> Vec<GroupFailure> {
        self.failures()
            .into_iter()
            .filter(|f| f.group_id == group_id)
            .collect()
    }

    pub fn errors(&self) -> Vec<(&'static str, String)> {
        self.errors.lock().unwrap().clone()
    }
}

impl ErrorReporter for RecordingReporter {
    fn report_group_failure(&self, failure: &GroupFailure) {
        self.failures.lock().unwrap().push(failure.clone());
    }

    fn report_error(&self, context: &'static str, error: &(dyn std::error::Error + 'static)) {
        self.errors
            .lock()
            .unwrap()
            .push((context, error.to_string()));
    }
}
