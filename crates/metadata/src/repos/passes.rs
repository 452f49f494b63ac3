//! Reconciliation pass repository.

use crate::error::MetadataResult;
use crate::models::PassRow;
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for reconciliation pass records.
///
/// At most one pass may be `running` at a time across every process sharing
/// the database; the schema enforces it with a partial unique index.
#[async_trait]
pub trait PassRepo: Send + Sync {
    /// Create a pass record in `running` state.
    /// Fails with `MetadataError::Constraint` if another pass is running.
    async fn create_pass(&self, pass_id: Uuid, started_at: OffsetDateTime) -> MetadataResult<()>;

    /// Get a pass by ID.
    async fn get_pass(&self, pass_id: Uuid) -> MetadataResult<Option<PassRow>>;

    /// Move a pass to a terminal state.
    async fn update_pass_state(
        &self,
        pass_id: Uuid,
        state: PassState,
        finished_at: OffsetDateTime,
        stats_json: Option<&str>,
    ) -> MetadataResult<()>;

    /// Most recent passes, newest first.
    async fn get_recent_passes(&self, limit: u32) -> MetadataResult<Vec<PassRow>>;

    /// Passes still marked `running`. On startup these belong to a process
    /// that died mid-pass.
    async fn get_orphaned_passes(&self) -> MetadataResult<Vec<PassRow>>;
}

/// Pass state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassState {
    Running,
    Finished,
    Failed,
}

impl PassState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }
}

/// Pass statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PassStats {
    /// Expired groups returned by the snapshot.
    pub groups_expired: u64,
    /// Groups whose metadata was removed.
    pub groups_deleted: u64,
    /// Groups left in place because an object deletion failed or timed out.
    pub groups_failed: u64,
    /// Groups skipped because of retry backoff, the attempt limit or shutdown.
    pub groups_deferred: u64,
    /// Objects removed from the object store.
    pub objects_deleted: u64,
    /// Objects that were already absent.
    pub objects_missing: u64,
    /// Object deletions that failed.
    pub objects_failed: u64,
}

impl PassStats {
    /// Fold another set of counters into this one.
    pub fn merge(&mut self, other: &PassStats) {
        self.groups_expired += other.groups_expired;
        self.groups_deleted += other.groups_deleted;
        self.groups_failed += other.groups_failed;
        self.groups_deferred += other.groups_deferred;
        self.objects_deleted += other.objects_deleted;
        self.objects_missing += other.objects_missing;
        self.objects_failed += other.objects_failed;
    }
}
