//! Group repository.

use crate::error::MetadataResult;
use crate::models::{Group, NewGroup};
use async_trait::async_trait;
use pantry_core::DeleteOutcome;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for expiring content groups and their object associations.
#[async_trait]
pub trait GroupRepo: Send + Sync {
    /// Insert a group and its ordered object keys in one transaction.
    ///
    /// Fails with `MetadataError::Constraint` if the id exists or any key is
    /// already attached to another group.
    async fn create_group(&self, group: &NewGroup) -> MetadataResult<()>;

    /// Get a group with its object keys.
    async fn get_group(&self, group_id: Uuid) -> MetadataResult<Option<Group>>;

    /// All groups with `expires_at <= now`, each with its ordered object keys.
    ///
    /// Executed as a single statement so groups and keys come from one snapshot.
    async fn list_expired(&self, now: OffsetDateTime) -> MetadataResult<Vec<Group>>;

    /// Delete a group and its object associations in one transaction.
    /// A missing group yields `DeleteOutcome::NotFound`.
    async fn delete_group(&self, group_id: Uuid) -> MetadataResult<DeleteOutcome>;

    /// Record a failed removal attempt and when the next one may run.
    /// A missing group is ignored.
    async fn record_group_failure(
        &self,
        group_id: Uuid,
        failed_at: OffsetDateTime,
        next_attempt_at: Option<OffsetDateTime>,
    ) -> MetadataResult<()>;
}
