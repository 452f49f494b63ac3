//! Expired group reconciliation.
//!
//! A pass takes the pass lease, snapshots the expired groups and processes
//! each one independently:
//!
//! 1. Delete every object key of the group. Keys are deleted concurrently and
//!    all deletions are joined before anything else happens.
//! 2. If every key reported `Deleted` or `NotFound`, delete the group's
//!    metadata. The metadata row is the record that the group still needs
//!    work, so it goes last.
//! 3. Otherwise leave the metadata in place, record the failure for the retry
//!    policy and report it. The group is picked up again by a later pass.
//!
//! One group's failure never stops the others, and no per-group failure makes
//! the pass itself fail.

use crate::metrics;
use crate::reporter::{ErrorReporter, LogReporter};
use futures::StreamExt;
use pantry_core::config::ReconcileConfig;
use pantry_core::{Clock, DeleteOutcome, SystemClock};
use pantry_metadata::models::Group;
use pantry_metadata::repos::{PassState, PassStats};
use pantry_metadata::{MetadataError, MetadataStore};
use pantry_storage::{ObjectStore, StorageError};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Pass-level errors. Per-group failures are never returned through this type.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Another process (or task) holds the pass lease.
    #[error("another reconciliation pass is already running")]
    PassInProgress,

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("failed to encode pass statistics: {0}")]
    Stats(#[from] serde_json::Error),

    #[error("reconciliation task panicked: {0}")]
    Panicked(String),
}

/// Why a group was left in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// One or more object deletions failed. Holds `(key, error)` pairs.
    ObjectDelete(Vec<(String, String)>),
    /// Object deletions did not finish within the group timeout.
    Timeout,
    /// Objects are gone but the metadata delete failed.
    Metadata,
    /// The group reached `max_attempts` and is no longer retried.
    AttemptsExhausted,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ObjectDelete(_) => "object_delete",
            Self::Timeout => "timeout",
            Self::Metadata => "metadata",
            Self::AttemptsExhausted => "attempts_exhausted",
        }
    }
}

/// A group that could not be removed in this pass.
#[derive(Debug, Clone)]
pub struct GroupFailure {
    pub pass_id: Uuid,
    pub group_id: Uuid,
    pub kind: FailureKind,
    pub message: String,
    /// Failed attempts including this one.
    pub failed_attempts: u32,
    pub next_attempt_at: Option<OffsetDateTime>,
}

impl GroupFailure {
    /// Keys whose deletion failed, if that is why the group failed.
    pub fn failed_keys(&self) -> Vec<&str> {
        match &self.kind {
            FailureKind::ObjectDelete(keys) => keys.iter().map(|(key, _)| key.as_str()).collect(),
            _ => Vec::new(),
        }
    }
}

/// Why a group was not attempted in this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    /// Retry backoff holds the group until the given time.
    Backoff { until: OffsetDateTime },
    /// The group failed `max_attempts` times and is held.
    AttemptsExhausted,
    /// Shutdown began before the group was started.
    Cancelled,
}

/// What happened to one expired group.
#[derive(Debug, Clone)]
pub enum GroupOutcome {
    /// Objects and metadata are gone.
    Deleted,
    /// Dry run: the group would have been deleted along with these keys.
    WouldDelete { object_keys: Vec<String> },
    /// Not attempted.
    Deferred(DeferReason),
    /// Attempted and left in place.
    Failed(GroupFailure),
}

/// Result of processing one group, with its object counters.
#[derive(Debug, Clone)]
pub struct GroupReport {
    pub group_id: Uuid,
    pub outcome: GroupOutcome,
    pub stats: PassStats,
}

/// Result of a completed pass.
#[derive(Debug, Clone)]
pub struct PassSummary {
    pub pass_id: Uuid,
    /// Snapshot time used to select expired groups.
    pub now: OffsetDateTime,
    pub stats: PassStats,
    pub groups: Vec<GroupReport>,
    pub dry_run: bool,
}

impl PassSummary {
    pub fn failures(&self) -> impl Iterator<Item = &GroupFailure> {
        self.groups.iter().filter_map(|report| match &report.outcome {
            GroupOutcome::Failed(failure) => Some(failure),
            _ => None,
        })
    }

    pub fn outcome_of(&self, group_id: Uuid) -> Option<&GroupOutcome> {
        self.groups
            .iter()
            .find(|report| report.group_id == group_id)
            .map(|report| &report.outcome)
    }
}

/// Counters from the object phase of one group.
#[derive(Debug, Default)]
struct ObjectPhase {
    deleted: u64,
    missing: u64,
    failed: Vec<(String, StorageError)>,
}

/// Runs reconciliation passes against a metadata store and an object store.
pub struct Reconciler {
    metadata: Arc<dyn MetadataStore>,
    storage: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    reporter: Arc<dyn ErrorReporter>,
    config: ReconcileConfig,
}

impl Reconciler {
    /// Create a reconciler using the system clock and the log reporter.
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        storage: Arc<dyn ObjectStore>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            metadata,
            storage,
            clock: Arc::new(SystemClock),
            reporter: Arc::new(LogReporter),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    /// Run one pass under a fresh pass id.
    pub async fn run_pass(&self, cancel: &CancellationToken) -> Result<PassSummary, ReconcileError> {
        self.run_pass_with_id(Uuid::new_v4(), cancel).await
    }

    /// Run one pass recorded under `pass_id`.
    ///
    /// Returns `ReconcileError::PassInProgress` without touching anything if
    /// another pass holds the lease. After `cancel` fires no further group is
    /// started; groups already started run to the end of their object phase
    /// and metadata delete. Every other error is logged and reported here.
    pub async fn run_pass_with_id(
        &self,
        pass_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<PassSummary, ReconcileError> {
        let result = self.execute_pass(pass_id, cancel).await;

        if let Err(err) = &result
            && !matches!(err, ReconcileError::PassInProgress)
        {
            metrics::PASSES_FAILED.inc();
            tracing::error!(pass_id = %pass_id, error = %err, "Reconciliation pass failed");
            self.reporter.report_error("reconcile_pass", err);
        }
        result
    }

    async fn execute_pass(
        &self,
        pass_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<PassSummary, ReconcileError> {
        let now = self.clock.now();
        self.acquire_lease(pass_id, now).await?;

        metrics::PASSES_STARTED.inc();
        metrics::PASS_ACTIVE.inc();
        let started = Instant::now();
        tracing::info!(pass_id = %pass_id, now = %now, dry_run = self.config.dry_run, "Reconciliation pass started");

        let result = self.process_expired(pass_id, now, cancel).await;

        metrics::PASS_ACTIVE.dec();
        metrics::PASS_DURATION.observe(started.elapsed().as_secs_f64());

        let finished_at = self.clock.now();
        let summary = match result {
            Ok(summary) => summary,
            Err(err) => {
                self.release_failed(pass_id, finished_at).await;
                return Err(err);
            }
        };

        // The lease must not outlive the pass, even when the final write fails.
        if let Err(err) = self.record_finished(pass_id, finished_at, &summary).await {
            self.release_failed(pass_id, finished_at).await;
            return Err(err);
        }

        let stats = &summary.stats;
        tracing::info!(
            pass_id = %pass_id,
            groups_expired = stats.groups_expired,
            groups_deleted = stats.groups_deleted,
            groups_failed = stats.groups_failed,
            groups_deferred = stats.groups_deferred,
            objects_deleted = stats.objects_deleted,
            objects_missing = stats.objects_missing,
            objects_failed = stats.objects_failed,
            duration_ms = started.elapsed().as_millis() as u64,
            "Reconciliation pass finished"
        );
        Ok(summary)
    }

    /// Insert the `running` pass record that acts as the pass lease.
    ///
    /// If the lease is taken, records older than the lease TTL are reclaimed
    /// and the insert is tried once more.
    async fn acquire_lease(&self, pass_id: Uuid, now: OffsetDateTime) -> Result<(), ReconcileError> {
        match self.metadata.create_pass(pass_id, now).await {
            Err(MetadataError::Constraint(_)) => {}
            other => return Ok(other?),
        }

        let reclaimed =
            reclaim_stale_passes(self.metadata.as_ref(), now, self.config.pass_lease_ttl()).await?;
        if !reclaimed.is_empty() {
            match self.metadata.create_pass(pass_id, now).await {
                Err(MetadataError::Constraint(_)) => {}
                other => return Ok(other?),
            }
        }

        tracing::info!("Reconciliation pass already running elsewhere, skipping");
        Err(ReconcileError::PassInProgress)
    }

    async fn record_finished(
        &self,
        pass_id: Uuid,
        finished_at: OffsetDateTime,
        summary: &PassSummary,
    ) -> Result<(), ReconcileError> {
        let stats_json = serde_json::to_string(&summary.stats)?;
        self.metadata
            .update_pass_state(pass_id, PassState::Finished, finished_at, Some(&stats_json))
            .await?;
        Ok(())
    }

    /// Best effort: a record left `running` is reclaimed once it outlives the lease TTL.
    async fn release_failed(&self, pass_id: Uuid, finished_at: OffsetDateTime) {
        if let Err(err) = self
            .metadata
            .update_pass_state(pass_id, PassState::Failed, finished_at, None)
            .await
        {
            tracing::error!(
                pass_id = %pass_id,
                error = %err,
                "Failed to mark reconciliation pass as failed"
            );
        }
    }

    async fn process_expired(
        &self,
        pass_id: Uuid,
        now: OffsetDateTime,
        cancel: &CancellationToken,
    ) -> Result<PassSummary, ReconcileError> {
        let expired = self.metadata.list_expired(now).await?;

        let mut stats = PassStats {
            groups_expired: expired.len() as u64,
            ..PassStats::default()
        };

        if !expired.is_empty() {
            tracing::debug!(pass_id = %pass_id, count = expired.len(), "Found expired groups");
        }

        // buffer_unordered polls lazily, so a group whose future has not been
        // polled yet sees the cancellation before doing any work.
        let groups: Vec<GroupReport> = futures::stream::iter(expired)
            .map(|group| self.process_group(pass_id, now, group, cancel))
            .buffer_unordered(self.config.max_concurrent_groups.max(1))
            .collect()
            .await;

        for report in &groups {
            stats.merge(&report.stats);
        }

        Ok(PassSummary {
            pass_id,
            now,
            stats,
            groups,
            dry_run: self.config.dry_run,
        })
    }

    async fn process_group(
        &self,
        pass_id: Uuid,
        now: OffsetDateTime,
        group: Group,
        cancel: &CancellationToken,
    ) -> GroupReport {
        let group_id = group.group_id;

        if cancel.is_cancelled() {
            return deferred(group_id, DeferReason::Cancelled);
        }

        if let Some(max_attempts) = self.config.max_attempts
            && group.failed_attempts >= max_attempts
        {
            let failure = GroupFailure {
                pass_id,
                group_id,
                kind: FailureKind::AttemptsExhausted,
                message: format!(
                    "group failed {} times and is held; remove the blocking objects and reset it",
                    group.failed_attempts
                ),
                failed_attempts: group.failed_attempts,
                next_attempt_at: None,
            };
            self.reporter.report_group_failure(&failure);
            return deferred(group_id, DeferReason::AttemptsExhausted);
        }

        if let Some(until) = group.next_attempt_at.filter(|_| group.is_deferred(now)) {
            tracing::debug!(
                pass_id = %pass_id,
                group_id = %group_id,
                next_attempt_at = %until,
                "Group is in retry backoff, skipping"
            );
            return deferred(group_id, DeferReason::Backoff { until });
        }

        if self.config.dry_run {
            tracing::info!(
                pass_id = %pass_id,
                group_id = %group_id,
                name = %group.name,
                expires_at = %group.expires_at,
                objects = group.object_keys.len(),
                "DRY RUN: would delete expired group and its objects"
            );
            return GroupReport {
                group_id,
                outcome: GroupOutcome::WouldDelete {
                    object_keys: group.object_keys,
                },
                stats: PassStats::default(),
            };
        }

        let mut stats = PassStats::default();

        // Only the object phase is bounded: dropping a metadata future would
        // not cancel its statement, so that step is never raced.
        let phase =
            match tokio::time::timeout(self.config.group_timeout(), self.delete_objects(&group))
                .await
            {
                Ok(phase) => phase,
                Err(_) => {
                    let message = format!(
                        "object deletions did not finish within {}s",
                        self.config.group_timeout_secs
                    );
                    return self
                        .fail_group(pass_id, &group, FailureKind::Timeout, message, stats)
                        .await;
                }
            };

        stats.objects_deleted = phase.deleted;
        stats.objects_missing = phase.missing;
        stats.objects_failed = phase.failed.len() as u64;
        metrics::OBJECTS_DELETED.inc_by(phase.deleted);
        metrics::OBJECT_DELETE_FAILURES.inc_by(phase.failed.len() as u64);

        if !phase.failed.is_empty() {
            let message = phase
                .failed
                .iter()
                .map(|(key, err)| format!("{key}: {err}"))
                .collect::<Vec<_>>()
                .join("; ");
            let keys = phase
                .failed
                .into_iter()
                .map(|(key, err)| (key, err.to_string()))
                .collect();
            return self
                .fail_group(pass_id, &group, FailureKind::ObjectDelete(keys), message, stats)
                .await;
        }

        // Barrier reached: every object of the group is absent.
        match self.metadata.delete_group(group_id).await {
            Ok(outcome) => {
                if outcome == DeleteOutcome::NotFound {
                    tracing::debug!(
                        pass_id = %pass_id,
                        group_id = %group_id,
                        "Group metadata was already gone"
                    );
                }
                stats.groups_deleted = 1;
                metrics::GROUPS_DELETED.inc();
                tracing::info!(
                    pass_id = %pass_id,
                    group_id = %group_id,
                    objects_deleted = stats.objects_deleted,
                    objects_missing = stats.objects_missing,
                    "Expired group removed"
                );
                GroupReport {
                    group_id,
                    outcome: GroupOutcome::Deleted,
                    stats,
                }
            }
            Err(e) => {
                self.fail_group(pass_id, &group, FailureKind::Metadata, e.to_string(), stats)
                    .await
            }
        }
    }

    /// Delete every key of the group and wait for all of them.
    async fn delete_objects(&self, group: &Group) -> ObjectPhase {
        let results: Vec<(String, Result<DeleteOutcome, StorageError>)> =
            futures::stream::iter(group.object_keys.iter().cloned())
                .map(|key| async move {
                    let result = self.storage.delete(&key).await;
                    (key, result)
                })
                .buffer_unordered(self.config.max_concurrent_deletes.max(1))
                .collect()
                .await;

        let mut phase = ObjectPhase::default();
        for (key, result) in results {
            match result {
                Ok(DeleteOutcome::Deleted) => phase.deleted += 1,
                Ok(DeleteOutcome::NotFound) => phase.missing += 1,
                Err(err) if err.is_not_found() => phase.missing += 1,
                Err(err) => {
                    tracing::warn!(
                        group_id = %group.group_id,
                        object_key = %key,
                        error = %err,
                        "Failed to delete object"
                    );
                    phase.failed.push((key, err));
                }
            }
        }
        phase
    }

    /// Record a failed attempt, report it and build the group's report.
    async fn fail_group(
        &self,
        pass_id: Uuid,
        group: &Group,
        kind: FailureKind,
        message: String,
        mut stats: PassStats,
    ) -> GroupReport {
        let failed_attempts = group.failed_attempts.saturating_add(1);
        let failed_at = self.clock.now();
        let delay = self.config.retry_delay(failed_attempts);
        let next_attempt_at = (!delay.is_zero()).then(|| failed_at + delay);

        if let Err(e) = self
            .metadata
            .record_group_failure(group.group_id, failed_at, next_attempt_at)
            .await
        {
            tracing::warn!(
                pass_id = %pass_id,
                group_id = %group.group_id,
                error = %e,
                "Failed to record group failure"
            );
        }

        let failure = GroupFailure {
            pass_id,
            group_id: group.group_id,
            kind,
            message,
            failed_attempts,
            next_attempt_at,
        };
        self.reporter.report_group_failure(&failure);
        metrics::GROUPS_FAILED.inc();

        stats.groups_failed = 1;
        GroupReport {
            group_id: group.group_id,
            outcome: GroupOutcome::Failed(failure),
            stats,
        }
    }
}

/// Mark `running` pass records that started at least `ttl` before `now` as
/// failed, releasing the lease a dead process left behind.
///
/// Younger records belong to a pass that may still be alive and are left
/// alone. Returns the ids of the reclaimed passes.
pub async fn reclaim_stale_passes(
    metadata: &dyn MetadataStore,
    now: OffsetDateTime,
    ttl: time::Duration,
) -> Result<Vec<Uuid>, MetadataError> {
    let running = metadata.get_orphaned_passes().await?;

    // A TTL reaching past the representable range protects everything.
    let Some(cutoff) = now.checked_sub(ttl) else {
        return Ok(Vec::new());
    };

    let mut reclaimed = Vec::new();
    for pass in running {
        if pass.started_at > cutoff {
            tracing::debug!(
                pass_id = %pass.pass_id,
                started_at = %pass.started_at,
                "Running pass is younger than the lease TTL, leaving it alone"
            );
            continue;
        }

        metadata
            .update_pass_state(pass.pass_id, PassState::Failed, now, None)
            .await?;
        metrics::PASSES_RECLAIMED.inc();
        tracing::warn!(
            pass_id = %pass.pass_id,
            started_at = %pass.started_at,
            "Reclaimed stale reconciliation pass lease"
        );
        reclaimed.push(pass.pass_id);
    }

    Ok(reclaimed)
}

fn deferred(group_id: Uuid, reason: DeferReason) -> GroupReport {
    metrics::GROUPS_DEFERRED.inc();
    GroupReport {
        group_id,
        outcome: GroupOutcome::Deferred(reason),
        stats: PassStats {
            groups_deferred: 1,
            ..PassStats::default()
        },
    }
}
