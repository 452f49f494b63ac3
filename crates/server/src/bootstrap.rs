//! Startup steps that must finish before the service does any work.

use crate::reconcile::reclaim_stale_passes;
use anyhow::{Context, Result};
use pantry_core::config::MetadataConfig;
use pantry_metadata::MetadataStore;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};

/// Connect to the metadata store and run the migration gate.
///
/// Returns only once every known migration is applied. Any failure is fatal:
/// the caller must not serve traffic or start reconciliation.
pub async fn prepare_metadata(config: &MetadataConfig) -> Result<Arc<dyn MetadataStore>> {
    let metadata = pantry_metadata::from_config(config)
        .await
        .context("failed to connect to metadata store")?;

    migrate(metadata.as_ref()).await?;
    Ok(metadata)
}

/// Run the migration gate against an already connected store.
pub async fn migrate(metadata: &dyn MetadataStore) -> Result<()> {
    let report = metadata
        .migrate()
        .await
        .context("schema migration failed; refusing to start")?;

    if report.is_noop() {
        tracing::info!(
            backend = metadata.backend_name(),
            "Schema is up to date"
        );
    } else {
        tracing::info!(
            backend = metadata.backend_name(),
            applied = ?report.applied,
            "Schema migrations applied"
        );
    }
    Ok(())
}

/// Mark reconciliation passes left `running` by a dead process as failed.
///
/// Only passes that started at least `lease_ttl` before `now` are touched, so
/// a live pass of another instance sharing the database keeps its lease.
/// Returns the number of passes recovered.
pub async fn recover_orphaned_passes(
    metadata: &dyn MetadataStore,
    now: OffsetDateTime,
    lease_ttl: Duration,
) -> Result<usize> {
    let recovered = reclaim_stale_passes(metadata, now, lease_ttl)
        .await
        .context("failed to recover orphaned reconciliation passes")?;
    Ok(recovered.len())
}
