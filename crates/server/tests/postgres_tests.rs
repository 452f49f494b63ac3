//! PostgreSQL integration tests using testcontainers.
//!
//! These tests verify the PostgreSQL backend implementation works correctly.
//! They require Docker to be running. Set SKIP_POSTGRES_TESTS=1 to skip.

mod common;

use common::*;
use pantry_core::DeleteOutcome;
use pantry_metadata::migrations::POSTGRES_MIGRATIONS;
use pantry_metadata::{MetadataStore, PostgresStore};
use pantry_server::Reconciler;
use std::sync::Arc;
use time::Duration;
use tokio_util::sync::CancellationToken;

/// Try to create a PostgreSQL test store, skipping if Docker is unavailable
/// or SKIP_POSTGRES_TESTS is set.
///
/// Only container-start failures (Docker unavailable) cause a skip.
/// Schema, migration, or connection errors still panic so real regressions
/// are not silently swallowed.
async fn postgres_or_skip(migrated: bool) -> Option<PostgresTestMetadata> {
    if std::env::var("SKIP_POSTGRES_TESTS").is_ok() {
        return None;
    }
    let result = if migrated {
        PostgresTestMetadata::new().await
    } else {
        PostgresTestMetadata::unmigrated().await
    };
    match result {
        Ok(metadata) => Some(metadata),
        Err(err) => {
            let msg = err.to_string();
            if msg.contains(POSTGRES_CONTAINER_START_ERR_PREFIX) {
                eprintln!("Skipping PostgreSQL test (Docker unavailable): {msg}");
                None
            } else {
                panic!("PostgreSQL test setup failed: {msg}");
            }
        }
    }
}

#[tokio::test]
async fn test_postgres_migration_gate_in_steps() {
    let Some(metadata) = postgres_or_skip(false).await else {
        return;
    };

    let old = PostgresStore::from_url(&metadata.url, 2, None)
        .await
        .unwrap()
        .with_migrations(&POSTGRES_MIGRATIONS[..1]);
    assert_eq!(old.migrate().await.unwrap().applied, vec![1]);

    let current = PostgresStore::from_url(&metadata.url, 2, None)
        .await
        .unwrap();
    assert_eq!(current.migrate().await.unwrap().applied, vec![2, 3]);
    assert!(current.migrate().await.unwrap().is_noop());

    let versions: Vec<i64> =
        sqlx::query_scalar("SELECT version FROM schema_migrations ORDER BY version")
            .fetch_all(current.pool())
            .await
            .unwrap();
    assert_eq!(versions, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_postgres_reconcile_pass() {
    let Some(metadata) = postgres_or_skip(true).await else {
        return;
    };
    let store = metadata.store();

    let ids = insert_groups(
        store.as_ref(),
        &[
            group("expired", -Duration::hours(1), &["pg/a", "pg/b"]),
            group("live", Duration::hours(1), &["pg/c"]),
        ],
    )
    .await;
    let objects = Arc::new(MemoryStore::with_keys(&["pg/a", "pg/b", "pg/c"]));

    let reconciler = Reconciler::new(store.clone(), objects.clone(), test_reconcile_config())
        .with_clock(test_clock())
        .with_reporter(RecordingReporter::new());
    let summary = reconciler
        .run_pass(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.stats.groups_deleted, 1);
    assert_eq!(summary.stats.objects_deleted, 2);
    assert!(store.get_group(ids[0]).await.unwrap().is_none());
    assert!(store.get_group(ids[1]).await.unwrap().is_some());
    assert!(objects.contains("pg/c"));

    let pass = store.get_pass(summary.pass_id).await.unwrap().unwrap();
    assert_eq!(pass.state, "finished");
    assert!(pass.stats_json.is_some());
    assert!(store.get_orphaned_passes().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_postgres_list_expired_compares_microseconds() {
    let Some(metadata) = postgres_or_skip(true).await else {
        return;
    };
    let store = metadata.store();

    let ids = insert_groups(
        store.as_ref(),
        &[
            group("soon", Duration::microseconds(400), &["pg/soon"]),
            group("just gone", -Duration::microseconds(400), &["pg/gone"]),
            group("sub-micro", Duration::nanoseconds(400), &["pg/sub"]),
        ],
    )
    .await;

    let expired = store.list_expired(TEST_NOW).await.unwrap();
    let expired: Vec<_> = expired.iter().map(|g| g.group_id).collect();
    assert_eq!(expired, vec![ids[1]]);
}

#[tokio::test]
async fn test_postgres_delete_group_cascades_objects() {
    let Some(metadata) = postgres_or_skip(true).await else {
        return;
    };
    let store = metadata.store();

    let g = group("g", -Duration::hours(1), &["k1", "k2"]);
    store.create_group(&g).await.unwrap();
    assert_eq!(
        store.delete_group(g.group_id).await.unwrap(),
        DeleteOutcome::Deleted
    );

    let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM group_objects")
        .fetch_one(metadata.pool())
        .await
        .unwrap();
    assert_eq!(remaining, 0);
    store.health_check().await.unwrap();
    assert_eq!(store.backend_name(), "postgres");
}
