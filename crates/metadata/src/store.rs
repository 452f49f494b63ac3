//! Metadata store trait and the SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::migrations::{
    Migration, MigrationReport, MigrationTarget, SQLITE_MIGRATIONS, run_migrations,
};
use crate::repos::{GroupRepo, PassRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore: GroupRepo + PassRepo + MigrationTarget + Send + Sync {
    /// Run the migration gate against this backend's embedded migrations.
    async fn migrate(&self) -> MetadataResult<MigrationReport>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;

    /// Backend identifier for logs and metrics.
    fn backend_name(&self) -> &'static str;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    migrations: &'static [Migration],
}

impl SqliteStore {
    /// Open (creating if missing) a SQLite database and run all migrations.
    pub async fn new(path: impl AsRef<Path>) -> MetadataResult<Self> {
        let store = Self::connect(path).await?;
        store.migrate().await?;
        Ok(store)
    }

    /// Open a SQLite database without touching its schema.
    ///
    /// `":memory:"` opens a private in-memory database that lives as long as the store.
    pub async fn connect(path: impl AsRef<Path>) -> MetadataResult<Self> {
        let path = path.as_ref();
        let in_memory = path == Path::new(":memory:");

        let opts = if in_memory {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }
            SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
                .create_if_missing(true)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        }
        .foreign_keys(true)
        // Prevent transient "database is locked" errors under concurrent access.
        .busy_timeout(Duration::from_secs(5));

        let mut pool_opts = SqlitePoolOptions::new()
            // SQLite permits limited write concurrency; a single connection avoids
            // persistent "database is locked" failures.
            .max_connections(1);
        if in_memory {
            // The database disappears with its connection, so never recycle it.
            pool_opts = pool_opts
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let pool = pool_opts.connect_with(opts).await?;

        Ok(Self {
            pool,
            migrations: SQLITE_MIGRATIONS,
        })
    }

    /// Replace the migration list the gate applies. Used to exercise the gate
    /// with synthetic migrations.
    pub fn with_migrations(mut self, migrations: &'static [Migration]) -> Self {
        self.migrations = migrations;
        self
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

/// Unix nanoseconds used as the SQLite expiry sort key.
///
/// Expiry times outside the `i64` nanosecond range (roughly 1677 to 2262) are rejected.
fn expiry_key(expires_at: OffsetDateTime) -> MetadataResult<i64> {
    i64::try_from(expires_at.unix_timestamp_nanos()).map_err(|_| {
        MetadataError::Constraint(format!(
            "expires_at {expires_at} is outside the supported range"
        ))
    })
}

/// Comparison bound for `now`; saturates since every stored key fits in `i64`.
fn expiry_bound(now: OffsetDateTime) -> i64 {
    let nanos = now.unix_timestamp_nanos();
    i64::try_from(nanos).unwrap_or(if nanos < 0 { i64::MIN } else { i64::MAX })
}

/// Map unique violations on the given table to `MetadataError::Constraint`.
///
/// SQLite reports them as "UNIQUE constraint failed: <table>.<column>" or with
/// the index name, so both the generic phrase and the table name are checked.
fn map_sqlite_unique(err: sqlx::Error, table: &str, message: &str) -> MetadataError {
    if let sqlx::Error::Database(ref db_err) = err {
        let msg = db_err.message();
        if (msg.contains("UNIQUE constraint") || msg.contains("PRIMARY KEY"))
            && msg.contains(table)
        {
            return MetadataError::Constraint(message.to_string());
        }
    }
    MetadataError::Database(err)
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<MigrationReport> {
        run_migrations(self, self.migrations).await
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}

mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use crate::repos::PassState;
    use pantry_core::DeleteOutcome;
    use uuid::Uuid;

    #[async_trait]
    impl MigrationTarget for SqliteStore {
        async fn ensure_migration_table(&self) -> MetadataResult<()> {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY NOT NULL,
                    description TEXT NOT NULL,
                    applied_at TEXT NOT NULL
                )
                "#,
            )
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn applied_versions(&self) -> MetadataResult<Vec<i64>> {
            let versions: Vec<i64> =
                sqlx::query_scalar("SELECT version FROM schema_migrations ORDER BY version")
                    .fetch_all(&self.pool)
                    .await?;
            Ok(versions)
        }

        async fn apply_migration(&self, migration: &Migration) -> Result<(), sqlx::Error> {
            let mut tx = self.pool.begin().await?;
            for statement in migration.statements() {
                sqlx::query(statement).execute(&mut *tx).await?;
            }
            sqlx::query(
                "INSERT INTO schema_migrations (version, description, applied_at) VALUES (?, ?, ?)",
            )
            .bind(migration.version)
            .bind(migration.description)
            .bind(OffsetDateTime::now_utc())
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(())
        }
    }

    #[async_trait]
    impl GroupRepo for SqliteStore {
        async fn create_group(&self, group: &NewGroup) -> MetadataResult<()> {
            let expires_at_ns = expiry_key(group.expires_at)?;
            let mut tx = self.pool.begin().await?;

            sqlx::query(
                "INSERT INTO content_groups (group_id, name, expires_at, expires_at_ns, created_at) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(group.group_id)
            .bind(&group.name)
            .bind(group.expires_at)
            .bind(expires_at_ns)
            .bind(OffsetDateTime::now_utc())
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                map_sqlite_unique(
                    e,
                    "content_groups",
                    &format!("group {} already exists", group.group_id),
                )
            })?;

            for (position, key) in group.object_keys.iter().enumerate() {
                sqlx::query(
                    "INSERT INTO group_objects (group_id, position, object_key) VALUES (?, ?, ?)",
                )
                .bind(group.group_id)
                .bind(position as i64)
                .bind(key)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    map_sqlite_unique(
                        e,
                        "group_objects",
                        &format!("object key '{key}' is already attached to a group"),
                    )
                })?;
            }

            tx.commit().await?;
            Ok(())
        }

        async fn get_group(&self, group_id: Uuid) -> MetadataResult<Option<Group>> {
            let row = sqlx::query_as::<_, GroupRow>(
                "SELECT * FROM content_groups WHERE group_id = ?",
            )
            .bind(group_id)
            .fetch_optional(&self.pool)
            .await?;

            let Some(row) = row else {
                return Ok(None);
            };

            let keys: Vec<String> = sqlx::query_scalar(
                "SELECT object_key FROM group_objects WHERE group_id = ? ORDER BY position",
            )
            .bind(group_id)
            .fetch_all(&self.pool)
            .await?;

            Ok(Some(row.into_group(keys)))
        }

        async fn list_expired(&self, now: OffsetDateTime) -> MetadataResult<Vec<Group>> {
            let rows = sqlx::query_as::<_, GroupObjectJoinRow>(
                r#"
                SELECT g.group_id, g.name, g.expires_at, g.failed_attempts,
                       g.last_failure_at, g.next_attempt_at, o.object_key
                FROM content_groups g
                LEFT JOIN group_objects o ON o.group_id = g.group_id
                WHERE g.expires_at_ns <= ?
                ORDER BY g.expires_at_ns, g.group_id, o.position
                "#,
            )
            .bind(expiry_bound(now))
            .fetch_all(&self.pool)
            .await?;

            Ok(fold_group_rows(rows))
        }

        async fn delete_group(&self, group_id: Uuid) -> MetadataResult<DeleteOutcome> {
            let mut tx = self.pool.begin().await?;

            sqlx::query("DELETE FROM group_objects WHERE group_id = ?")
                .bind(group_id)
                .execute(&mut *tx)
                .await?;

            let result = sqlx::query("DELETE FROM content_groups WHERE group_id = ?")
                .bind(group_id)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;

            if result.rows_affected() == 0 {
                Ok(DeleteOutcome::NotFound)
            } else {
                Ok(DeleteOutcome::Deleted)
            }
        }

        async fn record_group_failure(
            &self,
            group_id: Uuid,
            failed_at: OffsetDateTime,
            next_attempt_at: Option<OffsetDateTime>,
        ) -> MetadataResult<()> {
            sqlx::query(
                r#"
                UPDATE content_groups
                SET failed_attempts = failed_attempts + 1,
                    last_failure_at = ?,
                    next_attempt_at = ?
                WHERE group_id = ?
                "#,
            )
            .bind(failed_at)
            .bind(next_attempt_at)
            .bind(group_id)
            .execute(&self.pool)
            .await?;
            Ok(())
        }
    }

    #[async_trait]
    impl PassRepo for SqliteStore {
        async fn create_pass(
            &self,
            pass_id: Uuid,
            started_at: OffsetDateTime,
        ) -> MetadataResult<()> {
            sqlx::query(
                "INSERT INTO reconcile_passes (pass_id, state, started_at) VALUES (?, ?, ?)",
            )
            .bind(pass_id)
            .bind(PassState::Running.as_str())
            .bind(started_at)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                map_sqlite_unique(
                    e,
                    "reconcile_passes",
                    "another reconciliation pass is already running",
                )
            })?;
            Ok(())
        }

        async fn get_pass(&self, pass_id: Uuid) -> MetadataResult<Option<PassRow>> {
            let row =
                sqlx::query_as::<_, PassRow>("SELECT * FROM reconcile_passes WHERE pass_id = ?")
                    .bind(pass_id)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row)
        }

        async fn update_pass_state(
            &self,
            pass_id: Uuid,
            state: PassState,
            finished_at: OffsetDateTime,
            stats_json: Option<&str>,
        ) -> MetadataResult<()> {
            let result = sqlx::query(
                "UPDATE reconcile_passes SET state = ?, finished_at = ?, stats_json = ? WHERE pass_id = ?",
            )
            .bind(state.as_str())
            .bind(finished_at)
            .bind(stats_json)
            .bind(pass_id)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("pass {pass_id}")));
            }
            Ok(())
        }

        async fn get_recent_passes(&self, limit: u32) -> MetadataResult<Vec<PassRow>> {
            let rows = sqlx::query_as::<_, PassRow>(
                "SELECT * FROM reconcile_passes ORDER BY julianday(started_at) DESC LIMIT ?",
            )
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn get_orphaned_passes(&self) -> MetadataResult<Vec<PassRow>> {
            let rows = sqlx::query_as::<_, PassRow>(
                "SELECT * FROM reconcile_passes WHERE state = 'running' ORDER BY julianday(started_at) DESC",
            )
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }
    }
}
