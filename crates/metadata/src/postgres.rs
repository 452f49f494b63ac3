//! PostgreSQL-based metadata store implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::migrations::{
    Migration, MigrationReport, MigrationTarget, POSTGRES_MIGRATIONS, run_migrations,
};
use crate::models::*;
use crate::repos::{GroupRepo, PassRepo, PassState};
use crate::store::MetadataStore;
use async_trait::async_trait;
use pantry_core::DeleteOutcome;
use pantry_core::config::PgSslMode;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode as SqlxPgSslMode};
use sqlx::{Pool, Postgres};
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// PostgreSQL-based metadata store.
pub struct PostgresStore {
    pool: Pool<Postgres>,
    migrations: &'static [Migration],
}

impl PostgresStore {
    /// Connect using a full connection URL. Does not migrate.
    pub async fn from_url(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let opts = PgConnectOptions::from_str(url)?;
        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    /// Connect from individual parameters so the password can come from its
    /// own environment variable. Does not migrate.
    #[allow(clippy::too_many_arguments)]
    pub async fn from_params(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        database: &str,
        ssl_mode: Option<PgSslMode>,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let mut opts = PgConnectOptions::new()
            .host(host)
            .port(port)
            .database(database);

        if let Some(user) = username {
            opts = opts.username(user);
        }

        if let Some(pass) = password {
            opts = opts.password(pass);
        }

        if let Some(mode) = ssl_mode {
            let sqlx_mode = match mode {
                PgSslMode::Disable => SqlxPgSslMode::Disable,
                PgSslMode::Prefer => SqlxPgSslMode::Prefer,
                PgSslMode::Require => SqlxPgSslMode::Require,
            };
            opts = opts.ssl_mode(sqlx_mode);
        }

        // Log connection info without password
        tracing::info!(
            host = host,
            port = port,
            database = database,
            username = username.unwrap_or("<none>"),
            ssl_mode = ?ssl_mode,
            "Connecting to PostgreSQL with individual parameters"
        );

        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    /// Connect from a URL and run the migration gate.
    pub async fn new(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let store = Self::from_url(url, max_connections, statement_timeout_ms).await?;
        store.migrate().await?;
        Ok(store)
    }

    async fn connect(
        mut opts: PgConnectOptions,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        if let Some(timeout_ms) = statement_timeout_ms {
            opts = opts.options([("statement_timeout", format!("{}ms", timeout_ms))]);
            tracing::info!("PostgreSQL statement_timeout set to {}ms", timeout_ms);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        Ok(Self {
            pool,
            migrations: POSTGRES_MIGRATIONS,
        })
    }

    /// Replace the migration list the gate applies.
    pub fn with_migrations(mut self, migrations: &'static [Migration]) -> Self {
        self.migrations = migrations;
        self
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

/// PostgreSQL error code 23505 = unique_violation.
fn map_pg_unique(err: sqlx::Error, constraints: &[&str], message: &str) -> MetadataError {
    if let sqlx::Error::Database(ref db_err) = err
        && db_err.code().as_deref() == Some("23505")
        && db_err
            .constraint()
            .is_some_and(|name| constraints.contains(&name))
    {
        return MetadataError::Constraint(message.to_string());
    }
    MetadataError::Database(err)
}

#[async_trait]
impl MetadataStore for PostgresStore {
    async fn migrate(&self) -> MetadataResult<MigrationReport> {
        run_migrations(self, self.migrations).await
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

#[async_trait]
impl MigrationTarget for PostgresStore {
    async fn ensure_migration_table(&self) -> MetadataResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version BIGINT PRIMARY KEY,
                description TEXT NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL
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
        // Serialize concurrent gates from instances starting at the same time.
        sqlx::query("LOCK TABLE schema_migrations IN EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await?;
        for statement in migration.statements() {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        sqlx::query(
            "INSERT INTO schema_migrations (version, description, applied_at) VALUES ($1, $2, NOW())",
        )
        .bind(migration.version)
        .bind(migration.description)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }
}

/// `timestamptz` keeps microseconds. Sub-microsecond expiries round up so a
/// group is never listed before its time.
fn ceil_to_micros(t: OffsetDateTime) -> OffsetDateTime {
    match t.nanosecond() % 1_000 {
        0 => t,
        rem => t + time::Duration::nanoseconds(i64::from(1_000 - rem)),
    }
}

#[async_trait]
impl GroupRepo for PostgresStore {
    async fn create_group(&self, group: &NewGroup) -> MetadataResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO content_groups (group_id, name, expires_at, created_at) VALUES ($1, $2, $3, NOW())",
        )
        .bind(group.group_id)
        .bind(&group.name)
        .bind(ceil_to_micros(group.expires_at))
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            map_pg_unique(
                e,
                &["content_groups_pkey"],
                &format!("group {} already exists", group.group_id),
            )
        })?;

        for (position, key) in group.object_keys.iter().enumerate() {
            sqlx::query(
                "INSERT INTO group_objects (group_id, position, object_key) VALUES ($1, $2, $3)",
            )
            .bind(group.group_id)
            .bind(position as i32)
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                map_pg_unique(
                    e,
                    &["group_objects_object_key_key"],
                    &format!("object key '{key}' is already attached to a group"),
                )
            })?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_group(&self, group_id: Uuid) -> MetadataResult<Option<Group>> {
        let row = sqlx::query_as::<_, GroupRow>(
            r#"
            SELECT group_id, name, expires_at, failed_attempts, last_failure_at,
                   next_attempt_at, created_at
            FROM content_groups WHERE group_id = $1
            "#,
        )
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let keys: Vec<String> = sqlx::query_scalar(
            "SELECT object_key FROM group_objects WHERE group_id = $1 ORDER BY position",
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
            WHERE g.expires_at <= $1
            ORDER BY g.expires_at, g.group_id, o.position
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(fold_group_rows(rows))
    }

    async fn delete_group(&self, group_id: Uuid) -> MetadataResult<DeleteOutcome> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM group_objects WHERE group_id = $1")
            .bind(group_id)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM content_groups WHERE group_id = $1")
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
                last_failure_at = $1,
                next_attempt_at = $2
            WHERE group_id = $3
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
impl PassRepo for PostgresStore {
    async fn create_pass(&self, pass_id: Uuid, started_at: OffsetDateTime) -> MetadataResult<()> {
        sqlx::query(
            "INSERT INTO reconcile_passes (pass_id, state, started_at) VALUES ($1, $2, $3)",
        )
        .bind(pass_id)
        .bind(PassState::Running.as_str())
        .bind(started_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            map_pg_unique(
                e,
                &["idx_reconcile_passes_single_running"],
                "another reconciliation pass is already running",
            )
        })?;
        Ok(())
    }

    async fn get_pass(&self, pass_id: Uuid) -> MetadataResult<Option<PassRow>> {
        let row = sqlx::query_as::<_, PassRow>(
            r#"
            SELECT pass_id, state, started_at, finished_at, stats_json
            FROM reconcile_passes WHERE pass_id = $1
            "#,
        )
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
            "UPDATE reconcile_passes SET state = $1, finished_at = $2, stats_json = $3 WHERE pass_id = $4",
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
            r#"
            SELECT pass_id, state, started_at, finished_at, stats_json
            FROM reconcile_passes
            ORDER BY started_at DESC
            LIMIT $1
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn get_orphaned_passes(&self) -> MetadataResult<Vec<PassRow>> {
        let rows = sqlx::query_as::<_, PassRow>(
            r#"
            SELECT pass_id, state, started_at, finished_at, stats_json
            FROM reconcile_passes
            WHERE state = 'running'
            ORDER BY started_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
