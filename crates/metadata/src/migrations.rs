//! Versioned schema migrations and the startup migration gate.
//!
//! Each backend embeds an ordered list of SQL migrations. On startup the gate
//! compares it with the `schema_migrations` table and applies whatever is
//! missing, one transaction per migration, in ascending version order. Any
//! inconsistency or failure is returned as a [`MigrationError`] and must stop
//! the process.

use crate::error::{MetadataResult, MigrationError};
use async_trait::async_trait;

/// A single versioned schema change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub sql: &'static str,
}

impl Migration {
    pub const fn new(version: i64, description: &'static str, sql: &'static str) -> Self {
        Self {
            version,
            description,
            sql,
        }
    }

    /// Executable statements of this migration.
    pub fn statements(&self) -> Vec<&'static str> {
        split_statements(self.sql)
    }
}

/// SQLite migrations, oldest first.
pub const SQLITE_MIGRATIONS: &[Migration] = &[
    Migration::new(
        1,
        "create groups",
        include_str!("../migrations/sqlite/0001_create_groups.sql"),
    ),
    Migration::new(
        2,
        "group retry state",
        include_str!("../migrations/sqlite/0002_group_retry_state.sql"),
    ),
    Migration::new(
        3,
        "create reconcile passes",
        include_str!("../migrations/sqlite/0003_create_reconcile_passes.sql"),
    ),
];

/// PostgreSQL migrations, oldest first.
pub const POSTGRES_MIGRATIONS: &[Migration] = &[
    Migration::new(
        1,
        "create groups",
        include_str!("../migrations/postgres/0001_create_groups.sql"),
    ),
    Migration::new(
        2,
        "group retry state",
        include_str!("../migrations/postgres/0002_group_retry_state.sql"),
    ),
    Migration::new(
        3,
        "create reconcile passes",
        include_str!("../migrations/postgres/0003_create_reconcile_passes.sql"),
    ),
];

/// Split a migration script into statements, dropping comment-only fragments.
///
/// Neither backend accepts several statements in one prepared query.
pub fn split_statements(sql: &str) -> Vec<&str> {
    sql.split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

/// Backend operations the migration gate needs.
#[async_trait]
pub trait MigrationTarget: Send + Sync {
    /// Create the `schema_migrations` table if it does not exist.
    async fn ensure_migration_table(&self) -> MetadataResult<()>;

    /// Applied versions in ascending order.
    async fn applied_versions(&self) -> MetadataResult<Vec<i64>>;

    /// Run every statement of `migration` and record it, in one transaction.
    /// Nothing is left behind if any statement fails.
    async fn apply_migration(&self, migration: &Migration) -> Result<(), sqlx::Error>;
}

/// Outcome of a successful gate run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Versions applied by this run, in order.
    pub applied: Vec<i64>,
    /// Latest version now present in the database.
    pub latest: Option<i64>,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

/// Check that known versions are strictly ascending.
fn validate_known(known: &[Migration]) -> Result<(), MigrationError> {
    for pair in known.windows(2) {
        if pair[1].version <= pair[0].version {
            return Err(MigrationError::InvalidOrder {
                previous: pair[0].version,
                next: pair[1].version,
            });
        }
    }
    Ok(())
}

/// Compute the migrations still to apply, given what the database reports.
///
/// `applied` must be a prefix of `known`; anything else is a schema mismatch.
pub fn pending_migrations<'a>(
    known: &'a [Migration],
    applied: &[i64],
) -> Result<&'a [Migration], MigrationError> {
    validate_known(known)?;

    for (index, version) in applied.iter().enumerate() {
        match known.get(index) {
            Some(migration) if migration.version == *version => {}
            Some(migration) => {
                if known.iter().any(|m| m.version == *version) {
                    return Err(MigrationError::AppliedOutOfOrder {
                        expected: migration.version,
                        found: *version,
                    });
                }
                return Err(MigrationError::UnknownApplied {
                    version: *version,
                    latest_known: known.last().map(|m| m.version),
                });
            }
            None => {
                return Err(MigrationError::UnknownApplied {
                    version: *version,
                    latest_known: known.last().map(|m| m.version),
                });
            }
        }
    }

    Ok(&known[applied.len()..])
}

/// Apply every pending migration in order, stopping at the first failure.
pub async fn run_migrations(
    target: &dyn MigrationTarget,
    known: &[Migration],
) -> MetadataResult<MigrationReport> {
    target.ensure_migration_table().await?;
    let applied = target.applied_versions().await?;
    let pending = pending_migrations(known, &applied)?;

    if pending.is_empty() {
        tracing::debug!(
            latest = ?applied.last(),
            "Schema is up to date, no migrations pending"
        );
        return Ok(MigrationReport {
            applied: Vec::new(),
            latest: applied.last().copied(),
        });
    }

    tracing::info!(
        pending = pending.len(),
        current = ?applied.last(),
        target = ?pending.last().map(|m| m.version),
        "Applying schema migrations"
    );

    let mut report = MigrationReport {
        applied: Vec::with_capacity(pending.len()),
        latest: applied.last().copied(),
    };

    for migration in pending {
        target.apply_migration(migration).await.map_err(|source| {
            tracing::error!(
                version = migration.version,
                description = migration.description,
                error = %source,
                "Schema migration failed"
            );
            MigrationError::Failed {
                version: migration.version,
                description: migration.description.to_string(),
                source,
            }
        })?;

        tracing::info!(
            version = migration.version,
            description = migration.description,
            "Applied schema migration"
        );
        report.applied.push(migration.version);
        report.latest = Some(migration.version);
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KNOWN: &[Migration] = &[
        Migration::new(1, "one", "CREATE TABLE a (id INTEGER)"),
        Migration::new(2, "two", "CREATE TABLE b (id INTEGER)"),
        Migration::new(3, "three", "CREATE TABLE c (id INTEGER)"),
    ];

    fn versions(migrations: &[Migration]) -> Vec<i64> {
        migrations.iter().map(|m| m.version).collect()
    }

    #[test]
    fn test_pending_after_prefix() {
        assert_eq!(versions(pending_migrations(KNOWN, &[]).unwrap()), vec![1, 2, 3]);
        assert_eq!(versions(pending_migrations(KNOWN, &[1]).unwrap()), vec![2, 3]);
        assert!(pending_migrations(KNOWN, &[1, 2, 3]).unwrap().is_empty());
    }

    #[test]
    fn test_pending_rejects_gap() {
        let err = pending_migrations(KNOWN, &[1, 3]).unwrap_err();
        assert!(matches!(
            err,
            MigrationError::AppliedOutOfOrder {
                expected: 2,
                found: 3
            }
        ));
    }

    #[test]
    fn test_pending_rejects_unknown_version() {
        let err = pending_migrations(KNOWN, &[1, 2, 3, 4]).unwrap_err();
        assert!(matches!(
            err,
            MigrationError::UnknownApplied {
                version: 4,
                latest_known: Some(3)
            }
        ));
    }

    #[test]
    fn test_known_must_ascend() {
        let bad = [
            Migration::new(1, "one", "SELECT 1"),
            Migration::new(1, "dup", "SELECT 1"),
        ];
        assert!(matches!(
            pending_migrations(&bad, &[]),
            Err(MigrationError::InvalidOrder {
                previous: 1,
                next: 1
            })
        ));
    }

    #[test]
    fn test_split_statements_drops_comments() {
        let sql = "-- header\nCREATE TABLE a (id INTEGER);\n\n-- trailing comment\n;CREATE INDEX i ON a(id);";
        let statements = split_statements(sql);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].ends_with("CREATE TABLE a (id INTEGER)"));
        assert_eq!(statements[1], "CREATE INDEX i ON a(id)");
    }

    #[test]
    fn test_embedded_migrations_are_ordered() {
        assert!(validate_known(SQLITE_MIGRATIONS).is_ok());
        assert!(validate_known(POSTGRES_MIGRATIONS).is_ok());
        assert_eq!(
            versions(SQLITE_MIGRATIONS),
            versions(POSTGRES_MIGRATIONS)
        );
        for migration in SQLITE_MIGRATIONS.iter().chain(POSTGRES_MIGRATIONS) {
            assert!(!migration.statements().is_empty());
        }
    }
}
