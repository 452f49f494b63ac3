//! Metadata store error types.

use thiserror::Error;

/// Metadata store operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("schema migration error: {0}")]
    Migration(#[from] MigrationError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Schema migration failures. All of these are fatal at startup.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("known migrations are not strictly ascending: {previous} is followed by {next}")]
    InvalidOrder { previous: i64, next: i64 },

    #[error(
        "database has migration {version} applied which this binary does not know about \
         (latest known: {latest_known:?})"
    )]
    UnknownApplied {
        version: i64,
        latest_known: Option<i64>,
    },

    #[error("applied migrations are not a prefix of known migrations: expected {expected}, found {found}")]
    AppliedOutOfOrder { expected: i64, found: i64 },

    #[error("migration {version} ({description}) failed: {source}")]
    Failed {
        version: i64,
        description: String,
        #[source]
        source: sqlx::Error,
    },
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;
