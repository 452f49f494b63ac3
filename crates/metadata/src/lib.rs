//! Metadata store abstraction and implementations for Pantry.
//!
//! This crate provides the data model the reconciler works against:
//! - Expiring content groups and the object keys they own
//! - Retry bookkeeping for groups whose removal failed
//! - Reconciliation pass records (a lease for the single running pass)
//! - Versioned schema migrations and the startup gate that applies them

pub mod error;
pub mod migrations;
pub mod models;
pub mod postgres;
pub mod repos;
pub mod store;

pub use error::{MetadataError, MetadataResult, MigrationError};
pub use migrations::{Migration, MigrationReport, MigrationTarget};
pub use postgres::PostgresStore;
pub use store::{MetadataStore, SqliteStore};

use pantry_core::config::MetadataConfig;
use std::sync::Arc;

/// Connect to the configured metadata store.
///
/// The schema is not touched; callers run [`MetadataStore::migrate`] before
/// serving anything.
pub async fn from_config(config: &MetadataConfig) -> MetadataResult<Arc<dyn MetadataStore>> {
    match config {
        MetadataConfig::Sqlite { path } => {
            let store = SqliteStore::connect(path).await?;
            Ok(Arc::new(store) as Arc<dyn MetadataStore>)
        }
        MetadataConfig::Postgres {
            url,
            host,
            port,
            username,
            password,
            database,
            ssl_mode,
            max_connections,
            statement_timeout_ms,
        } => {
            let store = if let Some(url) = url {
                tracing::info!("Connecting to PostgreSQL using connection URL");
                PostgresStore::from_url(url, *max_connections, *statement_timeout_ms).await?
            } else if let (Some(host), Some(database)) = (host.as_ref(), database.as_ref()) {
                PostgresStore::from_params(
                    host,
                    port.unwrap_or(5432),
                    username.as_deref(),
                    password.as_deref(),
                    database,
                    *ssl_mode,
                    *max_connections,
                    *statement_timeout_ms,
                )
                .await?
            } else {
                return Err(MetadataError::Config(
                    "postgres config requires either 'url' or 'host' + 'database'".to_string(),
                ));
            };
            Ok(Arc::new(store) as Arc<dyn MetadataStore>)
        }
    }
}
