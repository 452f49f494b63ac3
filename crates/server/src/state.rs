//! Application state shared across handlers.

use pantry_core::config::AppConfig;
use pantry_metadata::MetadataStore;
use pantry_storage::ObjectStore;
use std::sync::Arc;

/// Shared application state.
///
/// The stores are the same instances the reconciler works against.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Object storage backend.
    pub storage: Arc<dyn ObjectStore>,
    /// Metadata store.
    pub metadata: Arc<dyn MetadataStore>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        storage: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            storage,
            metadata,
        }
    }
}
