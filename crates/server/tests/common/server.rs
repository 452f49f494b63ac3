//! Server test utilities.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use pantry_core::config::{AppConfig, MetadataConfig, StorageConfig};
use pantry_metadata::{MetadataStore, SqliteStore};
use pantry_server::{AppState, create_router};
use pantry_storage::ObjectStore;
use serde_json::Value;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    /// Create a test server over the given object store.
    pub async fn new(storage: Arc<dyn ObjectStore>) -> Self {
        Self::with_config(storage, |_| {}).await
    }

    /// Create a test server with custom config modifications.
    pub async fn with_config<F>(storage: Arc<dyn ObjectStore>, modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");

        let db_path = temp_dir.path().join("metadata.db");
        let metadata: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(&db_path)
                .await
                .expect("Failed to create metadata store"),
        );

        let mut config = AppConfig::for_testing();
        config.storage = StorageConfig::Filesystem {
            path: temp_dir.path().join("storage"),
        };
        config.metadata = MetadataConfig::Sqlite { path: db_path };
        modifier(&mut config);

        let state = AppState::new(config, storage, metadata);
        let router = create_router(state.clone());

        Self {
            router,
            state,
            _temp_dir: temp_dir,
        }
    }

    pub fn metadata(&self) -> Arc<dyn MetadataStore> {
        self.state.metadata.clone()
    }

    /// Send a GET request and return status and raw body.
    pub async fn get_raw(&self, uri: &str) -> (StatusCode, String) {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = self.router.clone().oneshot(request).await.unwrap();

        let status = response.status();
        let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body_bytes.to_vec()).unwrap())
    }

    /// Send a GET request and parse the body as JSON.
    pub async fn get_json(&self, uri: &str) -> (StatusCode, Value) {
        let (status, body) = self.get_raw(uri).await;
        let json = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&body).unwrap_or(Value::Null)
        };
        (status, json)
    }
}
