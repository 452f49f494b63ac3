//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use pantry_core::DeleteOutcome;

/// Object store holding the binary payloads that groups reference by key.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Check if an object exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Get an object's content.
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Put an object, replacing any existing content.
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()>;

    /// Delete an object.
    ///
    /// Idempotent: an absent key returns `DeleteOutcome::NotFound`, never an
    /// error. Any `Err` means the object may still be present.
    async fn delete(&self, key: &str) -> StorageResult<DeleteOutcome>;

    /// Check that the backend is reachable and writable.
    async fn health_check(&self) -> StorageResult<()>;

    /// Backend name for logs and metrics.
    fn backend_name(&self) -> &'static str;
}
