//! Object store test doubles.

use async_trait::async_trait;
use bytes::Bytes;
use pantry_core::DeleteOutcome;
use pantry_storage::{FilesystemBackend, ObjectStore, StorageError, StorageResult};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// A filesystem store in a temporary directory.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestStorage {
    pub backend: Arc<dyn ObjectStore>,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestStorage {
    pub async fn new() -> StorageResult<Self> {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let backend = FilesystemBackend::new(temp_dir.path()).await?;

        Ok(Self {
            backend: Arc::new(backend),
            _temp_dir: temp_dir,
        })
    }

    pub fn store(&self) -> Arc<dyn ObjectStore> {
        self.backend.clone()
    }
}

/// In-memory object store.
#[allow(dead_code)]
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<String, Bytes>>,
}

#[allow(dead_code)]
impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store holding one small object under each key.
    pub fn with_keys(keys: &[&str]) -> Self {
        let store = Self::new();
        {
            let mut objects = store.objects.lock().unwrap();
            for key in keys {
                objects.insert(key.to_string(), Bytes::from(format!("payload of {key}")));
            }
        }
        store
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.contains(key))
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.objects.lock().unwrap().insert(key.to_string(), data);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<DeleteOutcome> {
        match self.objects.lock().unwrap().remove(key) {
            Some(_) => Ok(DeleteOutcome::Deleted),
            None => Ok(DeleteOutcome::NotFound),
        }
    }

    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

/// Wraps a [`MemoryStore`] and injects failures, hangs and latency into
/// deletes. Every delete call is recorded.
#[allow(dead_code)]
pub struct FaultyStore {
    inner: Arc<MemoryStore>,
    failing: Mutex<HashSet<String>>,
    hanging: Mutex<HashSet<String>>,
    delay: Mutex<Duration>,
    delete_calls: Mutex<Vec<String>>,
    unhealthy: Mutex<bool>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Decrements the in-flight counter even when the delete future is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[allow(dead_code)]
impl FaultyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            failing: Mutex::new(HashSet::new()),
            hanging: Mutex::new(HashSet::new()),
            delay: Mutex::new(Duration::ZERO),
            delete_calls: Mutex::new(Vec::new()),
            unhealthy: Mutex::new(false),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &Arc<MemoryStore> {
        &self.inner
    }

    /// Deletes of `key` fail with an I/O error until healed.
    pub fn fail_key(&self, key: &str) {
        self.failing.lock().unwrap().insert(key.to_string());
    }

    pub fn heal_key(&self, key: &str) {
        self.failing.lock().unwrap().remove(key);
        self.hanging.lock().unwrap().remove(key);
    }

    /// Deletes of `key` never complete.
    pub fn hang_key(&self, key: &str) {
        self.hanging.lock().unwrap().insert(key.to_string());
    }

    /// Latency added to every delete.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn set_unhealthy(&self, unhealthy: bool) {
        *self.unhealthy.lock().unwrap() = unhealthy;
    }

    pub fn delete_calls(&self) -> Vec<String> {
        self.delete_calls.lock().unwrap().clone()
    }

    pub fn delete_count(&self, key: &str) -> usize {
        self.delete_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|k| k.as_str() == key)
            .count()
    }

    /// Highest number of deletes observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for FaultyStore {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.inner.exists(key).await
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.inner.put(key, data).await
    }

    async fn delete(&self, key: &str) -> StorageResult<DeleteOutcome> {
        self.delete_calls.lock().unwrap().push(key.to_string());

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let hangs = self.hanging.lock().unwrap().contains(key);
        if hangs {
            std::future::pending::<()>().await;
        }

        let fails = self.failing.lock().unwrap().contains(key);
        if fails {
            return Err(StorageError::Io(std::io::Error::other(format!(
                "simulated outage deleting {key}"
            ))));
        }

        self.inner.delete(key).await
    }

    async fn health_check(&self) -> StorageResult<()> {
        if *self.unhealthy.lock().unwrap() {
            return Err(StorageError::Io(std::io::Error::other("simulated outage")));
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "faulty"
    }
}
