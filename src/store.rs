//! Object store interface.
//!
//! The engine consumes exactly these operations; anything that
//! satisfies them is an acceptable backend. Blobs are opaque bytes
//! keyed by string; metadata is an ETag (md5 of content here), an
//! mtime and a size. A process wide semaphore bounds concurrent
//! backend calls, applying backpressure by blocking the acquirer.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Semaphore;

use crate::config::Config;

pub mod memory;
pub mod posix;

pub use memory::MemoryStore;
pub use posix::PosixStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("key not found")]
    NotFound,

    #[error("malformed object: {0}")]
    Malformed(String),

    #[error("transient store failure: {0}")]
    Transient(String),

    #[error("store failure: {0}")]
    Fatal(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone)]
pub struct GetResult {
    pub data: Vec<u8>,
    pub etag: String,
    pub last_modified: u64,
}

#[derive(Debug, Clone)]
pub struct ListEntry {
    pub key: String,
    pub etag: Option<String>,
    pub last_modified: Option<u64>,
    pub size: Option<u64>,
}

#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<GetResult>;
    async fn get_range(&self, key: &str, offset: u64, length: u64) -> StoreResult<Vec<u8>>;
    /// Returns the new (etag, size).
    async fn put(&self, key: &str, data: &[u8]) -> StoreResult<(String, u64)>;
    /// Never reports `NotFound`; any backend failure is `Transient`.
    async fn exists(&self, key: &str) -> StoreResult<bool>;
    async fn delete(&self, key: &str) -> StoreResult<()>;
    /// Keys under `prefix` in key order. With a delimiter, keys with
    /// further structure collapse into one entry per sub-prefix. With
    /// `stats`, each plain entry carries etag/mtime/size.
    async fn list(
        &self,
        prefix: &str,
        delimiter: Option<char>,
        stats: bool,
    ) -> StoreResult<Vec<ListEntry>>;
}

pub fn content_etag(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Shared handle to the configured backend plus the connection
/// bound.
#[derive(Clone)]
pub struct Storage {
    inner: Arc<dyn ObjectStore>,
    permits: Arc<Semaphore>,
}

impl Storage {
    pub fn new(inner: Arc<dyn ObjectStore>, max_connections: usize) -> Self {
        Storage { inner, permits: Arc::new(Semaphore::new(max_connections.max(1))) }
    }

    /// Select the backend from the gateway url: `file://<root>` for a
    /// directory tree, `memory://` for the in-process map. The real
    /// S3 wire client plugs in behind the same trait.
    pub fn open(config: &Config) -> StoreResult<Self> {
        let gateway = config.aws_s3_gateway.as_str();
        let inner: Arc<dyn ObjectStore> = if let Some(root) = gateway.strip_prefix("file://") {
            let root = std::path::Path::new(root).join(&config.bucket_name);
            Arc::new(PosixStore::new(root))
        } else if gateway.starts_with("memory://") {
            Arc::new(MemoryStore::new())
        } else {
            return Err(StoreError::Fatal(format!("unsupported store gateway: {}", gateway)));
        };
        Ok(Storage::new(inner, config.max_tcp_connections))
    }

    pub async fn get(&self, key: &str) -> StoreResult<GetResult> {
        let _permit = self.permits.acquire().await;
        self.inner.get(key).await
    }

    pub async fn get_range(&self, key: &str, offset: u64, length: u64) -> StoreResult<Vec<u8>> {
        let _permit = self.permits.acquire().await;
        self.inner.get_range(key, offset, length).await
    }

    pub async fn put(&self, key: &str, data: &[u8]) -> StoreResult<(String, u64)> {
        let _permit = self.permits.acquire().await;
        self.inner.put(key, data).await
    }

    pub async fn exists(&self, key: &str) -> StoreResult<bool> {
        let _permit = self.permits.acquire().await;
        self.inner.exists(key).await
    }

    pub async fn delete(&self, key: &str) -> StoreResult<()> {
        let _permit = self.permits.acquire().await;
        self.inner.delete(key).await
    }

    pub async fn list(
        &self,
        prefix: &str,
        delimiter: Option<char>,
        stats: bool,
    ) -> StoreResult<Vec<ListEntry>> {
        let _permit = self.permits.acquire().await;
        self.inner.list(prefix, delimiter, stats).await
    }

    pub async fn get_json(&self, key: &str) -> StoreResult<Value> {
        let result = self.get(key).await?;
        serde_json::from_slice(&result.data)
            .map_err(|err| StoreError::Malformed(format!("bad JSON at {}: {}", key, err)))
    }

    pub async fn put_json(&self, key: &str, value: &Value) -> StoreResult<(String, u64)> {
        let data = serde_json::to_vec(value)
            .map_err(|err| StoreError::Fatal(format!("serialize {}: {}", key, err)))?;
        self.put(key, &data).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    async fn exercise(storage: Storage) {
        // round trip
        let (etag, size) = storage.put("abc/key1", b"hello").await.unwrap();
        assert_eq!(size, 5);
        assert_eq!(etag, content_etag(b"hello"));
        let got = storage.get("abc/key1").await.unwrap();
        assert_eq!(got.data, b"hello");
        assert_eq!(got.etag, etag);

        // range
        let range = storage.get_range("abc/key1", 1, 3).await.unwrap();
        assert_eq!(range, b"ell");

        // exists / delete
        assert!(storage.exists("abc/key1").await.unwrap());
        assert!(!storage.exists("abc/missing").await.unwrap());
        storage.delete("abc/key1").await.unwrap();
        assert!(!storage.exists("abc/key1").await.unwrap());
        match storage.get("abc/key1").await {
            Err(StoreError::NotFound) => {}
            other => panic!("expected NotFound, got {:?}", other.map(|r| r.etag)),
        }

        // json helpers
        let value = json!({"root": "g-1", "owner": "alice"});
        storage.put_json("dom/.domain.json", &value).await.unwrap();
        assert_eq!(storage.get_json("dom/.domain.json").await.unwrap(), value);

        // list
        storage.put("pre/a", b"1").await.unwrap();
        storage.put("pre/b/c", b"2").await.unwrap();
        storage.put("other", b"3").await.unwrap();
        let entries = storage.list("pre/", None, true).await.unwrap();
        let keys: Vec<&str> = entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["pre/a", "pre/b/c"]);
        assert_eq!(entries[0].size, Some(1));
        assert!(entries[0].etag.is_some());

        let entries = storage.list("pre/", Some('/'), false).await.unwrap();
        let keys: Vec<&str> = entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["pre/a", "pre/b/"]);
    }

    #[tokio::test]
    async fn test_memory_store() {
        exercise(Storage::new(Arc::new(MemoryStore::new()), 4)).await;
    }

    #[tokio::test]
    async fn test_posix_store() {
        let dir = tempfile::tempdir().unwrap();
        exercise(Storage::new(Arc::new(PosixStore::new(dir.path().join("bucket"))), 4)).await;
    }
}
