//! Blob store abstraction used by the quota store.
//!
//! A `BlobStore` is a set of named buckets (one per scope), each mapping
//! string keys to opaque byte values. The byte length of a value is its
//! size for accounting purposes. Implementations may be asynchronous and
//! fallible; the quota store serializes writes per scope on top of them.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

/// Storage for one scope.
#[async_trait]
pub trait Bucket: Send + Sync {
    /// Value stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Store `value` under `key`, replacing any previous value.
    async fn put(&self, key: &str, value: Bytes) -> Result<()>;

    /// Remove `key`. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;
}

/// Named collection of buckets.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Open (creating if needed) the bucket for `scope`.
    async fn open(&self, scope: &str) -> Result<Arc<dyn Bucket>>;
}

/// In-memory bucket.
#[derive(Debug, Default)]
pub struct MemoryBucket {
    entries: RwLock<HashMap<String, Bytes>>,
}

impl MemoryBucket {
    /// Number of stored keys.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the bucket is empty.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl Bucket for MemoryBucket {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// In-memory blob store. Clones share the same buckets.
#[derive(Debug, Default, Clone)]
pub struct MemoryBlobStore {
    buckets: Arc<RwLock<HashMap<String, Arc<MemoryBucket>>>>,
}

impl MemoryBlobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The bucket for `scope`, if it has been opened.
    pub async fn bucket(&self, scope: &str) -> Option<Arc<MemoryBucket>> {
        self.buckets.read().await.get(scope).cloned()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn open(&self, scope: &str) -> Result<Arc<dyn Bucket>> {
        if let Some(bucket) = self.buckets.read().await.get(scope) {
            return Ok(Arc::clone(bucket) as Arc<dyn Bucket>);
        }
        let mut buckets = self.buckets.write().await;
        let bucket = buckets.entry(scope.to_string()).or_default();
        Ok(Arc::clone(bucket) as Arc<dyn Bucket>)
    }
}
