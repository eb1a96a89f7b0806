//! Quota-enforcing permission store.
//!
//! Layers an ACL and a capacity ledger over a [`BlobStore`]:
//!
//! ```text
//! meta bucket                              <scope> bucket
//! ┌───────────────────────────────────┐    ┌──────────────────────┐
//! │ acl:["docs","https://a.example"]  │    │ file   -> 10 bytes   │
//! │     -> {"allowed":true,           │    │ notes  ->  3 bytes   │
//! │         "capacity":100}           │    └──────────────────────┘
//! │ size:"docs" -> 13                 │
//! └───────────────────────────────────┘
//! ```
//!
//! - A `ScopeRecord` per (scope, origin) says whether the origin may use the
//!   scope and how many bytes it was granted. Capacity only ever grows.
//! - The size ledger per scope is the sum of all entry lengths in it.
//! - `set` checks `size - old_len + new_len <= capacity` before touching
//!   anything, then writes the entry and the ledger together.
//!
//! Every mutation of a scope runs under that scope's async mutex, since the
//! blob store may suspend between the capacity check and the write.
//!
//! The `meta` scope holds the bookkeeping above and is rejected as
//! `NotAllowed` for every caller-facing operation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::blob::{BlobStore, Bucket};
use crate::constants::{ACL_KEY_PREFIX, META_SCOPE, SIZE_KEY_PREFIX};
use crate::rpc::RpcError;

/// Permission granted to one origin on one scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeRecord {
    /// Whether the origin may read and write the scope.
    pub allowed: bool,
    /// Maximum total size of the scope, in bytes, for writes by this origin.
    pub capacity: u64,
}

/// Current accounting for a scope as seen by one origin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Bytes currently stored in the scope.
    pub size: u64,
    /// Bytes granted to the origin.
    pub capacity: u64,
}

/// ACL + capacity ledger over a blob store. Clones share state.
#[derive(Clone)]
pub struct QuotaStore {
    blobs: Arc<dyn BlobStore>,
    /// Per-scope write locks, present only while held or awaited.
    locks: Arc<LockTable>,
}

impl std::fmt::Debug for QuotaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaStore").finish_non_exhaustive()
    }
}

fn internal(error: &anyhow::Error) -> RpcError {
    RpcError::Internal(format!("{error:#}"))
}

fn acl_key(scope: &str, origin: &str) -> String {
    format!("{ACL_KEY_PREFIX}:{}", serde_json::json!([scope, origin]))
}

fn size_key(scope: &str) -> String {
    format!("{SIZE_KEY_PREFIX}:{}", serde_json::json!(scope))
}

fn len_of(bytes: &Bytes) -> u64 {
    u64::try_from(bytes.len()).unwrap_or(u64::MAX)
}

/// Rejects the bookkeeping scope.
fn check_scope(scope: &str) -> Result<(), RpcError> {
    if scope == META_SCOPE {
        return Err(RpcError::NotAllowed);
    }
    Ok(())
}

impl QuotaStore {
    /// Create a store over `blobs`.
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            blobs,
            locks: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Whether `origin` already holds permission on `scope`.
    ///
    /// Never prompts; a `false` means the application has to obtain consent
    /// and call [`QuotaStore::allow`].
    pub async fn ask(&self, scope: &str, origin: &str) -> Result<bool, RpcError> {
        check_scope(scope)?;
        Ok(self.record(scope, origin).await?.allowed)
    }

    /// Grant `origin` access to `scope` with at least `capacity` bytes.
    ///
    /// A smaller capacity than previously granted leaves the old one in place.
    pub async fn allow(&self, scope: &str, origin: &str, capacity: u64) -> Result<ScopeRecord, RpcError> {
        check_scope(scope)?;
        let _guard = self.lock_scope(scope).await;

        let old = self.record(scope, origin).await?;
        let new = ScopeRecord {
            allowed: true,
            capacity: old.capacity.max(capacity),
        };
        if new != old {
            let encoded = serde_json::to_vec(&new).map_err(|e| internal(&anyhow::Error::from(e)))?;
            self.meta()
                .await?
                .put(&acl_key(scope, origin), Bytes::from(encoded))
                .await
                .map_err(|e| internal(&e))?;
        }

        log::info!(
            "[Kv] Allowed {origin} on {scope} (capacity {} -> {})",
            old.capacity,
            new.capacity
        );
        Ok(new)
    }

    /// Store `value` under `key` in `scope` on behalf of `origin`.
    ///
    /// Fails with `NotAllowed` without permission and with `TooBig` if the
    /// scope would exceed the origin's capacity; in both cases nothing is
    /// written.
    pub async fn set(&self, scope: &str, origin: &str, key: &str, value: Bytes) -> Result<(), RpcError> {
        check_scope(scope)?;
        // Permission only ever gets granted, so it can be checked before
        // taking the lock; the capacity is re-read under it
        if !self.record(scope, origin).await?.allowed {
            return Err(RpcError::NotAllowed);
        }
        let _guard = self.lock_scope(scope).await;

        let record = self.record(scope, origin).await?;

        let bucket = self.bucket(scope).await?;
        let old_value = bucket.get(key).await.map_err(|e| internal(&e))?;
        let old_len = old_value.as_ref().map_or(0, len_of);
        let old_size = self.size(scope).await?;

        let new_size = old_size.saturating_sub(old_len).saturating_add(len_of(&value));
        if new_size > record.capacity {
            log::debug!(
                "[Kv] Rejecting {origin} write to {scope}/{key}: {new_size} > {}",
                record.capacity
            );
            return Err(RpcError::TooBig);
        }

        bucket.put(key, value).await.map_err(|e| internal(&e))?;

        if let Err(error) = self.put_size(scope, new_size).await {
            // Keep entry and ledger consistent
            let rollback = match old_value {
                Some(old) => bucket.put(key, old).await,
                None => bucket.remove(key).await,
            };
            if let Err(rollback_error) = rollback {
                log::error!("[Kv] Rollback of {scope}/{key} failed: {rollback_error:#}");
            }
            return Err(error);
        }

        Ok(())
    }

    /// Value stored under `key` in `scope`, read on behalf of `origin`.
    ///
    /// An unset key is `Ok(None)`.
    pub async fn get(&self, scope: &str, origin: &str, key: &str) -> Result<Option<Bytes>, RpcError> {
        check_scope(scope)?;
        if !self.record(scope, origin).await?.allowed {
            return Err(RpcError::NotAllowed);
        }
        self.bucket(scope)
            .await?
            .get(key)
            .await
            .map_err(|e| internal(&e))
    }

    /// Current size of `scope` and the capacity granted to `origin`.
    pub async fn usage(&self, scope: &str, origin: &str) -> Result<Usage, RpcError> {
        check_scope(scope)?;
        let record = self.record(scope, origin).await?;
        if !record.allowed {
            return Err(RpcError::NotAllowed);
        }
        Ok(Usage {
            size: self.size(scope).await?,
            capacity: record.capacity,
        })
    }

    /// The ACL record for (scope, origin); default (not allowed, zero
    /// capacity) if none was ever written.
    pub async fn record(&self, scope: &str, origin: &str) -> Result<ScopeRecord, RpcError> {
        let raw = self
            .meta()
            .await?
            .get(&acl_key(scope, origin))
            .await
            .map_err(|e| internal(&e))?;
        match raw {
            Some(raw) => serde_json::from_slice(&raw).map_err(|e| internal(&anyhow::Error::from(e))),
            None => Ok(ScopeRecord::default()),
        }
    }

    async fn size(&self, scope: &str) -> Result<u64, RpcError> {
        let raw = self
            .meta()
            .await?
            .get(&size_key(scope))
            .await
            .map_err(|e| internal(&e))?;
        match raw {
            Some(raw) => serde_json::from_slice(&raw).map_err(|e| internal(&anyhow::Error::from(e))),
            None => Ok(0),
        }
    }

    async fn put_size(&self, scope: &str, size: u64) -> Result<(), RpcError> {
        self.meta()
            .await?
            .put(&size_key(scope), Bytes::from(size.to_string()))
            .await
            .map_err(|e| internal(&e))
    }

    async fn meta(&self) -> Result<Arc<dyn Bucket>, RpcError> {
        self.blobs.open(META_SCOPE).await.map_err(|e| internal(&e))
    }

    async fn bucket(&self, scope: &str) -> Result<Arc<dyn Bucket>, RpcError> {
        self.blobs.open(scope).await.map_err(|e| internal(&e))
    }

    async fn lock_scope(&self, scope: &str) -> ScopeLock {
        let lock = {
            let mut locks = lock_table(&self.locks);
            Arc::clone(locks.entry(scope.to_string()).or_default())
        };
        ScopeLock {
            scope: scope.to_string(),
            locks: Arc::clone(&self.locks),
            guard: Some(lock.lock_owned().await),
        }
    }
}

type LockTable = StdMutex<HashMap<String, Arc<Mutex<()>>>>;

fn lock_table(locks: &LockTable) -> MutexGuard<'_, HashMap<String, Arc<Mutex<()>>>> {
    locks.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Held scope lock. Removes the scope's table entry on drop once nobody
/// else holds or waits for it.
struct ScopeLock {
    scope: String,
    locks: Arc<LockTable>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ScopeLock {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = lock_table(&self.locks);
        // Waiters clone the Arc under the table lock before queueing
        if locks
            .get(&self.scope)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.scope);
        }
    }
}
