//! In-memory shared store and distributed lock.
//!
//! One `MockStore` can be cloned and handed out as both
//! `Arc<dyn SharedStore>` and `Arc<dyn DistributedLock>`; clones share state.
//!
//! # Example
//!
//! ```rust,ignore
//! let store = MockStore::new().with_value("lastUsedStreamId", "41");
//! store.fail_key("relay:instances");
//! ```

use async_trait::async_trait;
use relay_orchestrator::errors::OrchestratorError;
use relay_orchestrator::store::{DistributedLock, LockHandle, SharedStore};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Acquisition attempts before a held lock is reported busy.
const LOCK_ATTEMPTS: usize = 500;

#[derive(Debug, Clone, Default)]
pub struct MockStore {
    inner: Arc<Mutex<MockStoreInner>>,
}

#[derive(Debug, Default)]
struct MockStoreInner {
    kv: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, String>>,
    /// lock name -> token of the holder
    locks: HashMap<String, String>,
    failing_keys: HashSet<String>,
    lock_failing: bool,
    acquisitions: usize,
    releases: usize,
}

impl MockStoreInner {
    fn check(&self, key: &str) -> Result<(), OrchestratorError> {
        if self.failing_keys.contains(key) {
            return Err(OrchestratorError::Store(format!("injected failure on {key}")));
        }
        Ok(())
    }
}

impl MockStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_value(self, key: &str, value: &str) -> Self {
        self.put(key, value);
        self
    }

    #[must_use]
    pub fn with_hash_field(self, hash: &str, field: &str, value: &str) -> Self {
        self.inner
            .lock()
            .unwrap()
            .hashes
            .entry(hash.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        self
    }

    pub fn shared(&self) -> Arc<dyn SharedStore> {
        Arc::new(self.clone())
    }

    pub fn lock(&self) -> Arc<dyn DistributedLock> {
        Arc::new(self.clone())
    }

    /// Write a raw value, bypassing failure injection.
    pub fn put(&self, key: &str, value: &str) {
        self.inner
            .lock()
            .unwrap()
            .kv
            .insert(key.to_string(), value.to_string());
    }

    /// Read a raw value, bypassing failure injection.
    pub fn value(&self, key: &str) -> Option<String> {
        self.inner.lock().unwrap().kv.get(key).cloned()
    }

    pub fn hash(&self, hash: &str) -> HashMap<String, String> {
        self.inner
            .lock()
            .unwrap()
            .hashes
            .get(hash)
            .cloned()
            .unwrap_or_default()
    }

    /// Every operation touching `key` (plain key or hash name) fails.
    pub fn fail_key(&self, key: &str) {
        self.inner
            .lock()
            .unwrap()
            .failing_keys
            .insert(key.to_string());
    }

    pub fn heal_key(&self, key: &str) {
        self.inner.lock().unwrap().failing_keys.remove(key);
    }

    /// Lock acquisition fails as if retries were exhausted.
    pub fn fail_locks(&self, failing: bool) {
        self.inner.lock().unwrap().lock_failing = failing;
    }

    pub fn is_locked(&self, name: &str) -> bool {
        self.inner.lock().unwrap().locks.contains_key(name)
    }

    pub fn lock_acquisitions(&self) -> usize {
        self.inner.lock().unwrap().acquisitions
    }

    pub fn lock_releases(&self) -> usize {
        self.inner.lock().unwrap().releases
    }
}

#[async_trait]
impl SharedStore for MockStore {
    async fn get(&self, key: &str) -> Result<Option<String>, OrchestratorError> {
        let inner = self.inner.lock().unwrap();
        inner.check(key)?;
        Ok(inner.kv.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), OrchestratorError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check(key)?;
        inner.kv.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), OrchestratorError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check(key)?;
        inner.kv.remove(key);
        inner.hashes.remove(key);
        Ok(())
    }

    async fn hget(&self, hash: &str, field: &str) -> Result<Option<String>, OrchestratorError> {
        let inner = self.inner.lock().unwrap();
        inner.check(hash)?;
        Ok(inner.hashes.get(hash).and_then(|h| h.get(field)).cloned())
    }

    async fn hset(&self, hash: &str, field: &str, value: &str) -> Result<(), OrchestratorError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check(hash)?;
        inner
            .hashes
            .entry(hash.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hdel(&self, hash: &str, field: &str) -> Result<(), OrchestratorError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check(hash)?;
        if let Some(h) = inner.hashes.get_mut(hash) {
            h.remove(field);
        }
        Ok(())
    }

    async fn hgetall(&self, hash: &str) -> Result<HashMap<String, String>, OrchestratorError> {
        let inner = self.inner.lock().unwrap();
        inner.check(hash)?;
        Ok(inner.hashes.get(hash).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl DistributedLock for MockStore {
    /// Retries every millisecond while the lock is held, like the Redis
    /// store's retry policy but without jitter.
    async fn acquire(&self, name: &str, _ttl: Duration) -> Result<LockHandle, OrchestratorError> {
        for _ in 0..LOCK_ATTEMPTS {
            {
                let mut inner = self.inner.lock().unwrap();
                if inner.lock_failing {
                    return Err(OrchestratorError::Store(format!("lock {name} unavailable")));
                }
                if !inner.locks.contains_key(name) {
                    let token = uuid::Uuid::new_v4().to_string();
                    inner.locks.insert(name.to_string(), token.clone());
                    inner.acquisitions += 1;
                    return Ok(LockHandle {
                        name: name.to_string(),
                        token,
                    });
                }
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        Err(OrchestratorError::Store(format!("lock {name} is busy")))
    }

    async fn release(&self, handle: &LockHandle) -> Result<(), OrchestratorError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.locks.get(&handle.name) == Some(&handle.token) {
            inner.locks.remove(&handle.name);
            inner.releases += 1;
        }
        Ok(())
    }
}
