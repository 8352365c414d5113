use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::errors::{NamespaceError, NamespaceResult};

/// Backend holding the remotely managed configuration values.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Refreshes the local copy unless the cached one is younger than `expiration`.
    async fn fetch(&self, expiration: Duration) -> NamespaceResult<()>;

    /// Makes the last fetched values the active ones.
    async fn activate(&self) -> NamespaceResult<()>;

    fn all_keys(&self) -> Vec<String>;

    /// Raw bytes of an active value.
    fn value(&self, key: &str) -> Option<Vec<u8>>;
}

/// Programmable [`RemoteSource`] for tests and local development.
#[derive(Debug, Default)]
pub struct InMemoryRemote {
    staged: Mutex<BTreeMap<String, Value>>,
    active: Mutex<BTreeMap<String, Value>>,
    fetches: AtomicUsize,
    failures: AtomicU32,
    last_expiration: Mutex<Option<Duration>>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, key: impl Into<String>, value: Value) -> Self {
        self.staged.lock().insert(key.into(), value);
        self
    }

    /// Stages a value; it becomes visible after the next fetch and activate.
    pub fn insert(&self, key: impl Into<String>, value: Value) {
        self.staged.lock().insert(key.into(), value);
    }

    pub fn remove(&self, key: &str) {
        self.staged.lock().remove(key);
    }

    /// Makes the next `count` fetches fail.
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn last_expiration(&self) -> Option<Duration> {
        *self.last_expiration.lock()
    }
}

#[async_trait]
impl RemoteSource for InMemoryRemote {
    async fn fetch(&self, expiration: Duration) -> NamespaceResult<()> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        *self.last_expiration.lock() = Some(expiration);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(NamespaceError::Remote("Remote fetch failed".to_string()));
        }
        Ok(())
    }

    async fn activate(&self) -> NamespaceResult<()> {
        let staged = self.staged.lock().clone();
        *self.active.lock() = staged;
        Ok(())
    }

    fn all_keys(&self) -> Vec<String> {
        self.active.lock().keys().cloned().collect()
    }

    fn value(&self, key: &str) -> Option<Vec<u8>> {
        let active = self.active.lock();
        let value = active.get(key)?;
        match value {
            Value::String(raw) => Some(raw.as_bytes().to_vec()),
            other => serde_json::to_vec(other).ok(),
        }
    }
}
