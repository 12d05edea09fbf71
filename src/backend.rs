//! Shared state backend contract
//!
//! The synchronizer only needs four primitives from whatever key-value store
//! coordinates participants: plain reads, plain writes without expiry, an
//! atomic counter and a batched read. Redis, Memcached or a database table
//! can all provide them; `InMemoryBackend` does so for tests and for
//! participants living in one process.

use crate::error::{CacheError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Key-value store shared by every participant
#[async_trait]
pub trait SharedStateBackend: Send + Sync {
    /// Read a value, `None` when absent
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Write a value with no expiry
    async fn set(&self, key: &str, value: Value) -> Result<()>;

    /// Atomically increment an integer counter and return the new value
    ///
    /// A missing key counts from 0, so the first increment returns 1.
    async fn increment(&self, key: &str) -> Result<i64>;

    /// Read several keys at once; every requested key appears in the result
    async fn many(&self, keys: &[String]) -> Result<HashMap<String, Option<Value>>>;
}

/// Builds the backend keys used by the protocol under one prefix
#[derive(Debug, Clone)]
pub struct StateKeys {
    prefix: String,
}

impl StateKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Key holding the current global base
    pub fn base(&self) -> String {
        format!("{}state_base", self.prefix)
    }

    /// Key holding the version counter of `base`
    pub fn version(&self, base: &str) -> String {
        format!("{}state_{}_version", self.prefix, base)
    }

    /// Key holding the modification log of `base` at `version`
    pub fn log(&self, base: &str, version: u64) -> String {
        format!("{}state_{}_{}_log", self.prefix, base, version)
    }
}

/// Process-local backend backed by a map
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    entries: RwLock<HashMap<String, Value>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop a key, simulating eviction or data loss on the backend
    pub async fn remove(&self, key: &str) -> Option<Value> {
        self.entries.write().await.remove(key)
    }

    /// Drop every key
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl SharedStateBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn increment(&self, key: &str) -> Result<i64> {
        let mut entries = self.entries.write().await;
        let current = match entries.get(key) {
            None => 0,
            Some(value) => value.as_i64().ok_or_else(|| {
                CacheError::BackendError(format!("value at {} is not an integer", key))
            })?,
        };

        let next = current + 1;
        entries.insert(key.to_string(), Value::from(next));
        Ok(next)
    }

    async fn many(&self, keys: &[String]) -> Result<HashMap<String, Option<Value>>> {
        let entries = self.entries.read().await;
        Ok(keys
            .iter()
            .map(|key| (key.clone(), entries.get(key).cloned()))
            .collect())
    }
}
