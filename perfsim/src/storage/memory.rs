//! In-memory storage implementation for tests and single-process use.

use crate::storage::entry::StorageEntry;
use crate::storage::error::StorageError;
use crate::storage::traits::SharedStorage;
use crate::time::{Clock, SystemClock};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Simple in-memory storage implementation using a HashMap.
///
/// Only visible to handlers inside one process, so it stands in for the
/// shared store in tests and single-process deployments. Expiry is lazy:
/// an expired entry is dropped by the read that notices it.
#[derive(Debug)]
pub struct InMemoryStorage {
    data: Mutex<HashMap<String, StorageEntry>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStorage {
    /// Create a new empty store using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a new empty store evaluating expiry against `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Number of physically present entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Check if the storage holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Clear all stored entries.
    pub fn clear(&self) {
        self.entries().clear();
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, StorageEntry>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStorage for InMemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let now = self.clock.now();
        let mut entries = self.entries();
        match entries.get(key) {
            Some(entry) if entry.is_expired_at(now) => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        let entry = StorageEntry::new(key, value, ttl, self.clock.now());
        self.entries().insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.entries().remove(key);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize, StorageError> {
        let now = self.clock.now();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired_at(now));
        Ok(before - entries.len())
    }
}
