//! Shared storage trait abstraction.

use crate::storage::error::StorageError;
use crate::storage::serializer::JsonSerializer;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// TTL-aware key/value store shared by every request handler.
///
/// This is the only channel through which otherwise isolated handlers
/// exchange state. Implementations must evaluate expiry at read time: a
/// `get` issued after an entry's TTL has elapsed returns `Ok(None)` whether
/// or not anything physically removed the entry. There is no background
/// expiry process.
///
/// No atomicity is promised across a `get` followed by a `set` from
/// different callers; the last write wins.
#[async_trait]
pub trait SharedStorage: Send + Sync + fmt::Debug {
    /// Read the value stored under `key`.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(value))`: a live entry exists
    /// - `Ok(None)`: the key was never written, was deleted, or has expired
    /// - `Err(StorageError)`: the backend could not be read
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;

    /// Write `value` under `key`, replacing any previous entry.
    ///
    /// `ttl` of `None` stores the entry without expiry.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), StorageError>;

    /// Remove `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Physically remove every expired entry, returning how many were dropped.
    ///
    /// Administrative entry point for deployments that care about bounded
    /// storage growth; reads never depend on it having run.
    async fn purge_expired(&self) -> Result<usize, StorageError>;
}

/// Typed helpers over any [`SharedStorage`].
#[async_trait]
pub trait StorageExt: SharedStorage {
    /// Read and decode a typed record.
    async fn get_json<T>(&self, key: &str) -> Result<Option<T>, StorageError>
    where
        T: DeserializeOwned + Send,
    {
        match self.get(key).await? {
            Some(value) => JsonSerializer::new().from_value(key, value).map(Some),
            None => Ok(None),
        }
    }

    /// Encode and write a typed record.
    async fn set_json<T>(
        &self,
        key: &str,
        record: &T,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let value = JsonSerializer::new().to_value(record)?;
        self.set(key, value, ttl).await
    }
}

impl<S: SharedStorage + ?Sized> StorageExt for S {}
