//! Stored entry with an absolute expiry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// One key/value pair held by a [`SharedStorage`](super::SharedStorage)
/// backend.
///
/// Expiry is absolute so that every process reading the entry agrees on when
/// it stops existing, whatever its own start time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageEntry {
    /// Key the entry is stored under.
    pub key: String,
    /// Opaque structured payload.
    pub value: Value,
    /// Absolute expiry, or `None` for entries that never expire.
    pub expires_at: Option<DateTime<Utc>>,
}

impl StorageEntry {
    /// Build an entry written at `now` with an optional time-to-live.
    pub fn new(key: &str, value: Value, ttl: Option<Duration>, now: DateTime<Utc>) -> Self {
        let expires_at = ttl.map(|ttl| {
            let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
            now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
        });
        Self {
            key: key.to_string(),
            value,
            expires_at,
        }
    }

    /// Whether a read at `now` must treat this entry as absent.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }
}
