//! File-backed storage shared between processes.
//!
//! Each key lives in its own JSON file under a root directory. Writes go to a
//! temporary sibling first and are renamed into place, so a concurrent reader
//! sees either the old entry or the new one, never a torn file. Concurrent
//! writers race and the last rename wins.

use crate::storage::entry::StorageEntry;
use crate::storage::error::StorageError;
use crate::storage::serializer::JsonSerializer;
use crate::storage::traits::SharedStorage;
use crate::time::{Clock, SystemClock};
use async_trait::async_trait;
use serde_json::Value;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const ENTRY_SUFFIX: &str = ".json";

/// Store whose entries are files in a directory visible to every worker.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
    clock: Arc<dyn Clock>,
    serializer: JsonSerializer,
}

impl FileStorage {
    /// Open (creating if needed) a store rooted at `root`, using the system clock.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        Self::open_with_clock(root, Arc::new(SystemClock)).await
    }

    /// Open a store rooted at `root` evaluating expiry against `clock`.
    pub async fn open_with_clock(
        root: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StorageError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        tracing::debug!(root = %root.display(), "opened file storage");
        Ok(Self {
            root,
            clock,
            serializer: JsonSerializer::new(),
        })
    }

    /// Directory holding the entry files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}{}", file_stem(key), ENTRY_SUFFIX))
    }

    async fn read_entry(
        &self,
        key: &str,
        path: &Path,
    ) -> Result<Option<StorageEntry>, StorageError> {
        match tokio::fs::read(path).await {
            Ok(data) => self.serializer.decode_entry(key, &data).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Map a key onto a file stem that is safe on every filesystem.
///
/// Plain keys are kept readable; anything else is hex encoded so distinct
/// keys can never collide.
pub(crate) fn file_stem(key: &str) -> String {
    let plain = !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if plain {
        key.to_string()
    } else {
        let hex: String = key.bytes().map(|b| format!("{:02x}", b)).collect();
        format!("x-{}", hex)
    }
}

/// Write `data` to `tmp`, then rename it over `path`. The temp file is
/// removed if either step fails.
async fn replace_via(tmp: &Path, path: &Path, data: &[u8]) -> io::Result<()> {
    let result = match tokio::fs::write(tmp, data).await {
        Ok(()) => tokio::fs::rename(tmp, path).await,
        Err(e) => Err(e),
    };
    if result.is_err() {
        let _ = tokio::fs::remove_file(tmp).await;
    }
    result
}

async fn remove_if_present(path: &Path) -> Result<(), StorageError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl SharedStorage for FileStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let path = self.entry_path(key);
        let Some(entry) = self.read_entry(key, &path).await? else {
            return Ok(None);
        };
        let now = self.clock.now();
        if !entry.is_expired_at(now) {
            return Ok(Some(entry.value));
        }

        // Re-check before removing so a fresh write from another process
        // landing in between is not thrown away. The window is narrowed, not
        // closed; last writer wins.
        if let Ok(Some(current)) = self.read_entry(key, &path).await {
            if current.is_expired_at(now) {
                remove_if_present(&path).await?;
            }
        }
        Ok(None)
    }

    async fn set(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        let entry = StorageEntry::new(key, value, ttl, self.clock.now());
        let data = self.serializer.encode_entry(&entry)?;

        let path = self.entry_path(key);
        let tmp = self.root.join(format!(
            ".{}.{}-{:016x}.tmp",
            file_stem(key),
            std::process::id(),
            rand::random::<u64>()
        ));
        replace_via(&tmp, &path, &data).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        remove_if_present(&self.entry_path(key)).await
    }

    async fn purge_expired(&self) -> Result<usize, StorageError> {
        let now = self.clock.now();
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        let mut purged = 0;

        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            let is_entry = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(ENTRY_SUFFIX) && !name.starts_with('.'));
            if !is_entry {
                continue;
            }

            let label = path.display().to_string();
            match self.read_entry(&label, &path).await {
                Ok(Some(entry)) if entry.is_expired_at(now) => {
                    remove_if_present(&path).await?;
                    purged += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(
                        path = %label,
                        error = %e,
                        "skipping unreadable entry during purge"
                    );
                }
            }
        }

        tracing::debug!(purged, "purged expired entries");
        Ok(purged)
    }
}
