use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

use crate::caching::{BackingError, CacheKey};
use crate::clock::Timestamp;

use super::{BackingStore, StoredEntry};

/// What is written to disk for each key.
#[derive(Debug, Serialize, Deserialize)]
struct Record {
    key: CacheKey,
    entry: StoredEntry,
}

/// Escapes characters that are unsafe in a directory name as `%xx`.
///
/// `%` is escaped as well, so distinct names never share a directory.
fn safe_path_segment(s: &str) -> String {
    let mut segment = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '.' | '/' | '\\' | ':' | '%' => {
                let _ = write!(segment, "%{:02x}", c as u32);
            }
            c => segment.push(c),
        }
    }
    segment
}

fn catch_not_found<T>(result: io::Result<T>) -> io::Result<Option<T>> {
    match result {
        Ok(x) => Ok(Some(x)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// A backing store keeping one JSON record per key in a directory.
///
/// Multiple processes may share the directory, records are replaced atomically.
#[derive(Debug, Clone)]
pub struct FilesystemBackend {
    name: String,
    root: PathBuf,
}

impl FilesystemBackend {
    /// Creates a store for the cache `name` below `base`.
    pub fn new(base: &Path, name: &str) -> Self {
        Self {
            name: format!("filesystem({})", base.display()),
            root: base.join(safe_path_segment(name)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.cache_path())
    }

    async fn read_record(path: &Path) -> Result<Option<Record>, BackingError> {
        let Some(data) = catch_not_found(fs::read(path).await)? else {
            return Ok(None);
        };
        let record = serde_json::from_slice(&data).map_err(BackingError::Decode)?;
        Ok(Some(record))
    }

    /// Lists all record files, which live two directories below the root.
    async fn record_paths(&self) -> io::Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        let mut dirs = vec![(self.root.clone(), 0)];
        while let Some((dir, depth)) = dirs.pop() {
            let Some(mut entries) = catch_not_found(fs::read_dir(&dir).await)? else {
                continue;
            };
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_name() == ".tmp" {
                    continue;
                }
                let file_type = entry.file_type().await?;
                if depth < 2 && file_type.is_dir() {
                    dirs.push((entry.path(), depth + 1));
                } else if depth == 2 && file_type.is_file() {
                    paths.push(entry.path());
                }
            }
        }
        Ok(paths)
    }
}

#[async_trait]
impl BackingStore for FilesystemBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<StoredEntry>, BackingError> {
        let path = self.path(key);
        tracing::trace!("Reading cache record from {}", path.display());
        let record = Self::read_record(&path).await?;
        // Guard against the (unlikely) case of two keys sharing a path.
        Ok(record
            .filter(|record| record.key == *key)
            .map(|record| record.entry))
    }

    async fn set(
        &self,
        key: &CacheKey,
        entry: StoredEntry,
        _ttl: Option<Duration>,
    ) -> Result<(), BackingError> {
        let path = self.path(key);
        let parent_dir = path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("cache record has no parent directory"))?;
        fs::create_dir_all(parent_dir).await?;

        let temp_dir = self.root.join(".tmp");
        fs::create_dir_all(&temp_dir).await?;

        let record = Record {
            key: key.clone(),
            entry,
        };
        let data = serde_json::to_vec(&record).map_err(BackingError::Encode)?;

        let temp_file = NamedTempFile::new_in(&temp_dir)?;
        let mut dest = File::from_std(temp_file.reopen()?);
        dest.write_all(&data).await?;
        dest.flush().await?;

        temp_file.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), BackingError> {
        catch_not_found(fs::remove_file(self.path(key)).await)?;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<CacheKey>, BackingError> {
        let mut keys = Vec::new();
        for path in self.record_paths().await? {
            // Records may disappear or be half-visible while other processes work on them.
            match Self::read_record(&path).await {
                Ok(Some(record)) => keys.push(record.key),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        error = &e as &dyn std::error::Error,
                        path = %path.display(),
                        "Skipping unreadable cache record",
                    );
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn clear(&self) -> Result<(), BackingError> {
        catch_not_found(fs::remove_dir_all(&self.root).await)?;
        Ok(())
    }

    async fn expire_keys(&self, now: Timestamp) -> Result<bool, BackingError> {
        for path in self.record_paths().await? {
            let expired = match Self::read_record(&path).await {
                Ok(Some(record)) => record.entry.is_expired(now),
                Ok(None) => false,
                // Corrupt records can never be read back.
                Err(BackingError::Decode(_)) => true,
                Err(e) => return Err(e),
            };
            if expired {
                catch_not_found(fs::remove_file(&path).await)?;
            }
        }
        Ok(true)
    }
}
