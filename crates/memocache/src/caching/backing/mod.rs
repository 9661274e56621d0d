//! The shared cache tier.
//!
//! A backing store is reachable by every process that memoizes the same producers, and turns a
//! per-process cache into a cluster-wide one. Stores only need to implement a small map contract,
//! either asynchronously ([`BackingStore`]) or synchronously ([`SyncBackingStore`], adapted via
//! [`SyncBacking`]). Values cross process boundaries as JSON.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;

use super::{BackingError, CacheEntry, CacheKey};

mod fs;
mod memory;

pub use fs::FilesystemBackend;
pub use memory::MemoryBackend;

/// A cache entry as held by a backing store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub value: serde_json::Value,
    pub expires: Option<Timestamp>,
}

impl StoredEntry {
    pub fn encode<V: Serialize>(entry: &CacheEntry<V>) -> Result<Self, BackingError> {
        Ok(Self {
            value: serde_json::to_value(&entry.value).map_err(BackingError::Encode)?,
            expires: entry.expires,
        })
    }

    pub fn decode<V: DeserializeOwned>(self) -> Result<CacheEntry<V>, BackingError> {
        let value = serde_json::from_value(self.value).map_err(BackingError::Decode)?;
        Ok(CacheEntry::new(value, self.expires))
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }
}

/// An asynchronous key-value store shared between processes.
///
/// `ttl` is passed along for stores that manage expiry natively; the stored entry carries its
/// own expiry either way.
#[async_trait]
pub trait BackingStore: Send + Sync + fmt::Debug {
    /// A human-readable name used in logs and traces.
    fn name(&self) -> &str;

    async fn get(&self, key: &CacheKey) -> Result<Option<StoredEntry>, BackingError>;

    async fn set(
        &self,
        key: &CacheKey,
        entry: StoredEntry,
        ttl: Option<Duration>,
    ) -> Result<(), BackingError>;

    async fn delete(&self, key: &CacheKey) -> Result<(), BackingError>;

    async fn keys(&self) -> Result<Vec<CacheKey>, BackingError>;

    async fn clear(&self) -> Result<(), BackingError> {
        for key in self.keys().await? {
            self.delete(&key).await?;
        }
        Ok(())
    }

    async fn has(&self, key: &CacheKey) -> Result<bool, BackingError> {
        let entry = self.get(key).await?;
        Ok(entry.is_some_and(|entry| !entry.is_expired(Timestamp::now())))
    }

    /// Removes all entries expired at `now`.
    ///
    /// Returns `false` if the store does not support bulk expiry, in which case the caller falls
    /// back to enumerating and checking keys itself.
    async fn expire_keys(&self, _now: Timestamp) -> Result<bool, BackingError> {
        Ok(false)
    }
}

/// The synchronous flavor of [`BackingStore`].
pub trait SyncBackingStore: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn get(&self, key: &CacheKey) -> Result<Option<StoredEntry>, BackingError>;

    fn set(
        &self,
        key: &CacheKey,
        entry: StoredEntry,
        ttl: Option<Duration>,
    ) -> Result<(), BackingError>;

    fn delete(&self, key: &CacheKey) -> Result<(), BackingError>;

    fn keys(&self) -> Result<Vec<CacheKey>, BackingError>;

    fn clear(&self) -> Result<(), BackingError> {
        for key in self.keys()? {
            self.delete(&key)?;
        }
        Ok(())
    }

    fn has(&self, key: &CacheKey) -> Result<bool, BackingError> {
        let entry = self.get(key)?;
        Ok(entry.is_some_and(|entry| !entry.is_expired(Timestamp::now())))
    }

    fn expire_keys(&self, _now: Timestamp) -> Result<bool, BackingError> {
        Ok(false)
    }
}

/// Adapts a [`SyncBackingStore`] to the asynchronous contract.
///
/// Calls run inline on the calling task, so the wrapped store should not block for long.
#[derive(Debug, Clone)]
pub struct SyncBacking<S>(pub S);

#[async_trait]
impl<S: SyncBackingStore> BackingStore for SyncBacking<S> {
    fn name(&self) -> &str {
        self.0.name()
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<StoredEntry>, BackingError> {
        self.0.get(key)
    }

    async fn set(
        &self,
        key: &CacheKey,
        entry: StoredEntry,
        ttl: Option<Duration>,
    ) -> Result<(), BackingError> {
        self.0.set(key, entry, ttl)
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), BackingError> {
        self.0.delete(key)
    }

    async fn keys(&self) -> Result<Vec<CacheKey>, BackingError> {
        self.0.keys()
    }

    async fn clear(&self) -> Result<(), BackingError> {
        self.0.clear()
    }

    async fn has(&self, key: &CacheKey) -> Result<bool, BackingError> {
        self.0.has(key)
    }

    async fn expire_keys(&self, now: Timestamp) -> Result<bool, BackingError> {
        self.0.expire_keys(now)
    }
}

/// Creates the backing store for the cache with the given name.
///
/// Returning `None` runs that cache in single-process mode.
pub type BackingFactory = Arc<dyn Fn(&str) -> Option<Arc<dyn BackingStore>> + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesystemBackendConfig {
    /// The directory shared by all processes.
    pub path: PathBuf,
}

/// The backing store to use.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackingConfig {
    /// A store private to this process, shared by all its memoizers.
    Memory,
    /// A directory of JSON records.
    Filesystem(FilesystemBackendConfig),
}

impl BackingConfig {
    /// Builds a factory handing out one namespaced store per cache.
    pub fn factory(&self) -> anyhow::Result<BackingFactory> {
        match self {
            Self::Memory => {
                let root = MemoryBackend::new();
                Ok(Arc::new(move |name: &str| {
                    let store: Arc<dyn BackingStore> = Arc::new(SyncBacking(root.namespace(name)));
                    Some(store)
                }))
            }
            Self::Filesystem(config) => {
                std::fs::create_dir_all(&config.path).with_context(|| {
                    format!("failed to create cache directory {}", config.path.display())
                })?;
                let path = config.path.clone();
                Ok(Arc::new(move |name: &str| {
                    let store: Arc<dyn BackingStore> =
                        Arc::new(FilesystemBackend::new(&path, name));
                    Some(store)
                }))
            }
        }
    }
}
