use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::caching::{BackingError, CacheKey};
use crate::clock::Timestamp;

use super::{StoredEntry, SyncBackingStore};

type Entries = HashMap<(Arc<str>, CacheKey), StoredEntry>;

/// An in-memory backing store.
///
/// Clones and [namespaces](Self::namespace) share the same underlying map, which makes it possible
/// to simulate multiple processes sharing one store within a single process.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    namespace: Arc<str>,
    entries: Arc<Mutex<Entries>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            namespace: "".into(),
            entries: Default::default(),
        }
    }

    /// A view of the same map that only sees keys of the namespace `name`.
    pub fn namespace(&self, name: &str) -> Self {
        Self {
            namespace: name.into(),
            entries: Arc::clone(&self.entries),
        }
    }

    /// The number of entries in this namespace, including expired ones.
    pub fn len(&self) -> usize {
        self.lock()
            .keys()
            .filter(|(namespace, _)| *namespace == self.namespace)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn scoped(&self, key: &CacheKey) -> (Arc<str>, CacheKey) {
        (Arc::clone(&self.namespace), key.clone())
    }
}

impl SyncBackingStore for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn get(&self, key: &CacheKey) -> Result<Option<StoredEntry>, BackingError> {
        Ok(self.lock().get(&self.scoped(key)).cloned())
    }

    fn set(
        &self,
        key: &CacheKey,
        entry: StoredEntry,
        _ttl: Option<Duration>,
    ) -> Result<(), BackingError> {
        self.lock().insert(self.scoped(key), entry);
        Ok(())
    }

    fn delete(&self, key: &CacheKey) -> Result<(), BackingError> {
        self.lock().remove(&self.scoped(key));
        Ok(())
    }

    fn keys(&self) -> Result<Vec<CacheKey>, BackingError> {
        let mut keys: Vec<_> = self
            .lock()
            .keys()
            .filter(|(namespace, _)| *namespace == self.namespace)
            .map(|(_, key)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn clear(&self) -> Result<(), BackingError> {
        self.lock()
            .retain(|(namespace, _), _| *namespace != self.namespace);
        Ok(())
    }

    fn expire_keys(&self, now: Timestamp) -> Result<bool, BackingError> {
        self.lock().retain(|(namespace, _), entry| {
            *namespace != self.namespace || !entry.is_expired(now)
        });
        Ok(true)
    }
}
