//! The in-process cache tier.

use std::fmt;
use std::sync::Arc;

use super::{CacheKey, LocalSlot};

/// A synchronous key to slot map owned by one [`Cacher`](super::Cacher).
///
/// The cacher serializes its check-and-reserve sequences itself, implementations only need to be
/// safe to call from multiple threads.
pub trait LocalStore<V, E>: Send + Sync {
    fn get(&self, key: &CacheKey) -> Option<LocalSlot<V, E>>;

    fn insert(&self, key: CacheKey, slot: LocalSlot<V, E>);

    fn remove(&self, key: &CacheKey) -> Option<LocalSlot<V, E>>;

    fn clear(&self);

    fn keys(&self) -> Vec<CacheKey>;
}

/// Creates the local store for the cache with the given name.
pub type LocalStoreFactory<V, E> = Arc<dyn Fn(&str) -> Box<dyn LocalStore<V, E>> + Send + Sync>;

/// The default [`LocalStore`], an in-memory moka cache bounded by entry count.
///
/// Expiry is not delegated to moka, entries are evicted by the cacher and the sweeper. When the
/// capacity is exceeded moka evicts entries on its own, which can also drop a pending computation.
/// Callers waiting on it still receive its result, but a concurrent caller may start a second
/// computation for the same key.
pub struct MemoryStore<V, E> {
    cache: moka::sync::Cache<CacheKey, LocalSlot<V, E>>,
}

impl<V, E> MemoryStore<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(name: &str, capacity: u64) -> Self {
        let cache = moka::sync::Cache::builder()
            .max_capacity(capacity)
            .name(name)
            .build();
        Self { cache }
    }
}

impl<V, E> fmt::Debug for MemoryStore<V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("name", &self.cache.name())
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}

impl<V, E> LocalStore<V, E> for MemoryStore<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn get(&self, key: &CacheKey) -> Option<LocalSlot<V, E>> {
        self.cache.get(key)
    }

    fn insert(&self, key: CacheKey, slot: LocalSlot<V, E>) {
        self.cache.insert(key, slot)
    }

    fn remove(&self, key: &CacheKey) -> Option<LocalSlot<V, E>> {
        self.cache.remove(key)
    }

    fn clear(&self) {
        // `invalidate_all` is applied lazily, keys would keep showing up until maintenance runs.
        for (key, _) in self.cache.iter() {
            self.cache.invalidate(&*key);
        }
    }

    fn keys(&self) -> Vec<CacheKey> {
        self.cache.iter().map(|(key, _)| CacheKey::clone(&key)).collect()
    }
}
