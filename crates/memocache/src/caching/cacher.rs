use std::collections::HashSet;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;

use crate::clock::Timestamp;
use crate::policy::Ttl;

use super::backing::{BackingStore, StoredEntry};
use super::local::{LocalStore, MemoryStore};
use super::sweeper::Expire;
use super::{BackingError, CacheEntry, CacheKey, LocalSlot, MemoError, Placeholder, Settled};

/// Values that can be cached locally and shared through a backing store.
pub trait CacheValue: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> CacheValue for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Timeouts of a [`Cacher`].
#[derive(Clone, Copy, Debug)]
pub struct CacherOptions {
    /// How long a pending computation may stay unresolved before waiters give up on it.
    pub async_timeout: Duration,
    /// How long to wait for any single backing store operation.
    pub backing_timeout: Duration,
}

impl Default for CacherOptions {
    fn default() -> Self {
        Self {
            async_timeout: Duration::from_secs(60),
            backing_timeout: Duration::from_secs(10),
        }
    }
}

/// Coordinates a local and an optional backing cache tier.
///
/// The local tier doubles as the lock that prevents concurrent computations of the same key:
/// [`lookup`](Self::lookup) atomically either returns what is cached, returns a pending
/// computation to wait on, or installs a new pending placeholder and hands the caller a
/// [`Reservation`] to fill it.
///
/// Within a process at most one placeholder exists per key. Processes sharing a backing store only
/// reduce duplicate work, as two of them can miss the backing store at the same time.
pub struct Cacher<V, E = Infallible> {
    inner: Arc<CacherInner<V, E>>,
}

impl<V, E> Clone for Cacher<V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V, E> fmt::Debug for Cacher<V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cacher")
            .field("name", &self.inner.name)
            .field("backing", &self.inner.backing)
            .field("async_timeout", &self.inner.async_timeout)
            .finish()
    }
}

struct CacherInner<V, E> {
    name: Arc<str>,
    local: Box<dyn LocalStore<V, E>>,
    backing: Option<Arc<dyn BackingStore>>,
    /// Guards every read-then-write sequence on `local`. Never held across an await.
    critical: Mutex<()>,
    next_id: AtomicU64,
    async_timeout: Duration,
    backing_timeout: Duration,
}

/// The outcome of [`Cacher::lookup`].
pub enum Lookup<V, E> {
    /// A live entry was found locally.
    Hit(CacheEntry<V>),
    /// Another caller is computing this key.
    Wait(Waiter<V, E>),
    /// Nothing usable was found locally, the caller now owns the key.
    Miss(Reservation<V, E>),
}

/// A handle to wait on someone else's computation.
pub struct Waiter<V, E> {
    cacher: Cacher<V, E>,
    key: CacheKey,
    placeholder: Placeholder<V, E>,
}

/// Exclusive ownership of a pending key.
///
/// Dropping a reservation without settling it removes its placeholder, and waiters retry.
pub struct Reservation<V, E> {
    cacher: Cacher<V, E>,
    key: CacheKey,
    id: u64,
    sender: Option<oneshot::Sender<Settled<V, E>>>,
    replaced_expired: bool,
}

/// The result of [`Reservation::resolve`].
#[derive(Debug)]
pub struct Resolved<V> {
    pub entry: CacheEntry<V>,
    /// Whether the entry was installed locally.
    ///
    /// This is `false` for results that should not be cached, and for reservations whose key was
    /// cleared or overwritten while the computation was running.
    pub stored: bool,
    /// The outcome of writing the entry to the backing store.
    pub backing: Result<(), BackingError>,
}

impl<V, E> CacherInner<V, E> {
    fn lock(&self) -> MutexGuard<'_, ()> {
        self.critical.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the placeholder `id` of `key` with `slot`, or removes it.
    ///
    /// Returns `false` without touching the cache if the placeholder is gone.
    fn replace_placeholder(&self, key: &CacheKey, id: u64, slot: Option<LocalSlot<V, E>>) -> bool {
        let _guard = self.lock();
        let owned = matches!(self.local.get(key), Some(LocalSlot::Pending(p)) if p.id == id);
        if owned {
            match slot {
                Some(slot) => self.local.insert(key.clone(), slot),
                None => {
                    self.local.remove(key);
                }
            }
        }
        owned
    }

    async fn with_timeout<T>(
        &self,
        future: impl Future<Output = Result<T, BackingError>>,
    ) -> Result<T, BackingError> {
        match tokio::time::timeout(self.backing_timeout, future).await {
            Ok(result) => result,
            Err(_) => Err(BackingError::Timeout(self.backing_timeout)),
        }
    }
}

impl<V, E> CacherInner<V, E>
where
    V: CacheValue,
    E: Clone + Send + Sync + 'static,
{
    async fn write_backing(
        &self,
        key: &CacheKey,
        entry: &CacheEntry<V>,
        ttl: Ttl,
    ) -> Result<(), BackingError> {
        let Some(backing) = &self.backing else {
            return Ok(());
        };
        let stored = StoredEntry::encode(entry)?;
        self.with_timeout(backing.set(key, stored, ttl.duration()))
            .await
    }

    /// Reads a live entry from the backing store, treating all failures as a miss.
    async fn read_backing(&self, key: &CacheKey) -> Option<CacheEntry<V>> {
        let backing = self.backing.as_ref()?;
        let stored = match self.with_timeout(backing.get(key)).await {
            Ok(stored) => stored?,
            Err(e) => {
                tracing::warn!(
                    error = &e as &dyn std::error::Error,
                    cache = %self.name,
                    backing = backing.name(),
                    "Failed to read from backing store",
                );
                return None;
            }
        };

        if stored.is_expired(Timestamp::now()) {
            tracing::trace!(cache = %self.name, %key, "Found expired backing entry");
            if let Err(e) = self.with_timeout(backing.delete(key)).await {
                tracing::debug!(
                    error = &e as &dyn std::error::Error,
                    cache = %self.name,
                    "Failed to delete expired backing entry",
                );
            }
            return None;
        }

        match stored.decode() {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(
                    error = &e as &dyn std::error::Error,
                    cache = %self.name,
                    %key,
                    "Ignoring undecodable backing entry",
                );
                None
            }
        }
    }

    async fn expire_entries(&self, now: Timestamp) -> Result<usize, BackingError> {
        let mut expired = 0;
        {
            let _guard = self.lock();
            for key in self.local.keys() {
                let evictable = self
                    .local
                    .get(&key)
                    .is_some_and(|slot| slot.is_evictable(now, self.async_timeout));
                if evictable {
                    self.local.remove(&key);
                    expired += 1;
                }
            }
        }

        let Some(backing) = &self.backing else {
            return Ok(expired);
        };
        if self.with_timeout(backing.expire_keys(now)).await? {
            return Ok(expired);
        }

        // Other processes may be expiring the same keys, so individual failures are expected.
        for key in self.with_timeout(backing.keys()).await? {
            let result = match self.with_timeout(backing.get(&key)).await {
                Ok(Some(stored)) if stored.is_expired(now) => {
                    self.with_timeout(backing.delete(&key)).await.map(|_| 1)
                }
                Ok(_) => Ok(0),
                Err(e) => Err(e),
            };
            match result {
                Ok(n) => expired += n,
                Err(e) => {
                    tracing::warn!(
                        error = &e as &dyn std::error::Error,
                        cache = %self.name,
                        %key,
                        "Failed to expire backing entry",
                    );
                }
            }
        }
        Ok(expired)
    }
}

#[async_trait]
impl<V, E> Expire for CacherInner<V, E>
where
    V: CacheValue,
    E: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn expire_keys(&self, now: Timestamp) -> Result<usize, BackingError> {
        self.expire_entries(now).await
    }
}

impl<V, E> Cacher<V, E>
where
    V: CacheValue,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(
        name: &str,
        local: Box<dyn LocalStore<V, E>>,
        backing: Option<Arc<dyn BackingStore>>,
        options: CacherOptions,
    ) -> Self {
        let inner = CacherInner {
            name: name.into(),
            local,
            backing,
            critical: Mutex::new(()),
            next_id: AtomicU64::new(0),
            async_timeout: options.async_timeout,
            backing_timeout: options.backing_timeout,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// A single-process cacher backed by a bounded [`MemoryStore`].
    pub fn in_memory(name: &str, capacity: u64) -> Self {
        let local = Box::new(MemoryStore::new(name, capacity));
        Self::new(name, local, None, CacherOptions::default())
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn backing(&self) -> Option<&Arc<dyn BackingStore>> {
        self.inner.backing.as_ref()
    }

    /// A weak handle for the [`Sweeper`](super::Sweeper).
    pub fn expiry_handle(&self) -> Weak<dyn Expire> {
        let weak: Weak<CacherInner<V, E>> = Arc::downgrade(&self.inner);
        weak
    }

    /// Looks up `key` in the local tier, reserving it on a miss.
    ///
    /// This never suspends. Expired entries and pending computations older than the async timeout
    /// are evicted on the way.
    pub fn lookup(&self, key: &CacheKey) -> Lookup<V, E> {
        let now = Timestamp::now();
        let inner = &self.inner;
        let _guard = inner.lock();

        let mut replaced_expired = false;
        match inner.local.get(key) {
            Some(LocalSlot::Ready(entry)) if !entry.is_expired(now) => return Lookup::Hit(entry),
            Some(LocalSlot::Pending(placeholder))
                if !placeholder.is_stale(now, inner.async_timeout) =>
            {
                return Lookup::Wait(Waiter {
                    cacher: self.clone(),
                    key: key.clone(),
                    placeholder,
                });
            }
            Some(slot) => {
                replaced_expired = matches!(slot, LocalSlot::Ready(_));
                tracing::trace!(cache = %inner.name, %key, "Evicting stale local entry");
                inner.local.remove(key);
            }
            None => {}
        }

        Lookup::Miss(self.reserve_locked(key, now, replaced_expired))
    }

    /// Unconditionally installs a new placeholder for `key`.
    ///
    /// A computation already running for the key keeps serving its own waiters, but its result
    /// is no longer stored.
    pub fn reserve(&self, key: &CacheKey) -> Reservation<V, E> {
        let _guard = self.inner.lock();
        self.reserve_locked(key, Timestamp::now(), false)
    }

    fn reserve_locked(
        &self,
        key: &CacheKey,
        now: Timestamp,
        replaced_expired: bool,
    ) -> Reservation<V, E> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        let settled = receiver
            .map(|result| result.unwrap_or(Settled::Absent))
            .boxed()
            .shared();
        let placeholder = Placeholder {
            id,
            created: now,
            settled,
        };
        self.inner
            .local
            .insert(key.clone(), LocalSlot::Pending(placeholder));

        Reservation {
            cacher: self.clone(),
            key: key.clone(),
            id,
            sender: Some(sender),
            replaced_expired,
        }
    }

    /// Returns the cached value for `key`, consulting the backing store on a local miss.
    ///
    /// Waits for a pending computation of the key, and fails with its error if it fails.
    pub async fn get(&self, key: &CacheKey) -> Result<Option<V>, E> {
        match self.lookup(key) {
            Lookup::Hit(entry) => Ok(Some(entry.value)),
            Lookup::Wait(waiter) => match waiter.wait().await {
                Settled::Resolved(entry) => Ok(Some(entry.value)),
                Settled::Failed(e) => Err(e),
                Settled::Absent | Settled::TimedOut => Ok(None),
            },
            Lookup::Miss(reservation) => {
                let entry = reservation.fetch_backing().await;
                Ok(entry.map(|entry| reservation.restore(entry).value))
            }
        }
    }

    /// Stores `value` in both tiers.
    ///
    /// The local write is visible immediately. A [`Ttl::DoNotCache`] deletes the key instead.
    pub async fn set(&self, key: &CacheKey, value: V, ttl: Ttl) -> Result<(), BackingError> {
        if ttl == Ttl::DoNotCache {
            return self.delete(key).await;
        }
        let entry = CacheEntry::new(value, ttl.expires_at(Timestamp::now()));
        {
            let _guard = self.inner.lock();
            self.inner
                .local
                .insert(key.clone(), LocalSlot::Ready(entry.clone()));
        }
        self.inner.write_backing(key, &entry, ttl).await
    }

    /// Installs a pending entry for `key` that settles with the outcome of `future`.
    ///
    /// Concurrent [`get`](Self::get)s wait for the future. A failure is handed to them and the key
    /// is removed.
    pub async fn set_pending<F>(&self, key: &CacheKey, future: F, ttl: Ttl) -> Result<V, MemoError<E>>
    where
        F: Future<Output = Result<V, E>>,
    {
        let reservation = self.reserve(key);
        match future.await {
            Ok(value) => {
                let resolved = reservation.resolve(value, ttl).await;
                resolved.backing?;
                Ok(resolved.entry.value)
            }
            Err(e) => {
                reservation.reject(e.clone());
                Err(MemoError::Producer(e))
            }
        }
    }

    pub async fn delete(&self, key: &CacheKey) -> Result<(), BackingError> {
        {
            let _guard = self.inner.lock();
            self.inner.local.remove(key);
        }
        match &self.inner.backing {
            Some(backing) => self.inner.with_timeout(backing.delete(key)).await,
            None => Ok(()),
        }
    }

    /// Removes every entry from both tiers.
    ///
    /// Computations running concurrently still settle their waiters, but their results are
    /// dropped.
    pub async fn clear(&self) -> Result<(), BackingError> {
        {
            let _guard = self.inner.lock();
            self.inner.local.clear();
        }
        match &self.inner.backing {
            Some(backing) => self.inner.with_timeout(backing.clear()).await,
            None => Ok(()),
        }
    }

    pub async fn has(&self, key: &CacheKey) -> Result<bool, BackingError> {
        if self.peek(key).is_some() {
            return Ok(true);
        }
        match &self.inner.backing {
            Some(backing) => self.inner.with_timeout(backing.has(key)).await,
            None => Ok(false),
        }
    }

    /// All keys of both tiers, without duplicates.
    pub async fn keys(&self) -> Result<Vec<CacheKey>, BackingError> {
        let mut keys = match &self.inner.backing {
            Some(backing) => self.inner.with_timeout(backing.keys()).await?,
            None => Vec::new(),
        };
        let mut seen: HashSet<_> = keys.iter().cloned().collect();
        for key in self.inner.local.keys() {
            if seen.insert(key.clone()) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    /// Returns the live local entry for `key`, without waiting or reserving anything.
    pub fn peek(&self, key: &CacheKey) -> Option<CacheEntry<V>> {
        match self.inner.local.get(key) {
            Some(LocalSlot::Ready(entry)) if !entry.is_expired(Timestamp::now()) => Some(entry),
            _ => None,
        }
    }

    /// The remaining lifetime of the live local entry for `key`.
    pub fn ttl(&self, key: &CacheKey) -> Option<Ttl> {
        let entry = self.peek(key)?;
        Some(match entry.remaining(Timestamp::now()) {
            Some(remaining) => Ttl::Expires(remaining),
            None => Ttl::Forever,
        })
    }

    /// Drops all locally cached values, keeping pending computations.
    ///
    /// Subsequent lookups go through the backing store again.
    pub fn flush_local(&self) {
        let _guard = self.inner.lock();
        for key in self.inner.local.keys() {
            if matches!(self.inner.local.get(&key), Some(LocalSlot::Ready(_))) {
                self.inner.local.remove(&key);
            }
        }
    }

    /// Postpones the expiry of the live entry for `key` to `until`.
    ///
    /// Entries are only ever extended. Entries without expiry are left alone. Returns whether the
    /// entry was extended.
    pub async fn extend(&self, key: &CacheKey, until: Timestamp) -> Result<bool, BackingError> {
        let now = Timestamp::now();
        let extended = {
            let _guard = self.inner.lock();
            match self.inner.local.get(key) {
                Some(LocalSlot::Ready(mut entry))
                    if !entry.is_expired(now) && entry.expires.is_some_and(|e| e < until) =>
                {
                    entry.expires = Some(until);
                    self.inner
                        .local
                        .insert(key.clone(), LocalSlot::Ready(entry.clone()));
                    Some(entry)
                }
                _ => None,
            }
        };
        match extended {
            Some(entry) => {
                let ttl = Ttl::Expires(until.remaining(now));
                self.inner.write_backing(key, &entry, ttl).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Removes all entries expired at `now` from both tiers.
    ///
    /// Returns the number of removed entries, not counting those removed by the backing store's
    /// own bulk expiry.
    pub async fn expire_keys(&self, now: Timestamp) -> Result<usize, BackingError> {
        self.inner.expire_entries(now).await
    }
}

impl<V, E> Waiter<V, E>
where
    V: CacheValue,
    E: Clone + Send + Sync + 'static,
{
    /// Waits for the computation to settle.
    ///
    /// Gives up once the computation is older than the async timeout, evicting it so the next
    /// lookup can start over.
    pub async fn wait(self) -> Settled<V, E> {
        let inner = &self.cacher.inner;
        let deadline = self
            .placeholder
            .created
            .saturating_add(inner.async_timeout);
        let remaining = deadline.remaining(Timestamp::now());

        match tokio::time::timeout(remaining, self.placeholder.settled.clone()).await {
            Ok(settled) => settled,
            Err(_) => {
                if inner.replace_placeholder(&self.key, self.placeholder.id, None) {
                    tracing::debug!(
                        cache = %inner.name,
                        key = %self.key,
                        "Evicted computation pending for more than {:?}",
                        inner.async_timeout,
                    );
                }
                metric!(counter("memo.pending.timeout") += 1, "cache" => &inner.name);
                Settled::TimedOut
            }
        }
    }
}

impl<V, E> Reservation<V, E> {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Whether this reservation replaced an expired local entry.
    pub fn replaced_expired(&self) -> bool {
        self.replaced_expired
    }

    fn settle(&mut self, slot: Option<LocalSlot<V, E>>, settled: Settled<V, E>) -> bool {
        let installed = self.cacher.inner.replace_placeholder(&self.key, self.id, slot);
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(settled);
        }
        installed
    }

    /// Gives up the key without a value. Waiters retry their lookup.
    pub fn release(self) {}
}

impl<V, E> Reservation<V, E>
where
    V: CacheValue,
    E: Clone + Send + Sync + 'static,
{
    /// Looks the key up in the backing store.
    pub async fn fetch_backing(&self) -> Option<CacheEntry<V>> {
        self.cacher.inner.read_backing(&self.key).await
    }

    /// Installs an entry found in the backing store and hands it to waiters.
    pub fn restore(mut self, entry: CacheEntry<V>) -> CacheEntry<V> {
        let slot = LocalSlot::Ready(entry.clone());
        self.settle(Some(slot), Settled::Resolved(entry.clone()));
        entry
    }

    /// Stores a freshly computed value in both tiers and hands it to waiters.
    pub async fn resolve(mut self, value: V, ttl: Ttl) -> Resolved<V> {
        let entry = CacheEntry::new(value, ttl.expires_at(Timestamp::now()));
        let slot = match ttl {
            Ttl::DoNotCache => None,
            _ => Some(LocalSlot::Ready(entry.clone())),
        };
        let cacheable = slot.is_some();
        let owned = self.settle(slot, Settled::Resolved(entry.clone()));

        let stored = owned && cacheable;
        let backing = if stored {
            self.cacher
                .inner
                .write_backing(&self.key, &entry, ttl)
                .await
        } else {
            Ok(())
        };
        Resolved {
            entry,
            stored,
            backing,
        }
    }

    /// Hands a failure to all waiters. Nothing is cached.
    pub fn reject(mut self, error: E) {
        self.settle(None, Settled::Failed(error));
    }
}

impl<V, E> Drop for Reservation<V, E> {
    fn drop(&mut self) {
        if self.sender.is_some() {
            self.cacher
                .inner
                .replace_placeholder(&self.key, self.id, None);
        }
    }
}
