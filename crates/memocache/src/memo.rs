//! Memoized producers.
//!
//! A [`Memoized`] wraps an asynchronous producer so that calls with the same logical arguments
//! share one result. See [`Memoizer::memoize`](crate::Memoizer::memoize) for creating one.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;

use crate::caching::{
    BackingFactory, CacheEntry, CacheKey, CacheValue, Cacher, LocalStoreFactory, Lookup,
    MemoError, Reservation, Settled,
};
use crate::clock::Timestamp;
use crate::hash::{KeyHasher, KeyValue};
use crate::policy::{PolicyInput, TimePolicy, Ttl};

/// The type-erased producer of a [`Memoized`].
pub type Producer<A, R, E> = Arc<dyn Fn(A) -> BoxFuture<'static, Result<R, E>> + Send + Sync>;

/// Computes a custom key specification from the receiver and arguments of a call.
///
/// Returning `None` marks the call as not cacheable.
pub type KeyFn<A> = Arc<dyn Fn(Option<&KeyValue>, &A) -> Option<KeyValue> + Send + Sync>;

pub(crate) fn erase_producer<A, R, E, F, Fut>(producer: F) -> Producer<A, R, E>
where
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
{
    Arc::new(move |args| producer(args).boxed())
}

/// Options of a memoized producer.
///
/// Unset options fall back to the [`MemoConfig`](crate::config::MemoConfig) of the memoizer.
pub struct MemoOptions<A, R, E> {
    pub ttl: Option<TimePolicy<A, R>>,
    pub mru: Option<TimePolicy<A, R>>,
    pub key: Option<KeyFn<A>>,
    /// Memoizing a producer name again under the same link returns the existing wrapper.
    pub link: Option<String>,
    pub async_timeout: Option<Duration>,
    /// Overrides the backing store of this producer's cache.
    pub create_cache: Option<BackingFactory>,
    pub create_local_cache: Option<LocalStoreFactory<R, E>>,
    pub origin: Option<bool>,
}

impl<A, R, E> Default for MemoOptions<A, R, E> {
    fn default() -> Self {
        Self {
            ttl: None,
            mru: None,
            key: None,
            link: None,
            async_timeout: None,
            create_cache: None,
            create_local_cache: None,
            origin: None,
        }
    }
}

impl<A, R, E> Clone for MemoOptions<A, R, E> {
    fn clone(&self) -> Self {
        Self {
            ttl: self.ttl.clone(),
            mru: self.mru.clone(),
            key: self.key.clone(),
            link: self.link.clone(),
            async_timeout: self.async_timeout,
            create_cache: self.create_cache.clone(),
            create_local_cache: self.create_local_cache.clone(),
            origin: self.origin,
        }
    }
}

impl<A, R, E> fmt::Debug for MemoOptions<A, R, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoOptions")
            .field("ttl", &self.ttl)
            .field("mru", &self.mru)
            .field("key", &self.key.is_some())
            .field("link", &self.link)
            .field("async_timeout", &self.async_timeout)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

impl<A, R, E> MemoOptions<A, R, E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, ttl: impl Into<TimePolicy<A, R>>) -> Self {
        self.ttl = Some(ttl.into());
        self
    }

    pub fn mru(mut self, mru: impl Into<TimePolicy<A, R>>) -> Self {
        self.mru = Some(mru.into());
        self
    }

    pub fn key<F>(mut self, key: F) -> Self
    where
        F: Fn(Option<&KeyValue>, &A) -> Option<KeyValue> + Send + Sync + 'static,
    {
        self.key = Some(Arc::new(key));
        self
    }

    pub fn link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }

    pub fn async_timeout(mut self, timeout: Duration) -> Self {
        self.async_timeout = Some(timeout);
        self
    }

    pub fn create_cache(mut self, factory: BackingFactory) -> Self {
        self.create_cache = Some(factory);
        self
    }

    pub fn create_local_cache(mut self, factory: LocalStoreFactory<R, E>) -> Self {
        self.create_local_cache = Some(factory);
        self
    }

    pub fn origin(mut self, origin: bool) -> Self {
        self.origin = Some(origin);
        self
    }
}

/// Overrides for a single call.
pub struct CallOptions<A, R> {
    /// The value the call is made on, part of the default key.
    pub receiver: Option<KeyValue>,
    pub ttl: Option<TimePolicy<A, R>>,
    pub mru: Option<TimePolicy<A, R>>,
}

impl<A, R> Default for CallOptions<A, R> {
    fn default() -> Self {
        Self {
            receiver: None,
            ttl: None,
            mru: None,
        }
    }
}

impl<A, R> CallOptions<A, R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn receiver(mut self, receiver: impl Into<KeyValue>) -> Self {
        self.receiver = Some(receiver.into());
        self
    }

    pub fn ttl(mut self, ttl: impl Into<TimePolicy<A, R>>) -> Self {
        self.ttl = Some(ttl.into());
        self
    }

    pub fn mru(mut self, mru: impl Into<TimePolicy<A, R>>) -> Self {
        self.mru = Some(mru.into());
        self
    }
}

/// One step in answering a memoized call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    /// The call was not cacheable and ran the producer directly.
    Uncached,
    /// Answered from the local cache.
    Local,
    /// Waited for a computation started by another call.
    Awaited,
    /// Answered from the backing store.
    Backing,
    /// An expired local entry was discarded.
    Expired,
    /// Ran the producer.
    Computed,
    Resolved,
    Rejected,
    /// Gave up waiting on an abandoned computation.
    TimedOut,
    /// Looked the key up again.
    Retry,
    /// The hit entry was extended to the given expiry.
    Mru(Timestamp),
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uncached => f.write_str("uncached"),
            Self::Local => f.write_str("local"),
            Self::Awaited => f.write_str("awaited"),
            Self::Backing => f.write_str("backing"),
            Self::Expired => f.write_str("expired"),
            Self::Computed => f.write_str("computed"),
            Self::Resolved => f.write_str("resolved"),
            Self::Rejected => f.write_str("rejected"),
            Self::TimedOut => f.write_str("timed-out"),
            Self::Retry => f.write_str("retry"),
            Self::Mru(until) => write!(f, "mru({until})"),
        }
    }
}

/// How a memoized call was answered.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Trace {
    /// The derived key, `None` for calls that were not cacheable.
    pub key: Option<CacheKey>,
    pub steps: Vec<Origin>,
}

impl Trace {
    fn push(&mut self, origin: Origin) {
        self.steps.push(origin);
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, step) in self.steps.iter().enumerate() {
            if i > 0 {
                f.write_str(" > ")?;
            }
            write!(f, "{step}")?;
        }
        Ok(())
    }
}

pub(crate) struct MemoShared<A, R, E> {
    pub name: Arc<str>,
    pub producer: Producer<A, R, E>,
    pub cacher: Cacher<R, E>,
    pub hasher: KeyHasher,
    pub local_id: Arc<str>,
}

/// A memoized producer.
///
/// Cloning is cheap, and clones as well as wrappers created by [`options`](Self::options) share
/// one cache.
pub struct Memoized<A, R, E> {
    shared: Arc<MemoShared<A, R, E>>,
    ttl: Option<TimePolicy<A, R>>,
    mru: Option<TimePolicy<A, R>>,
    key: Option<KeyFn<A>>,
    origin: bool,
}

impl<A, R, E> Clone for Memoized<A, R, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            ttl: self.ttl.clone(),
            mru: self.mru.clone(),
            key: self.key.clone(),
            origin: self.origin,
        }
    }
}

impl<A, R, E> fmt::Debug for Memoized<A, R, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memoized")
            .field("name", &self.shared.name)
            .field("ttl", &self.ttl)
            .field("mru", &self.mru)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

impl<A, R, E> Memoized<A, R, E>
where
    A: Clone + Serialize + Send + Sync + 'static,
    R: CacheValue,
    E: Clone + Send + Sync + 'static,
{
    /// Creates a wrapper whose options are already merged with the global defaults.
    pub(crate) fn new(shared: MemoShared<A, R, E>, options: MemoOptions<A, R, E>) -> Self {
        Self {
            shared: Arc::new(shared),
            ttl: options.ttl,
            mru: options.mru,
            key: options.key,
            origin: options.origin.unwrap_or(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The cache shared by all wrappers of this producer.
    pub fn cacher(&self) -> &Cacher<R, E> {
        &self.shared.cacher
    }

    /// Creates a wrapper sharing this one's cache, with some options replaced.
    ///
    /// Only `ttl`, `mru`, `key` and `origin` can be overridden.
    pub fn options(&self, overrides: MemoOptions<A, R, E>) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            ttl: overrides.ttl.or_else(|| self.ttl.clone()),
            mru: overrides.mru.or_else(|| self.mru.clone()),
            key: overrides.key.or_else(|| self.key.clone()),
            origin: overrides.origin.unwrap_or(self.origin),
        }
    }

    pub async fn call(&self, args: A) -> Result<R, MemoError<E>> {
        self.call_with(CallOptions::default(), args).await
    }

    pub async fn call_with(&self, options: CallOptions<A, R>, args: A) -> Result<R, MemoError<E>> {
        self.call_traced(options, args).await.0
    }

    /// Calls the producer through the cache, returning how the call was answered.
    pub async fn call_traced(
        &self,
        options: CallOptions<A, R>,
        args: A,
    ) -> (Result<R, MemoError<E>>, Trace) {
        let mut trace = Trace::default();
        let result = self.run(&options, args, &mut trace).await;
        if self.origin {
            tracing::debug!(
                memo = %self.shared.name,
                local = %self.shared.local_id,
                backing = self.shared.cacher.backing().map(|b| b.name()),
                key = trace.key.as_ref().map(CacheKey::as_str),
                ok = result.is_ok(),
                "Memoized call: {trace}",
            );
        }
        (result, trace)
    }

    /// Removes all cached results of this producer from both tiers.
    pub async fn clear_cache(&self) -> Result<(), MemoError<E>> {
        self.shared.cacher.clear().await?;
        Ok(())
    }

    /// The live local entry for `args`, without waiting, reserving or computing anything.
    pub fn peek(&self, args: &A) -> Option<CacheEntry<R>> {
        let key = self.derive_key(None, args)?;
        self.shared.cacher.peek(&key)
    }

    /// Drops all locally cached results, so that the next calls go through the backing store.
    pub fn flush_local(&self) {
        self.shared.cacher.flush_local()
    }

    /// Derives the cache key of a call, `None` if the call is not cacheable.
    pub fn derive_key(&self, receiver: Option<&KeyValue>, args: &A) -> Option<CacheKey> {
        let hasher = &self.shared.hasher;
        let key = match &self.key {
            Some(key_fn) => {
                let custom = key_fn(receiver, args)?;
                match custom.scalar_text() {
                    Some(text) => text,
                    None => format!("object/{}", hasher.hash(&custom)?),
                }
            }
            None => {
                let args = match KeyValue::from_serialize(args) {
                    Ok(args) => args,
                    Err(e) => {
                        tracing::warn!(
                            error = &e as &dyn std::error::Error,
                            memo = %self.shared.name,
                            "Arguments cannot be hashed, not caching",
                        );
                        return None;
                    }
                };
                let receiver = receiver.cloned().unwrap_or_default();
                hasher.hash(&KeyValue::object([("self", receiver), ("args", args)]))?
            }
        };
        Some(CacheKey::new(key))
    }

    async fn run(
        &self,
        options: &CallOptions<A, R>,
        args: A,
        trace: &mut Trace,
    ) -> Result<R, MemoError<E>> {
        let shared = &self.shared;
        let cacher = &shared.cacher;
        metric!(counter("memo.access") += 1, "memo" => &shared.name);

        let receiver = options.receiver.as_ref();
        let Some(key) = self.derive_key(receiver, &args) else {
            trace.push(Origin::Uncached);
            metric!(counter("memo.uncached") += 1, "memo" => &shared.name);
            return (shared.producer)(args).await.map_err(MemoError::Producer);
        };
        trace.key = Some(key.clone());

        let ttl = options.ttl.as_ref().or(self.ttl.as_ref());
        let mru = options.mru.as_ref().or(self.mru.as_ref());

        loop {
            match cacher.lookup(&key) {
                Lookup::Hit(entry) => {
                    trace.push(Origin::Local);
                    metric!(counter("memo.local.hit") += 1, "memo" => &shared.name);
                    self.touch(&key, mru, receiver, &args, &entry, trace).await?;
                    return Ok(entry.value);
                }
                Lookup::Wait(waiter) => {
                    trace.push(Origin::Awaited);
                    match waiter.wait().await {
                        Settled::Resolved(entry) => {
                            trace.push(Origin::Resolved);
                            return Ok(entry.value);
                        }
                        Settled::Failed(e) => {
                            trace.push(Origin::Rejected);
                            return Err(MemoError::Producer(e));
                        }
                        Settled::TimedOut => {
                            trace.push(Origin::TimedOut);
                            trace.push(Origin::Retry);
                        }
                        Settled::Absent => trace.push(Origin::Retry),
                    }
                }
                Lookup::Miss(reservation) => {
                    if reservation.replaced_expired() {
                        trace.push(Origin::Expired);
                    }
                    let cached = reservation.fetch_backing().await;
                    if let Some(entry) = cached {
                        trace.push(Origin::Backing);
                        metric!(counter("memo.backing.hit") += 1, "memo" => &shared.name);
                        let entry = reservation.restore(entry);
                        self.touch(&key, mru, receiver, &args, &entry, trace).await?;
                        return Ok(entry.value);
                    }
                    return self.compute(reservation, ttl, receiver, args, trace).await;
                }
            }
        }
    }

    /// Runs the producer for a reserved key and settles the reservation with its outcome.
    async fn compute(
        &self,
        reservation: Reservation<R, E>,
        ttl: Option<&TimePolicy<A, R>>,
        receiver: Option<&KeyValue>,
        args: A,
        trace: &mut Trace,
    ) -> Result<R, MemoError<E>> {
        let shared = &self.shared;
        let key = reservation.key().clone();
        // A broken policy drops the reservation before the producer runs.
        let reserved = match ttl {
            Some(policy) => policy.ttl(PolicyInput {
                receiver,
                args: &args,
                result: None,
            })?,
            None => Ttl::Forever,
        };

        trace.push(Origin::Computed);
        metric!(counter("memo.computation") += 1, "memo" => &shared.name);
        let value = match (shared.producer)(args.clone()).await {
            Ok(value) => value,
            Err(e) => {
                trace.push(Origin::Rejected);
                metric!(counter("memo.rejected") += 1, "memo" => &shared.name);
                reservation.reject(e.clone());
                return Err(MemoError::Producer(e));
            }
        };

        let final_ttl = match ttl {
            Some(policy) if policy.is_callback() => policy.ttl(PolicyInput {
                receiver,
                args: &args,
                result: Some(&value),
            }),
            _ => Ok(reserved),
        };
        let final_ttl = match final_ttl {
            Ok(final_ttl) => final_ttl,
            Err(e) => {
                // Waiters still get the value, only this caller sees the broken policy.
                reservation.resolve(value, Ttl::DoNotCache).await;
                return Err(e.into());
            }
        };
        trace.push(Origin::Resolved);
        let resolved = reservation.resolve(value, final_ttl).await;
        if let Err(e) = &resolved.backing {
            tracing::warn!(
                error = e as &dyn std::error::Error,
                memo = %shared.name,
                %key,
                "Failed to write computed result to backing store",
            );
        }
        Ok(resolved.entry.value)
    }

    /// Applies the MRU policy to a cache hit.
    async fn touch(
        &self,
        key: &CacheKey,
        mru: Option<&TimePolicy<A, R>>,
        receiver: Option<&KeyValue>,
        args: &A,
        entry: &CacheEntry<R>,
        trace: &mut Trace,
    ) -> Result<(), MemoError<E>> {
        let (Some(mru), Some(expires)) = (mru, entry.expires) else {
            return Ok(());
        };
        let input = PolicyInput {
            receiver,
            args,
            result: Some(&entry.value),
        };
        let Ttl::Expires(duration) = mru.ttl(input)? else {
            return Ok(());
        };

        let until = Timestamp::now().saturating_add(duration);
        if until <= expires {
            return Ok(());
        }
        match self.shared.cacher.extend(key, until).await {
            Ok(true) => trace.push(Origin::Mru(until)),
            Ok(false) => {}
            Err(e) => {
                // Only the backing write failed.
                trace.push(Origin::Mru(until));
                tracing::warn!(
                    error = &e as &dyn std::error::Error,
                    memo = %self.shared.name,
                    %key,
                    "Failed to extend backing entry",
                );
            }
        }
        Ok(())
    }
}
