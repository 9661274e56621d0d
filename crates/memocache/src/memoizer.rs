use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

use crate::caching::{
    BackingFactory, CacheValue, Cacher, CacherOptions, LocalStore, MemoryStore, SweepReport,
    Sweeper,
};
use crate::clock::Timestamp;
use crate::config::MemoConfig;
use crate::hash::{KeyHasher, KeyValue};
use crate::memo::{MemoOptions, MemoShared, Memoized, erase_producer};
use crate::policy::TimePolicy;
use crate::utils::futures::CancelOnDrop;

type LinkRegistry = HashMap<(String, String), Box<dyn Any + Send + Sync>>;

/// Creates memoized producers sharing one configuration, backing store and sweeper.
///
/// Dropping the last clone of a memoizer stops its background sweep. Memoized producers created by
/// it keep working, but their expired entries are only evicted lazily from then on.
#[derive(Clone)]
pub struct Memoizer {
    inner: Arc<MemoizerInner>,
}

struct MemoizerInner {
    config: MemoConfig,
    hasher: KeyHasher,
    backing: Option<BackingFactory>,
    sweeper: Sweeper,
    links: Mutex<LinkRegistry>,
    local_id: Arc<str>,
    sweep_task: Option<CancelOnDrop>,
}

impl fmt::Debug for Memoizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memoizer")
            .field("config", &self.inner.config)
            .field("local_id", &self.inner.local_id)
            .field("backing", &self.inner.backing.is_some())
            .field("sweeper", &self.inner.sweeper)
            .field("sweeping", &self.inner.sweep_task.is_some())
            .finish()
    }
}

impl Default for Memoizer {
    fn default() -> Self {
        Self::with_backing(MemoConfig::default(), None)
    }
}

fn local_id() -> String {
    match hostname::get().ok().and_then(|s| s.into_string().ok()) {
        Some(host) => format!("local({host}:{})", std::process::id()),
        None => "local".to_owned(),
    }
}

impl Memoizer {
    /// Creates a memoizer, along with the backing store described by the config.
    pub fn new(config: MemoConfig) -> anyhow::Result<Self> {
        let backing = config
            .backing
            .as_ref()
            .map(|backing| backing.factory())
            .transpose()?;
        Ok(Self::with_backing(config, backing))
    }

    /// Creates a memoizer with a custom backing store factory.
    ///
    /// The `backing` setting of the config is ignored. The background sweep only runs when this
    /// is called within a tokio runtime.
    pub fn with_backing(config: MemoConfig, backing: Option<BackingFactory>) -> Self {
        let sweeper = Sweeper::new();
        let sweep_task = match (config.sweep_interval, tokio::runtime::Handle::try_current()) {
            (Some(interval), Ok(_)) => Some(sweeper.spawn(interval)),
            (Some(_), Err(_)) => {
                tracing::debug!("No runtime available, expired entries are only evicted lazily");
                None
            }
            (None, _) => None,
        };

        let inner = MemoizerInner {
            hasher: KeyHasher::new(config.hash.clone()),
            config,
            backing,
            sweeper,
            links: Mutex::new(HashMap::new()),
            local_id: local_id().into(),
            sweep_task,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn config(&self) -> &MemoConfig {
        &self.inner.config
    }

    pub fn hasher(&self) -> &KeyHasher {
        &self.inner.hasher
    }

    /// Hashes `value` with the configured algorithm.
    pub fn hash(&self, value: &KeyValue) -> Option<String> {
        self.inner.hasher.hash(value)
    }

    pub fn sweeper(&self) -> &Sweeper {
        &self.inner.sweeper
    }

    /// Expires entries of all caches created by this memoizer right away.
    pub async fn sweep_now(&self) -> SweepReport {
        self.inner.sweeper.sweep(Timestamp::now()).await
    }

    fn create_cacher<V, E>(&self, name: &str, options: &MemoOptions<(), V, E>) -> Cacher<V, E>
    where
        V: CacheValue,
        E: Clone + Send + Sync + 'static,
    {
        let config = &self.inner.config;
        let local: Box<dyn LocalStore<V, E>> = match &options.create_local_cache {
            Some(factory) => factory(name),
            None => Box::new(MemoryStore::new(name, config.local_capacity)),
        };
        let backing = match &options.create_cache {
            Some(factory) => factory(name),
            None => self.inner.backing.as_ref().and_then(|factory| factory(name)),
        };
        let cacher_options = CacherOptions {
            async_timeout: options.async_timeout.unwrap_or(config.async_timeout),
            ..config.cacher_options()
        };

        let cacher = Cacher::new(name, local, backing, cacher_options);
        self.inner.sweeper.register(cacher.expiry_handle());
        tracing::debug!(
            cache = name,
            backing = cacher.backing().map(|b| b.name()),
            "Created cache",
        );
        cacher
    }

    /// Creates a standalone cache that is swept along with the memoized producers.
    pub fn cache<V, E>(&self, name: &str) -> Cacher<V, E>
    where
        V: CacheValue,
        E: Clone + Send + Sync + 'static,
    {
        self.create_cacher(name, &MemoOptions::default())
    }

    /// Memoizes `producer` under `name`.
    ///
    /// `name` identifies the producer's cache, and with it the entries shared through the backing
    /// store. Producers memoized under the same name share results across processes, so they must
    /// compute the same thing.
    pub fn memoize<A, R, E, F, Fut>(
        &self,
        name: &str,
        producer: F,
        options: MemoOptions<A, R, E>,
    ) -> Memoized<A, R, E>
    where
        A: Clone + Serialize + Send + Sync + 'static,
        R: CacheValue,
        E: Clone + Send + Sync + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        let Some(link) = options.link.clone() else {
            return self.build(name, erase_producer(producer), options);
        };

        let mut links = self
            .inner
            .links
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let link_key = (link, name.to_owned());
        if let Some(linked) = links
            .get(&link_key)
            .and_then(|linked| linked.downcast_ref::<Memoized<A, R, E>>())
        {
            tracing::trace!(memo = name, link = %link_key.0, "Reusing linked memo");
            return linked.clone();
        }

        let memoized = self.build(name, erase_producer(producer), options);
        links.insert(link_key, Box::new(memoized.clone()));
        memoized
    }

    fn build<A, R, E>(
        &self,
        name: &str,
        producer: crate::memo::Producer<A, R, E>,
        options: MemoOptions<A, R, E>,
    ) -> Memoized<A, R, E>
    where
        A: Clone + Serialize + Send + Sync + 'static,
        R: CacheValue,
        E: Clone + Send + Sync + 'static,
    {
        let config = &self.inner.config;
        let cache_options = MemoOptions::<(), R, E> {
            async_timeout: options.async_timeout,
            create_cache: options.create_cache.clone(),
            create_local_cache: options.create_local_cache.clone(),
            ..Default::default()
        };
        let cacher = self.create_cacher(name, &cache_options);

        let options = MemoOptions {
            ttl: options
                .ttl
                .or_else(|| config.ttl.clone().map(TimePolicy::Value)),
            mru: options
                .mru
                .or_else(|| config.mru.clone().map(TimePolicy::Value)),
            origin: Some(options.origin.unwrap_or(config.origin)),
            ..options
        };

        let shared = MemoShared {
            name: name.into(),
            producer,
            cacher,
            hasher: self.inner.hasher.clone(),
            local_id: Arc::clone(&self.inner.local_id),
        };
        Memoized::new(shared, options)
    }
}
