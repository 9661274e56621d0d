use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use rand::seq::SliceRandom;
use tokio::time::MissedTickBehavior;

use crate::clock::Timestamp;
use crate::utils::futures::CancelOnDrop;

use super::BackingError;

/// A cache whose expired entries can be evicted in bulk.
#[async_trait]
pub trait Expire: Send + Sync {
    fn name(&self) -> &str;

    /// Removes everything expired at `now`, returning the number of removed entries.
    async fn expire_keys(&self, now: Timestamp) -> Result<usize, BackingError>;
}

/// Identifies a registration with a [`Sweeper`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SweepId(u64);

/// The outcome of one [`Sweeper::sweep`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// The number of caches that were swept.
    pub caches: usize,
    pub expired: usize,
    /// The number of caches that failed or panicked.
    pub errors: usize,
}

/// Periodically evicts expired entries from registered caches.
///
/// Registrations are weak: a cache that is dropped stops being swept. Errors and panics of
/// individual caches are logged and do not stop the sweep of the others.
#[derive(Clone, Default)]
pub struct Sweeper {
    inner: Arc<SweeperInner>,
}

#[derive(Default)]
struct SweeperInner {
    next_id: AtomicU64,
    caches: Mutex<Vec<(SweepId, Weak<dyn Expire>)>>,
}

impl fmt::Debug for Sweeper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sweeper")
            .field("caches", &self.lock().len())
            .finish()
    }
}

impl Sweeper {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(SweepId, Weak<dyn Expire>)>> {
        self.inner
            .caches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, cache: Weak<dyn Expire>) -> SweepId {
        let id = SweepId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, cache));
        id
    }

    /// Stops sweeping a cache. Returns `false` if it was not registered.
    pub fn deregister(&self, id: SweepId) -> bool {
        let mut caches = self.lock();
        let before = caches.len();
        caches.retain(|(registered, _)| *registered != id);
        caches.len() != before
    }

    /// The number of registered caches that are still alive.
    pub fn len(&self) -> usize {
        self.lock()
            .iter()
            .filter(|(_, cache)| cache.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Expires entries of all live caches, in random order.
    pub async fn sweep(&self, now: Timestamp) -> SweepReport {
        let mut caches: Vec<Arc<dyn Expire>> = {
            let mut registered = self.lock();
            registered.retain(|(_, cache)| cache.strong_count() > 0);
            registered
                .iter()
                .filter_map(|(_, cache)| cache.upgrade())
                .collect()
        };
        // A cache that reproducibly fails or stalls should not always starve the ones after it.
        caches.shuffle(&mut rand::rng());

        let mut report = SweepReport {
            caches: caches.len(),
            ..Default::default()
        };
        for cache in caches {
            let result = AssertUnwindSafe(cache.expire_keys(now)).catch_unwind().await;
            match result {
                Ok(Ok(expired)) => {
                    tracing::trace!(cache = cache.name(), expired, "Swept cache");
                    report.expired += expired;
                }
                Ok(Err(e)) => {
                    tracing::error!(
                        error = &e as &dyn std::error::Error,
                        cache = cache.name(),
                        "Failed to expire cache entries",
                    );
                    report.errors += 1;
                }
                Err(_) => {
                    tracing::error!(cache = cache.name(), "Panicked while expiring cache entries");
                    report.errors += 1;
                }
            }
        }

        metric!(gauge("memo.sweep.caches") = report.caches as u64);
        metric!(counter("memo.sweep.expired") += report.expired as i64);
        metric!(counter("memo.sweep.error") += report.errors as i64);
        report
    }

    /// Sweeps on a fixed interval until the returned handle is dropped.
    pub fn spawn(&self, interval: Duration) -> CancelOnDrop {
        let sweeper = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let report = sweeper.sweep(Timestamp::now()).await;
                tracing::debug!(
                    caches = report.caches,
                    expired = report.expired,
                    errors = report.errors,
                    "Expired cache entries",
                );
            }
        });
        CancelOnDrop::new(handle)
    }
}
