use std::fmt;
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;

/// A cached value along with its expiry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry<V> {
    pub value: V,
    /// When this entry stops being valid. `None` entries never expire.
    pub expires: Option<Timestamp>,
}

impl<V> CacheEntry<V> {
    pub fn new(value: V, expires: Option<Timestamp>) -> Self {
        Self { value, expires }
    }

    /// Whether this entry is logically absent at `now`.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }

    /// The time this entry has left to live, `None` if it never expires.
    pub fn remaining(&self, now: Timestamp) -> Option<Duration> {
        self.expires.map(|expires| expires.remaining(now))
    }
}

/// How a pending computation ended, as observed by callers waiting on it.
#[derive(Clone, Debug)]
pub enum Settled<V, E> {
    /// The computation or a backing store lookup produced an entry.
    Resolved(CacheEntry<V>),
    /// The reservation was released without a value, callers should look up the key again.
    Absent,
    /// The waiter gave up on the computation and evicted it.
    TimedOut,
    /// The producer failed. Failures are never cached.
    Failed(E),
}

pub(crate) type SettledFuture<V, E> = Shared<BoxFuture<'static, Settled<V, E>>>;

/// A computation in flight, which any number of callers can await.
pub struct Placeholder<V, E> {
    pub(crate) id: u64,
    pub(crate) created: Timestamp,
    pub(crate) settled: SettledFuture<V, E>,
}

impl<V, E> Placeholder<V, E> {
    /// Whether this placeholder has been outstanding for longer than `timeout` at `now`.
    pub fn is_stale(&self, now: Timestamp, timeout: Duration) -> bool {
        self.created.saturating_add(timeout) <= now
    }

    pub fn created(&self) -> Timestamp {
        self.created
    }
}

impl<V, E> Clone for Placeholder<V, E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            created: self.created,
            settled: self.settled.clone(),
        }
    }
}

impl<V, E> fmt::Debug for Placeholder<V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Placeholder")
            .field("id", &self.id)
            .field("created", &self.created)
            .finish_non_exhaustive()
    }
}

/// What the local cache holds for a key.
pub enum LocalSlot<V, E> {
    Ready(CacheEntry<V>),
    Pending(Placeholder<V, E>),
}

impl<V: Clone, E: Clone> Clone for LocalSlot<V, E> {
    fn clone(&self) -> Self {
        match self {
            Self::Ready(entry) => Self::Ready(entry.clone()),
            Self::Pending(placeholder) => Self::Pending(placeholder.clone()),
        }
    }
}

impl<V: fmt::Debug, E> fmt::Debug for LocalSlot<V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(entry) => f.debug_tuple("Ready").field(entry).finish(),
            Self::Pending(placeholder) => f.debug_tuple("Pending").field(placeholder).finish(),
        }
    }
}

impl<V, E> LocalSlot<V, E> {
    /// Whether this slot should be dropped at `now`.
    pub fn is_evictable(&self, now: Timestamp, pending_timeout: Duration) -> bool {
        match self {
            Self::Ready(entry) => entry.is_expired(now),
            Self::Pending(placeholder) => placeholder.is_stale(now, pending_timeout),
        }
    }
}
