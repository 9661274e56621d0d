//! Two-tier caching of computation results.
//!
//! # Layers
//!
//! A [`Cacher`] has two layers, which are consulted in this order:
//!
//! - The local layer, a [`LocalStore`] living in the memory of the current process. By default
//!   this is a bounded moka cache ([`MemoryStore`]).
//!
//! - The backing layer, an optional [`BackingStore`] that is shared by all processes that memoize
//!   the same producers. This crate ships a [`MemoryBackend`] and a [`FilesystemBackend`], other
//!   stores can be plugged in by implementing the trait (or [`SyncBackingStore`] for stores with a
//!   blocking API).
//!
//! Besides finished entries, the local layer also holds [`Placeholder`]s for computations that are
//! still running. A lookup that finds a placeholder waits for it instead of computing the same
//! value again. Placeholders older than the configured async timeout are considered abandoned and
//! get evicted, so that a crashed computation degrades to a recomputation instead of a hang.
//!
//! # Expiry
//!
//! Every entry carries an optional expiry timestamp. Expired entries are never returned, and are
//! removed lazily when they are looked up, or in bulk by the [`Sweeper`].

mod backing;
mod cache_error;
mod cache_key;
mod cacher;
mod entry;
mod local;
mod sweeper;


pub use backing::{
    BackingConfig, BackingFactory, BackingStore, FilesystemBackend, FilesystemBackendConfig,
    MemoryBackend, StoredEntry, SyncBacking, SyncBackingStore,
};
pub use cache_error::{BackingError, MemoError};
pub use cache_key::CacheKey;
pub use cacher::{
    CacheValue, Cacher, CacherOptions, Lookup, Reservation, Resolved, Waiter,
};
pub use entry::{CacheEntry, LocalSlot, Placeholder, Settled};
pub use local::{LocalStore, LocalStoreFactory, MemoryStore};
pub use sweeper::{Expire, SweepId, SweepReport, Sweeper};
