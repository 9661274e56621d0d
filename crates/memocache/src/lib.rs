//! Memoization of asynchronous producers over a two-tier cache.
//!
//! A [`Memoizer`] turns an `async` function into a [`Memoized`] producer. Calls with the same
//! arguments are answered from a local in-process cache, from a backing store shared with other
//! processes, or by waiting on a computation that is already running for the same key. Only if
//! none of these has a result is the producer invoked.
//!
//! ```no_run
//! use memocache::{MemoConfig, MemoOptions, Memoizer};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let memoizer = Memoizer::new(MemoConfig::default())?;
//! let lookup = memoizer.memoize(
//!     "lookup_user",
//!     |id: u64| async move { Ok::<_, String>(format!("user {id}")) },
//!     MemoOptions::new().ttl("5m"),
//! );
//! assert_eq!(lookup.call(42).await?, "user 42");
//! # Ok(())
//! # }
//! ```

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod clock;
pub mod config;
pub mod hash;
pub mod logging;
pub mod memo;
pub mod memoizer;
pub mod policy;
pub mod utils;

pub use caching::{BackingError, CacheEntry, CacheKey, Cacher, MemoError};
pub use clock::Timestamp;
pub use config::{Config, MemoConfig};
pub use hash::{HashAlgorithm, HashConfig, KeyHasher, KeyValue};
pub use memo::{CallOptions, MemoOptions, Memoized, Origin, Trace};
pub use memoizer::Memoizer;
pub use policy::{PolicyError, PolicyInput, PolicyValue, TimePolicy, Ttl};
