//! Helpers for testing memoized producers.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. Assign it to a variable in the test function (e.g.
//!    `let _cache_dir = test::tempdir()`).
//!
//!  - Producers built by [`incrementing`] and [`failing`] count their invocations in a shared
//!    [`CallCounter`], which is how tests observe whether a call hit the cache.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `memocache` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("memocache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`into_path`](TempDir::into_path) is called. Use it as a guard to automatically clean up after
/// tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Counts producer invocations.
#[derive(Clone, Debug, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an invocation and returns how many there were so far, including this one.
    pub fn incr(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// A producer that sleeps for `delay` and returns its invocation count.
///
/// The count is taken when the producer starts, so concurrent computations return distinct values.
pub fn incrementing<A>(
    counter: &CallCounter,
    delay: Duration,
) -> impl Fn(A) -> BoxFuture<'static, Result<usize, String>> + Send + Sync + 'static
where
    A: Send + 'static,
{
    let counter = counter.clone();
    move |_args| {
        let count = counter.incr();
        async move {
            tokio::time::sleep(delay).await;
            Ok(count)
        }
        .boxed()
    }
}

/// A producer that sleeps for `delay` and then fails with `"failure <count>"`.
pub fn failing<A>(
    counter: &CallCounter,
    delay: Duration,
) -> impl Fn(A) -> BoxFuture<'static, Result<usize, String>> + Send + Sync + 'static
where
    A: Send + 'static,
{
    let counter = counter.clone();
    move |_args| {
        let count = counter.incr();
        async move {
            tokio::time::sleep(delay).await;
            Err(format!("failure {count}"))
        }
        .boxed()
    }
}
