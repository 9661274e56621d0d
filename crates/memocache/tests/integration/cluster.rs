//! Memoizers sharing a backing store, standing in for processes of a cluster.

use std::sync::Arc;
use std::time::Duration;

use memocache::caching::{
    BackingConfig, BackingFactory, BackingStore, FilesystemBackendConfig, MemoryBackend,
};
use memocache::{CallOptions, MemoConfig, MemoOptions, Memoizer, Origin, Timestamp};

use crate::test::{self, CallCounter};
use crate::{setup_memoizer, shared_backing};

const DELAY: Duration = Duration::from_millis(100);

fn process(backing: &BackingFactory) -> Memoizer {
    test::setup();
    let config = MemoConfig {
        sweep_interval: None,
        ..Default::default()
    };
    Memoizer::with_backing(config, Some(Arc::clone(backing)))
}

#[tokio::test(start_paused = true)]
async fn test_results_are_shared() {
    let root = MemoryBackend::new();
    let backing = shared_backing(&root);
    let (a, b) = (process(&backing), process(&backing));

    let counter_a = CallCounter::new();
    let counter_b = CallCounter::new();
    let memo_a = a.memoize(
        "shared",
        test::incrementing::<u32>(&counter_a, DELAY),
        MemoOptions::new().ttl("1m"),
    );
    let memo_b = b.memoize(
        "shared",
        test::incrementing::<u32>(&counter_b, DELAY),
        MemoOptions::new().ttl("1m"),
    );

    assert_eq!(memo_a.call(7).await.unwrap(), 1);
    let (result, trace) = memo_b.call_traced(CallOptions::new(), 7).await;
    assert_eq!(result.unwrap(), 1);
    assert_eq!(trace.steps, vec![Origin::Backing]);
    assert_eq!(counter_b.get(), 0);

    // The backing hit is now cached locally, with the original expiry.
    let (_, trace) = memo_b.call_traced(CallOptions::new(), 7).await;
    assert_eq!(trace.steps, vec![Origin::Local]);
    assert_eq!(memo_b.peek(&7), memo_a.peek(&7));
}

#[tokio::test(start_paused = true)]
async fn test_clear_is_shared() {
    let root = MemoryBackend::new();
    let backing = shared_backing(&root);
    let (a, b) = (process(&backing), process(&backing));

    let counter = CallCounter::new();
    let memo_a = a.memoize(
        "cleared",
        test::incrementing::<()>(&counter, DELAY),
        MemoOptions::new(),
    );
    let memo_b = b.memoize(
        "cleared",
        test::incrementing::<()>(&counter, DELAY),
        MemoOptions::new(),
    );

    assert_eq!(memo_a.call(()).await.unwrap(), 1);
    assert_eq!(memo_b.call(()).await.unwrap(), 1);

    memo_a.clear_cache().await.unwrap();
    assert!(root.namespace("cleared").is_empty());

    // Other processes keep their local copy until it is flushed.
    assert_eq!(memo_b.call(()).await.unwrap(), 1);
    memo_b.flush_local();
    assert_eq!(memo_b.call(()).await.unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_mru_extends_backing_entry() {
    let root = MemoryBackend::new();
    let backing = shared_backing(&root);
    let (a, b) = (process(&backing), process(&backing));

    let counter = CallCounter::new();
    let options = || MemoOptions::new().ttl("1s").mru("5s");
    let memo_a = a.memoize(
        "extended",
        test::incrementing::<()>(&counter, DELAY),
        options(),
    );
    let memo_b = b.memoize(
        "extended",
        test::incrementing::<()>(&counter, DELAY),
        options(),
    );

    assert_eq!(memo_a.call(()).await.unwrap(), 1);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(memo_a.call(()).await.unwrap(), 1);

    // Without the extension, the shared entry would have expired by now.
    tokio::time::sleep(Duration::from_secs(2)).await;
    let (result, trace) = memo_b.call_traced(CallOptions::new(), ()).await;
    assert_eq!(result.unwrap(), 1);
    assert_eq!(trace.steps[0], Origin::Backing);
    assert_eq!(counter.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_sweep_expires_backing_entries() {
    let root = MemoryBackend::new();
    let backing = shared_backing(&root);
    let memoizer = process(&backing);

    let counter = CallCounter::new();
    let memo = memoizer.memoize(
        "swept",
        test::incrementing::<u32>(&counter, DELAY),
        MemoOptions::new().ttl("1s"),
    );
    memo.call(1).await.unwrap();
    memo.call(2).await.unwrap();
    assert_eq!(root.namespace("swept").len(), 2);

    tokio::time::sleep(Duration::from_secs(2)).await;
    let report = memoizer.sweep_now().await;
    assert_eq!(report.caches, 1);
    assert_eq!(report.errors, 0);
    // The memory backend expires natively, so only local removals are counted.
    assert_eq!(report.expired, 2);
    assert!(root.namespace("swept").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_per_memo_backing() {
    let memoizer = setup_memoizer(|_| ());
    let root = MemoryBackend::new();

    let counter = CallCounter::new();
    let memo = memoizer.memoize(
        "own_backing",
        test::incrementing::<()>(&counter, DELAY),
        MemoOptions::new().create_cache(shared_backing(&root)),
    );
    memo.call(()).await.unwrap();

    let store = memo.cacher().backing().unwrap();
    assert_eq!(store.keys().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_filesystem_backing() {
    let cache_dir = test::tempdir();
    let config = || MemoConfig {
        sweep_interval: None,
        backing: Some(BackingConfig::Filesystem(FilesystemBackendConfig {
            path: cache_dir.path().to_owned(),
        })),
        ..Default::default()
    };
    test::setup();
    let a = Memoizer::new(config()).unwrap();
    let b = Memoizer::new(config()).unwrap();

    let counter = CallCounter::new();
    let memo_a = a.memoize(
        "on_disk",
        test::incrementing::<String>(&counter, Duration::ZERO),
        MemoOptions::new().ttl("1h"),
    );
    let memo_b = b.memoize(
        "on_disk",
        test::incrementing::<String>(&counter, Duration::ZERO),
        MemoOptions::new().ttl("1h"),
    );

    assert_eq!(memo_a.call("x".into()).await.unwrap(), 1);
    let (result, trace) = memo_b.call_traced(CallOptions::new(), "x".into()).await;
    assert_eq!(result.unwrap(), 1);
    assert_eq!(trace.steps, vec![Origin::Backing]);

    let expires = memo_b.peek(&"x".into()).unwrap().expires.unwrap();
    assert!(expires > Timestamp::now());

    memo_b.clear_cache().await.unwrap();
    memo_a.flush_local();
    assert_eq!(memo_a.call("x".into()).await.unwrap(), 2);
}
