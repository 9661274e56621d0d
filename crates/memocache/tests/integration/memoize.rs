use std::time::Duration;

use futures::future::join_all;
use memocache::{CallOptions, MemoError, MemoOptions, Origin};

use crate::setup_memoizer;
use crate::test::{self, CallCounter};

const DELAY: Duration = Duration::from_millis(100);

#[tokio::test(start_paused = true)]
async fn test_increment() {
    let memoizer = setup_memoizer(|_| ());
    let counter = CallCounter::new();
    let increment = memoizer.memoize(
        "increment",
        test::incrementing::<()>(&counter, DELAY),
        MemoOptions::new().ttl(Duration::from_millis(1000)),
    );

    let (a, b) = tokio::join!(increment.call(()), increment.call(()));
    assert_eq!(a.unwrap(), 1);
    assert_eq!(b.unwrap(), 1);
    assert_eq!(counter.get(), 1);
    assert_eq!(increment.call(()).await.unwrap(), 1);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(increment.call(()).await.unwrap(), 2);

    increment.clear_cache().await.unwrap();
    assert_eq!(increment.call(()).await.unwrap(), 3);
    assert_eq!(counter.get(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_single_flight() {
    let memoizer = setup_memoizer(|_| ());
    let counter = CallCounter::new();
    let memo = memoizer.memoize(
        "single_flight",
        test::incrementing::<u32>(&counter, DELAY),
        MemoOptions::new(),
    );

    let calls = (0..20).map(|i| {
        let memo = memo.clone();
        tokio::spawn(async move { memo.call(i % 2).await })
    });
    let results: Vec<_> = join_all(calls)
        .await
        .into_iter()
        .map(|result| result.unwrap().unwrap())
        .collect();

    // One computation per distinct argument.
    assert_eq!(counter.get(), 2);
    assert!(results.iter().all(|n| *n == results[0] || *n == results[1]));
    assert_ne!(results[0], results[1]);
}

#[tokio::test(start_paused = true)]
async fn test_failures_are_shared_not_cached() {
    let memoizer = setup_memoizer(|_| ());
    let counter = CallCounter::new();
    let memo = memoizer.memoize(
        "failing",
        test::failing::<()>(&counter, DELAY),
        MemoOptions::new().ttl("1h"),
    );

    let (a, b) = tokio::join!(memo.call(()), memo.call(()));
    assert_eq!(a.unwrap_err().into_producer().unwrap(), "failure 1");
    assert_eq!(b.unwrap_err().into_producer().unwrap(), "failure 1");
    assert_eq!(counter.get(), 1);

    let err = memo.call(()).await.unwrap_err();
    assert_eq!(err.to_string(), "failure 2");
    assert!(memo.peek(&()).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_arguments_are_keys() {
    let memoizer = setup_memoizer(|_| ());
    let counter = CallCounter::new();
    let memo = memoizer.memoize(
        "args",
        test::incrementing::<(String, u32)>(&counter, DELAY),
        MemoOptions::new(),
    );

    assert_eq!(memo.call(("a".into(), 1)).await.unwrap(), 1);
    assert_eq!(memo.call(("a".into(), 2)).await.unwrap(), 2);
    assert_eq!(memo.call(("b".into(), 1)).await.unwrap(), 3);
    assert_eq!(memo.call(("a".into(), 1)).await.unwrap(), 1);

    // The receiver is part of the default key.
    let on_receiver = CallOptions::new().receiver("some receiver");
    assert_eq!(
        memo.call_with(on_receiver, ("a".into(), 1)).await.unwrap(),
        4
    );
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_computation_is_retried() {
    let memoizer = setup_memoizer(|_| ());
    let counter = CallCounter::new();
    let memo = memoizer.memoize(
        "slow",
        test::incrementing::<()>(&counter, Duration::from_secs(5)),
        MemoOptions::new().async_timeout(Duration::from_secs(1)),
    );

    let (first, second) = tokio::join!(
        memo.call_traced(CallOptions::new(), ()),
        memo.call_traced(CallOptions::new(), ()),
    );
    assert_eq!(first.0.unwrap(), 1);
    assert_eq!(
        first.1.steps,
        vec![Origin::Computed, Origin::Resolved]
    );
    assert_eq!(second.0.unwrap(), 2);
    assert_eq!(
        second.1.steps,
        vec![
            Origin::Awaited,
            Origin::TimedOut,
            Origin::Retry,
            Origin::Computed,
            Origin::Resolved
        ]
    );

    // Only the computation that still owned the key was stored.
    assert_eq!(memo.call(()).await.unwrap(), 2);
    assert_eq!(counter.get(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_call_releases_key() {
    let memoizer = setup_memoizer(|_| ());
    let counter = CallCounter::new();
    let memo = memoizer.memoize(
        "dropped",
        test::incrementing::<()>(&counter, DELAY),
        MemoOptions::new(),
    );

    let abandoned = tokio::time::timeout(DELAY / 2, memo.call(())).await;
    assert!(abandoned.is_err());

    let (result, trace) = memo.call_traced(CallOptions::new(), ()).await;
    assert_eq!(result.unwrap(), 2);
    assert_eq!(trace.steps, vec![Origin::Computed, Origin::Resolved]);
}

#[tokio::test(start_paused = true)]
async fn test_origin_trace() {
    let memoizer = setup_memoizer(|config| config.origin = true);
    let counter = CallCounter::new();
    let memo = memoizer.memoize(
        "traced",
        test::incrementing::<()>(&counter, DELAY),
        MemoOptions::new(),
    );

    let (result, trace) = memo.call_traced(CallOptions::new(), ()).await;
    assert_eq!(result.unwrap(), 1);
    assert!(trace.key.is_some());
    insta::assert_snapshot!(trace.to_string(), @"computed > resolved");

    let (_, trace) = memo.call_traced(CallOptions::new(), ()).await;
    insta::assert_snapshot!(trace.to_string(), @"local");
}

#[tokio::test(start_paused = true)]
async fn test_options_share_cache() {
    let memoizer = setup_memoizer(|_| ());
    let counter = CallCounter::new();
    let short = memoizer.memoize(
        "shared",
        test::incrementing::<()>(&counter, DELAY),
        MemoOptions::new().ttl("1s"),
    );
    let long = short.options(MemoOptions::new().ttl("1m"));

    assert_eq!(short.call(()).await.unwrap(), 1);
    assert_eq!(long.call(()).await.unwrap(), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    // Stored by `long`, so it outlives the short TTL.
    assert_eq!(long.call(()).await.unwrap(), 2);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(short.call(()).await.unwrap(), 2);

    long.clear_cache().await.unwrap();
    assert!(short.peek(&()).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_link_reuses_memo() {
    let memoizer = setup_memoizer(|_| ());
    let first = CallCounter::new();
    let second = CallCounter::new();

    let memo = memoizer.memoize(
        "linked",
        test::incrementing::<()>(&first, DELAY),
        MemoOptions::new().link("memo"),
    );
    let again = memoizer.memoize(
        "linked",
        test::incrementing::<()>(&second, DELAY),
        MemoOptions::new().link("memo"),
    );
    let unlinked = memoizer.memoize(
        "linked",
        test::incrementing::<()>(&second, DELAY),
        MemoOptions::new(),
    );

    assert_eq!(memo.call(()).await.unwrap(), 1);
    assert_eq!(again.call(()).await.unwrap(), 1);
    assert_eq!(first.get(), 1);
    assert_eq!(second.get(), 0);

    // Without the link, the producer gets its own cache.
    assert_eq!(unlinked.call(()).await.unwrap(), 1);
    assert_eq!(second.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_peek_and_flush() {
    let memoizer = setup_memoizer(|_| ());
    let counter = CallCounter::new();
    let memo = memoizer.memoize(
        "peek",
        test::incrementing::<u32>(&counter, DELAY),
        MemoOptions::new().ttl("10s"),
    );

    assert!(memo.peek(&1).is_none());
    memo.call(1).await.unwrap();
    let entry = memo.peek(&1).unwrap();
    assert_eq!(entry.value, 1);
    assert!(entry.expires.is_some());

    memo.flush_local();
    assert!(memo.peek(&1).is_none());
    assert_eq!(memo.call(1).await.unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_policy() {
    let memoizer = setup_memoizer(|_| ());
    let counter = CallCounter::new();
    let memo = memoizer.memoize(
        "invalid",
        test::incrementing::<()>(&counter, DELAY),
        MemoOptions::new().ttl("10 parsecs"),
    );

    let err = memo.call(()).await.unwrap_err();
    assert!(matches!(err, MemoError::Policy(_)));
    assert_eq!(counter.get(), 0);

    // The failed call did not leave a pending computation behind.
    let fixed = memo.options(MemoOptions::new().ttl("10s"));
    assert_eq!(fixed.call(()).await.unwrap(), 1);
}
