use std::time::Duration;

use futures::future::join_all;
use memocache::{
    CallOptions, MemoError, MemoOptions, Memoized, Origin, PolicyValue, TimePolicy, Timestamp,
};

use crate::setup_memoizer;
use crate::test::{self, CallCounter};

const DELAY: Duration = Duration::from_millis(100);

#[tokio::test(start_paused = true)]
async fn test_mru_postpones_expiry() {
    let memoizer = setup_memoizer(|_| ());
    let counter = CallCounter::new();
    let memo = memoizer.memoize(
        "mru",
        test::incrementing::<()>(&counter, DELAY),
        MemoOptions::new().ttl("1s").mru("1s"),
    );

    assert_eq!(memo.call(()).await.unwrap(), 1);

    // Every hit keeps the entry alive for another second.
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(800)).await;
        let (result, trace) = memo.call_traced(CallOptions::new(), ()).await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(trace.steps.len(), 2);
        assert!(matches!(
            trace.steps.as_slice(),
            [Origin::Local, Origin::Mru(_)]
        ));
    }

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(memo.call(()).await.unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_mru_never_shortens() {
    let memoizer = setup_memoizer(|_| ());
    let counter = CallCounter::new();
    let memo = memoizer.memoize(
        "mru_short",
        test::incrementing::<()>(&counter, DELAY),
        MemoOptions::new().ttl("10s").mru("1s"),
    );

    memo.call(()).await.unwrap();
    let expires = memo.peek(&()).unwrap().expires;

    let (_, trace) = memo.call_traced(CallOptions::new(), ()).await;
    assert_eq!(trace.steps, vec![Origin::Local]);
    assert_eq!(memo.peek(&()).unwrap().expires, expires);
}

#[tokio::test(start_paused = true)]
async fn test_mru_ignores_eternal_entries() {
    let memoizer = setup_memoizer(|_| ());
    let counter = CallCounter::new();
    let memo = memoizer.memoize(
        "mru_forever",
        test::incrementing::<()>(&counter, DELAY),
        MemoOptions::new().mru("1s"),
    );

    memo.call(()).await.unwrap();
    let (_, trace) = memo.call_traced(CallOptions::new(), ()).await;
    assert_eq!(trace.steps, vec![Origin::Local]);
    assert_eq!(memo.peek(&()).unwrap().expires, None);
}

#[tokio::test(start_paused = true)]
async fn test_zero_ttl_shares_without_storing() {
    let memoizer = setup_memoizer(|_| ());
    let counter = CallCounter::new();
    let memo = memoizer.memoize(
        "zero",
        test::incrementing::<()>(&counter, DELAY),
        MemoOptions::new().ttl(PolicyValue::Seconds(0.0)),
    );

    let (a, b) = tokio::join!(memo.call(()), memo.call(()));
    assert_eq!((a.unwrap(), b.unwrap()), (1, 1));
    assert!(memo.peek(&()).is_none());
    assert_eq!(memo.call(()).await.unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_ttl_callback_sees_result() {
    let memoizer = setup_memoizer(|_| ());
    let counter = CallCounter::new();
    // Only even results are cached.
    let ttl = TimePolicy::<(), usize>::callback(|input| match input.result {
        Some(n) if n % 2 == 1 => PolicyValue::Seconds(0.0),
        _ => PolicyValue::from("1h"),
    });
    let memo = memoizer.memoize(
        "callback",
        test::incrementing::<()>(&counter, DELAY),
        MemoOptions::new().ttl(ttl),
    );

    assert_eq!(memo.call(()).await.unwrap(), 1);
    assert_eq!(memo.call(()).await.unwrap(), 2);
    assert_eq!(memo.call(()).await.unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_broken_final_ttl_is_shared_uncached() {
    let memoizer = setup_memoizer(|_| ());
    let counter = CallCounter::new();
    let ttl = TimePolicy::<(), usize>::callback(|input| match input.result {
        None => PolicyValue::from("1h"),
        Some(_) => PolicyValue::from("bogus"),
    });
    let memo = memoizer.memoize(
        "broken_final_ttl",
        test::incrementing::<()>(&counter, DELAY),
        MemoOptions::new().ttl(ttl),
    );

    let results = join_all((0..5).map(|_| memo.call(()))).await;
    assert_eq!(counter.get(), 1);

    let failed = results
        .iter()
        .filter(|result| matches!(result, Err(MemoError::Policy(_))))
        .count();
    assert_eq!(failed, 1);
    let shared = results
        .into_iter()
        .filter_map(Result::ok)
        .collect::<Vec<_>>();
    assert_eq!(shared, vec![1; 4]);
    assert!(memo.peek(&()).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_oversized_ttl_never_expires() {
    let memoizer = setup_memoizer(|_| ());
    let counter = CallCounter::new();
    let memo = memoizer.memoize(
        "oversized",
        test::incrementing::<u32>(&counter, DELAY),
        MemoOptions::new().ttl(TimePolicy::seconds(1e20)),
    );

    assert_eq!(memo.call(1).await.unwrap(), 1);
    assert_eq!(memo.peek(&1).unwrap().expires, None);

    let long = memo.options(MemoOptions::new().ttl("99999999999999999999d"));
    assert_eq!(long.call(2).await.unwrap(), 2);
    assert_eq!(long.call(2).await.unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_policy_precedence() {
    let memoizer = setup_memoizer(|config| config.ttl = Some(PolicyValue::Seconds(1.0)));
    let counter = CallCounter::new();
    let global = memoizer.memoize(
        "global",
        test::incrementing::<u32>(&counter, DELAY),
        MemoOptions::new(),
    );
    let instance = global.options(MemoOptions::new().ttl("1m"));

    global.call(1).await.unwrap();
    assert_eq!(remaining(&global, 1), Duration::from_secs(1));
    instance.call(2).await.unwrap();
    assert_eq!(remaining(&global, 2), Duration::from_secs(60));
    instance
        .call_with(CallOptions::new().ttl("1h"), 3)
        .await
        .unwrap();
    assert_eq!(remaining(&global, 3), Duration::from_secs(3600));
}

fn remaining(memo: &Memoized<u32, usize, String>, arg: u32) -> Duration {
    let expires = memo.peek(&arg).unwrap().expires.unwrap();
    expires.remaining(Timestamp::now())
}
