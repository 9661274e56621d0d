use std::time::Duration;

use memocache::{CallOptions, HashAlgorithm, KeyValue, MemoOptions, Origin};
use serde::Serialize;

use crate::setup_memoizer;
use crate::test::{self, CallCounter};

const DELAY: Duration = Duration::from_millis(10);

#[derive(Clone, Serialize)]
struct Request {
    user: u64,
    trace_id: String,
}

#[tokio::test(start_paused = true)]
async fn test_custom_key() {
    let memoizer = setup_memoizer(|_| ());
    let counter = CallCounter::new();
    let memo = memoizer.memoize(
        "custom_key",
        test::incrementing::<Request>(&counter, DELAY),
        MemoOptions::new().key(|_, request: &Request| Some(request.user.into())),
    );

    let request = |user, trace_id: &str| Request {
        user,
        trace_id: trace_id.into(),
    };
    assert_eq!(memo.call(request(1, "a")).await.unwrap(), 1);
    assert_eq!(memo.call(request(1, "b")).await.unwrap(), 1);
    assert_eq!(memo.call(request(2, "a")).await.unwrap(), 2);

    let key = memo.derive_key(None, &request(1, "c")).unwrap();
    assert_eq!(key.as_str(), "number/1");
}

#[tokio::test(start_paused = true)]
async fn test_composite_custom_key() {
    let memoizer = setup_memoizer(|_| ());
    let counter = CallCounter::new();
    let memo = memoizer.memoize(
        "composite_key",
        test::incrementing::<Request>(&counter, DELAY),
        MemoOptions::new().key(|_, request: &Request| {
            Some(KeyValue::object([("user", request.user.into())]))
        }),
    );

    let key = memo
        .derive_key(
            None,
            &Request {
                user: 1,
                trace_id: "a".into(),
            },
        )
        .unwrap();
    assert!(key.as_str().starts_with("object/"));
    assert_eq!(key.as_str().len(), "object/".len() + 64);
}

#[tokio::test(start_paused = true)]
async fn test_key_opt_out() {
    let memoizer = setup_memoizer(|_| ());
    let counter = CallCounter::new();
    let memo = memoizer.memoize(
        "opt_out",
        test::incrementing::<u64>(&counter, DELAY),
        MemoOptions::new().key(|_, n: &u64| (*n > 0).then(|| (*n).into())),
    );

    assert_eq!(memo.call(0).await.unwrap(), 1);
    let (result, trace) = memo.call_traced(CallOptions::new(), 0).await;
    assert_eq!(result.unwrap(), 2);
    assert_eq!(trace.key, None);
    assert_eq!(trace.steps, vec![Origin::Uncached]);

    assert_eq!(memo.call(1).await.unwrap(), 3);
    assert_eq!(memo.call(1).await.unwrap(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_hashing_disabled() {
    let memoizer = setup_memoizer(|config| config.hash.algorithm = HashAlgorithm::Disabled);
    let counter = CallCounter::new();
    let default_key = memoizer.memoize(
        "no_hash",
        test::incrementing::<u64>(&counter, DELAY),
        MemoOptions::new(),
    );

    assert_eq!(default_key.call(1).await.unwrap(), 1);
    assert_eq!(default_key.call(1).await.unwrap(), 2);

    // Scalar keys do not need a hash.
    let scalar_key = default_key.options(MemoOptions::new().key(|_, n: &u64| Some((*n).into())));
    assert_eq!(scalar_key.call(1).await.unwrap(), 3);
    assert_eq!(scalar_key.call(1).await.unwrap(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_unordered_arrays() {
    let memoizer = setup_memoizer(|config| config.hash.unordered_arrays = true);
    let counter = CallCounter::new();
    let memo = memoizer.memoize(
        "unordered",
        test::incrementing::<Vec<u32>>(&counter, DELAY),
        MemoOptions::new(),
    );

    assert_eq!(memo.call(vec![1, 2, 3]).await.unwrap(), 1);
    assert_eq!(memo.call(vec![3, 1, 2]).await.unwrap(), 1);
    assert_eq!(memo.call(vec![1, 2]).await.unwrap(), 2);
}

#[test]
fn test_memoizer_hash() {
    let memoizer = setup_memoizer(|config| config.hash.algorithm = HashAlgorithm::Basic);
    let a = KeyValue::object([("x", 1.into()), ("y", "two".into())]);
    let b = KeyValue::object([("y", "two".into()), ("x", 1.into())]);
    assert_eq!(memoizer.hash(&a), memoizer.hash(&b));
    assert_ne!(memoizer.hash(&a), memoizer.hash(&KeyValue::Null));
}
