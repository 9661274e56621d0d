use std::sync::Arc;

use memocache::caching::{BackingFactory, BackingStore, MemoryBackend, SyncBacking};
use memocache::{MemoConfig, Memoizer};

pub use memocache_test as test;

/// Setup tests and create a memoizer without background sweeps.
///
/// The `update_config` closure can modify any default configuration if needed before the memoizer
/// is created.
pub fn setup_memoizer(update_config: impl FnOnce(&mut MemoConfig)) -> Memoizer {
    test::setup();

    let mut config = MemoConfig {
        sweep_interval: None,
        ..Default::default()
    };
    update_config(&mut config);

    Memoizer::new(config).unwrap()
}

/// A backing factory whose stores all live in `root`.
///
/// Memoizers sharing such a factory behave like processes sharing a backing store.
pub fn shared_backing(root: &MemoryBackend) -> BackingFactory {
    let root = root.clone();
    Arc::new(move |name: &str| {
        let store: Arc<dyn BackingStore> = Arc::new(SyncBacking(root.namespace(name)));
        Some(store)
    })
}
