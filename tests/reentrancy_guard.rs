// Reentrancy tests for loaders and removal listeners.
//
// - A loader that waits on its own key is detected in debug builds.
// - Loaders may load other keys; listeners may call back into the cache.
// - A panicking listener is either isolated (the pass continues) or
//   propagated (the pass stops; undrained notices stay queued).
use parking_lot::Mutex;
use reclaim_cache::{Cache, CacheBuilder, ListenerPanic, RemovalCause};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

#[cfg(debug_assertions)]
#[test]
fn reentrant_load_of_same_key_panics_in_debug() {
    let cache: Cache<String, i32> = CacheBuilder::soft().build();
    let res = panic::catch_unwind(AssertUnwindSafe(|| {
        cache.get_with("k".to_string(), || cache.get_with("k".to_string(), || Some(1)))
    }));
    assert!(res.is_err(), "expected reentrant load to panic in debug builds");
    // The outer load was abandoned; the key is usable again.
    assert_eq!(cache.get_with("k".to_string(), || Some(2)), Some(2));
}

#[test]
fn nested_load_of_other_key_is_fine() {
    let cache: Cache<String, i32> = CacheBuilder::soft().build();
    let v = cache.get_with("outer".to_string(), || {
        let inner = cache.get_with("inner".to_string(), || Some(1))?;
        Some(inner + 1)
    });
    assert_eq!(v, Some(2));
    assert_eq!(cache.get("inner"), Some(1));
    assert_eq!(cache.get("outer"), Some(2));
}

// Listener panics on key "bad" and records every other key.
fn flaky_cache(policy: ListenerPanic) -> (Cache<String, i32>, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let cache = CacheBuilder::soft()
        .shards(1)
        .listener(move |_, k: &String, _: RemovalCause| {
            if k == "bad" {
                panic!("listener rejected {k}");
            }
            sink.lock().push(k.clone());
        })
        .listener_panic(policy)
        .build();
    (cache, seen)
}

#[test]
fn isolated_listener_panic_does_not_stop_the_pass() {
    let (cache, seen) = flaky_cache(ListenerPanic::Isolate);
    for k in ["a", "bad", "c"] {
        cache.put(k.to_string(), 1);
    }
    // Queue all three notices, then drain them in one pass.
    for k in ["a", "bad", "c"] {
        assert!(cache.reclaim(k));
    }
    assert_eq!(cache.pending(), 3);
    assert_eq!(cache.run_pending(), 3);

    let mut seen = seen.lock().clone();
    seen.sort();
    assert_eq!(seen, vec!["a".to_string(), "c".to_string()]);
    assert_eq!(cache.size(), 0);
}

#[test]
fn propagated_listener_panic_stops_the_pass() {
    let (cache, seen) = flaky_cache(ListenerPanic::Propagate);
    cache.put("bad".to_string(), 1);
    cache.put("a".to_string(), 2);
    // Notices are applied in queue order: "bad" first.
    assert!(cache.reclaim("bad"));
    assert!(cache.reclaim("a"));

    let res = panic::catch_unwind(AssertUnwindSafe(|| cache.run_pending()));
    assert!(res.is_err(), "listener panic should reach the caller");
    assert!(seen.lock().is_empty());
    assert_eq!(cache.pending(), 1, "undrained notice stays queued");

    // The gate was released by the unwind; the next pass delivers the rest.
    assert_eq!(cache.run_pending(), 1);
    assert_eq!(*seen.lock(), vec!["a".to_string()]);
    assert_eq!(cache.size(), 0);
}
