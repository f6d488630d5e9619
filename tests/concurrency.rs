// Multi-threaded cache tests.
//
// - Single-load: concurrent callers for one missing key run one loader and
//   all observe its result, success or failure.
// - Independence: loads for different keys do not wait on each other.
// - Exactly-once: racing reclaimers and removers produce one notification
//   per entry.
use parking_lot::Mutex;
use reclaim_cache::{
    new_soft_cache, Cache, CacheBuilder, ReclaimHandle, ReclamationPolicy, RemovalCause, SoftPolicy,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::Duration;

const THREADS: usize = 8;

// Test: single-load under contention.
// Verifies: one loader invocation; every caller gets the same value.
#[test]
fn concurrent_callers_share_one_load() {
    let cache: Arc<Cache<String, Arc<String>>> = Arc::new(new_soft_cache());
    let calls = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(THREADS));

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let (cache, calls, barrier) = (cache.clone(), calls.clone(), barrier.clone());
            thread::spawn(move || {
                barrier.wait();
                cache.get_with("k".to_string(), || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(50));
                    Some(Arc::new("loaded".to_string()))
                })
            })
        })
        .collect();

    let results: Vec<Arc<String>> = workers
        .into_iter()
        .map(|w| w.join().expect("worker").expect("value"))
        .collect();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for r in &results {
        assert!(Arc::ptr_eq(r, &results[0]));
    }
    assert_eq!(cache.size(), 1);
}

// Test: a failing load is observed by every waiter.
// Assumes: waiters join while the leader's loader is still running.
// Verifies: one invocation; every caller receives the same Arc'd error and
// nothing is cached.
#[test]
fn loader_failure_reaches_all_waiters() {
    let cache: Arc<Cache<String, i32>> = Arc::new(new_soft_cache());
    let calls = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(THREADS));

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let (cache, calls, barrier) = (cache.clone(), calls.clone(), barrier.clone());
            thread::spawn(move || {
                barrier.wait();
                cache.try_get_with("k".to_string(), || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(100));
                    Err::<Option<i32>, String>("unavailable".to_string())
                })
            })
        })
        .collect();

    let errors: Vec<Arc<String>> = workers
        .into_iter()
        .map(|w| w.join().expect("worker").unwrap_err())
        .collect();
    // Every thread passed the barrier before the 100ms load finished, so
    // none of them could have started a second load.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for e in &errors {
        assert!(Arc::ptr_eq(e, &errors[0]));
        assert_eq!(e.as_str(), "unavailable");
    }
    assert_eq!(cache.size(), 0);
    assert_eq!(cache.get("k"), None);
}

// Test: a slow load does not block a different key.
// Verifies: a second key loads and returns while the first is in flight.
#[test]
fn different_keys_load_in_parallel() {
    let cache: Arc<Cache<String, i32>> = Arc::new(new_soft_cache());
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let slow = {
        let cache = cache.clone();
        thread::spawn(move || {
            cache.get_with("slow".to_string(), move || {
                started_tx.send(()).expect("signal");
                release_rx.recv().expect("release");
                Some(1)
            })
        })
    };

    started_rx.recv().expect("slow load started");
    assert_eq!(cache.get_with("fast".to_string(), || Some(2)), Some(2));
    assert_eq!(cache.get("slow"), None, "in-flight load is not an entry");
    assert_eq!(cache.size(), 1);

    release_tx.send(()).expect("release");
    assert_eq!(slow.join().expect("slow worker"), Some(1));
    assert_eq!(cache.get("slow"), Some(1));
    assert_eq!(cache.size(), 2);
}

// Test: a panicking loader does not strand its waiters.
// Verifies: the waiter retries, runs its own loader and gets a value.
#[test]
fn waiter_retries_after_leader_panics() {
    let cache: Arc<Cache<String, i32>> = Arc::new(new_soft_cache());
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let leader = {
        let cache = cache.clone();
        thread::spawn(move || {
            cache.get_with("k".to_string(), move || {
                started_tx.send(()).expect("signal");
                release_rx.recv().expect("release");
                panic!("leader loader failed")
            })
        })
    };
    started_rx.recv().expect("leader started");

    let waiter = {
        let cache = cache.clone();
        thread::spawn(move || cache.get_with("k".to_string(), || Some(5)))
    };
    thread::sleep(Duration::from_millis(20));
    release_tx.send(()).expect("release");

    assert!(leader.join().is_err());
    assert_eq!(waiter.join().expect("waiter"), Some(5));
    assert_eq!(cache.get("k"), Some(5));
}

// Test: racing removal paths.
// Verifies: explicit removes racing with cache and policy reclamation
// still deliver exactly one notification per entry.
#[test]
fn racing_removals_notify_once_per_entry() {
    let notified = Arc::new(Mutex::new(Vec::new()));
    let sink = notified.clone();
    let policy = Arc::new(SoftPolicy::new());
    let cache: Arc<Cache<u32, u32>> = Arc::new(
        CacheBuilder::soft()
            .shards(4)
            .policy(policy.clone())
            .listener(move |_, k: &u32, cause| sink.lock().push((*k, cause)))
            .build(),
    );
    const KEYS: u32 = 64;
    for k in 0..KEYS {
        cache.put(k, k);
    }

    let barrier = Arc::new(Barrier::new(3));
    let remover = {
        let (cache, barrier) = (cache.clone(), barrier.clone());
        thread::spawn(move || {
            barrier.wait();
            (0..KEYS).filter(|k| cache.remove(k).is_some()).count()
        })
    };
    let reclaimer = {
        let (cache, barrier) = (cache.clone(), barrier.clone());
        thread::spawn(move || {
            barrier.wait();
            (0..KEYS).filter(|k| cache.reclaim(k)).count()
        })
    };
    let relief = {
        let (policy, barrier) = (policy.clone(), barrier.clone());
        thread::spawn(move || {
            barrier.wait();
            policy.relieve(KEYS as usize / 2)
        })
    };
    remover.join().expect("remover");
    reclaimer.join().expect("reclaimer");
    relief.join().expect("relief");

    assert_eq!(cache.size(), 0);
    let mut seen = notified.lock().clone();
    seen.sort_by_key(|(k, _)| *k);
    let keys: Vec<u32> = seen.iter().map(|(k, _)| *k).collect();
    assert_eq!(keys, (0..KEYS).collect::<Vec<_>>());
    assert!(seen
        .iter()
        .all(|(_, c)| matches!(c, RemovalCause::Explicit | RemovalCause::Reclaimed)));
}

// Counts admissions so a test can compare entries created with entries
// announced as removed.
#[derive(Default)]
struct Admissions(AtomicUsize);

impl<K, V> ReclamationPolicy<K, V> for Admissions {
    fn name(&self) -> &'static str {
        "admissions"
    }

    fn admit(&self, _key: &K, _value: &V, _handle: &ReclaimHandle) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

// Test: mixed traffic from many threads.
// Verifies: after clearing, every entry that was ever created has been
// announced exactly once and nothing is left queued.
#[test]
fn mixed_workload_accounts_for_every_entry() {
    let removed = Arc::new(AtomicUsize::new(0));
    let sink = removed.clone();
    let admissions = Arc::new(Admissions::default());
    let cache: Arc<Cache<u32, u64>> = Arc::new(
        CacheBuilder::soft()
            .shards(8)
            .policy(admissions.clone())
            .listener(move |_, _: &u32, _| {
                sink.fetch_add(1, Ordering::SeqCst);
            })
            .build(),
    );
    let barrier = Arc::new(Barrier::new(THREADS));
    let workers: Vec<_> = (0..THREADS as u64)
        .map(|t| {
            let (cache, barrier) = (cache.clone(), barrier.clone());
            thread::spawn(move || {
                barrier.wait();
                for i in 0..500u64 {
                    let k = ((i * 7 + t) % 32) as u32;
                    match i % 5 {
                        0 => {
                            cache.put(k, i);
                        }
                        1 => {
                            cache.remove(&k);
                        }
                        2 => {
                            cache.get_with(k, || Some(i));
                        }
                        3 => {
                            cache.reclaim(&k);
                        }
                        _ => {
                            cache.get(&k);
                        }
                    }
                }
            })
        })
        .collect();
    for w in workers {
        w.join().expect("worker");
    }

    cache.clear();
    assert_eq!(cache.size(), 0);
    assert_eq!(cache.pending(), 0);
    assert_eq!(
        removed.load(Ordering::SeqCst),
        admissions.0.load(Ordering::SeqCst)
    );
}
