//! Cache construction.
//!
//! There is no process-wide default cache; every cache is built explicitly
//! with [`CacheBuilder`] or one of the `new_*_cache` factories, so its
//! lifetime and configuration belong to the caller.
//!
//! # Example
//!
//! ```
//! use reclaim_cache::{CacheBuilder, ListenerPanic};
//!
//! let cache = CacheBuilder::<String, u32>::soft()
//!     .initial_capacity(256)
//!     .listener(|_cache, key: &String, cause| {
//!         println!("{key} left the cache: {cause:?}");
//!     })
//!     .listener_panic(ListenerPanic::Isolate)
//!     .build();
//! cache.put("a".to_string(), 1);
//! assert_eq!(cache.get("a"), Some(1));
//! ```

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;

use crate::cache::Cache;
use crate::listener::{ListenerPanic, RemovalListener};
use crate::policy::{ReclamationPolicy, SoftPolicy, WeakPolicy};
use crate::reclaim::RemovalCause;

/// Shards per available core when no explicit count is configured.
const SHARDS_PER_CORE: usize = 4;
const FALLBACK_SHARDS: usize = 16;

/// Builder for [`Cache`].
pub struct CacheBuilder<K, V, S = RandomState> {
    pub(crate) initial_capacity: Option<usize>,
    pub(crate) shards: Option<usize>,
    pub(crate) policy: Arc<dyn ReclamationPolicy<K, V>>,
    pub(crate) listener: Option<Arc<dyn RemovalListener<K, V, S>>>,
    pub(crate) listener_panic: ListenerPanic,
    pub(crate) hasher: S,
}

impl<K, V> CacheBuilder<K, V, RandomState>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Soft entries: kept until the policy sees pressure. Without further
    /// configuration nothing is reclaimed automatically.
    pub fn soft() -> Self {
        Self::with_hasher(RandomState::new())
    }
}

impl<K, T> CacheBuilder<K, Arc<T>, RandomState>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    /// Weak entries: reclaimed once the cache holds the only reference to
    /// the value.
    pub fn weak() -> Self {
        Self::with_hasher(RandomState::new()).policy(Arc::new(WeakPolicy::<T>::new()))
    }
}

impl<K, V, S> CacheBuilder<K, V, S>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Send + Sync + 'static,
{
    /// Soft builder using a custom hasher.
    pub fn with_hasher(hasher: S) -> Self {
        Self {
            initial_capacity: None,
            shards: None,
            policy: Arc::new(SoftPolicy::new()),
            listener: None,
            listener_panic: ListenerPanic::default(),
            hasher,
        }
    }

    /// Capacity hint spread across shards.
    pub fn initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = Some(capacity);
        self
    }

    /// Number of independently locked shards; rounded up to a power of two.
    pub fn shards(mut self, shards: usize) -> Self {
        self.shards = Some(shards);
        self
    }

    /// Replace the reclamation policy. Keep a clone of the `Arc` to drive
    /// policies such as [`SoftPolicy::relieve`] or
    /// [`ManualPolicy::reclaim`](crate::ManualPolicy::reclaim).
    pub fn policy<P>(mut self, policy: Arc<P>) -> Self
    where
        P: ReclamationPolicy<K, V> + 'static,
    {
        self.policy = policy;
        self
    }

    /// Install a closure as the removal listener. It runs once per removed
    /// entry, after the cleanup pass has deleted the row.
    pub fn listener<F>(mut self, listener: F) -> Self
    where
        F: Fn(&Cache<K, V, S>, &K, RemovalCause) + Send + Sync + 'static,
    {
        self.listener = Some(Arc::new(listener));
        self
    }

    /// Install a shared [`RemovalListener`] implementation.
    pub fn removal_listener<L>(mut self, listener: Arc<L>) -> Self
    where
        L: RemovalListener<K, V, S> + 'static,
    {
        self.listener = Some(listener);
        self
    }

    /// What a cleanup pass does when the listener panics. Defaults to
    /// [`ListenerPanic::Isolate`].
    pub fn listener_panic(mut self, policy: ListenerPanic) -> Self {
        self.listener_panic = policy;
        self
    }

    pub(crate) fn shard_count(&self) -> usize {
        match self.shards {
            Some(n) => n.max(1).next_power_of_two(),
            None => std::thread::available_parallelism()
                .map(|n| (n.get() * SHARDS_PER_CORE).next_power_of_two())
                .unwrap_or(FALLBACK_SHARDS),
        }
    }

    pub fn build(self) -> Cache<K, V, S> {
        Cache::from_builder(self)
    }
}

/// A soft cache with default settings.
pub fn new_soft_cache<K, V>() -> Cache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    CacheBuilder::soft().build()
}

/// A weak cache with default settings.
pub fn new_weak_cache<K, T>() -> Cache<K, Arc<T>>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    CacheBuilder::weak().build()
}
