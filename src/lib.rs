//! reclaim-cache: a concurrent, sharded key-value cache whose entries can
//! be reclaimed out from under it, with single-flight loading and
//! exactly-once removal notification.
//!
//! Internal Design:
//!
//! Summary
//! - Goal: a cache whose entries may become invalid at any time (memory
//!   pressure, the last outside reference going away, a deadline) while
//!   lookups stay correct and the map never grows dead rows without bound.
//! - Layers:
//!   - EntryTable<K, V>: per-shard row storage. Rows have stable
//!     generational handles and can be detached from the key index while
//!     their slot stays alive.
//!   - CacheEntry<V> + ReclaimHandle: one entry and its one-shot
//!     invalidation switch. Whoever flips the switch first posts a notice
//!     to the reclamation queue; later flips do nothing.
//!   - ReclamationPolicy: decides when to flip switches (`SoftPolicy`,
//!     `WeakPolicy`, `TtlPolicy`, `ManualPolicy` or a custom one).
//!   - Cache<K, V, S>: public facade. Shards rows across `RwLock`s, runs
//!     single-flight loads and drains the queue in a cleanup pass.
//!
//! Constraints
//! - `Send + Sync`; every operation may be called from any thread.
//! - A reclaimed entry is never returned, even before it is cleaned up.
//! - Each entry is announced to the removal listener at most once, after
//!   its row is gone.
//! - Each row stores its precomputed hash; `K: Hash` runs once per call.
//!
//! Reentrancy policy
//! - Shard locks are held only around table mutations. Loaders, listeners
//!   and value drops run with no shard lock held.
//! - At most one cleanup pass runs at a time. A call arriving while a pass
//!   runs (including a call made from a listener) skips its own pass.
//! - A loader must not wait on its own key. Debug builds detect a loader
//!   re-entering `get_with` for the key it is loading and panic.
//! - `remove_if` runs its predicate under a shard's write lock; the
//!   predicate must not call the cache.
//!
//! Notes and non-goals
//! - No background threads; cleanup is amortized over caller operations
//!   and can be forced with `run_pending`.
//! - No persistence, statistics or refresh-ahead.
//! - Loader errors are shared by waiters as `Arc<E>` and never cached.

mod cache;
mod config;
mod entry;
mod entry_table;
mod entry_table_proptest;
mod error;
mod listener;
mod load;
mod policy;
mod reclaim;
mod reentrancy;

pub use cache::Cache;
pub use config::{new_soft_cache, new_weak_cache, CacheBuilder};
pub use error::{CacheError, CacheResult};
pub use listener::{ListenerPanic, RemovalListener};
pub use policy::{ManualPolicy, ReclamationPolicy, SoftPolicy, Strength, TtlPolicy, WeakPolicy};
pub use reclaim::{EntryId, ReclaimHandle, RemovalCause};
