//! Reclamation policies.
//!
//! A policy decides when a live entry should be invalidated. The cache tells
//! it about every entry it installs (`admit`), every read hit (`touch`) and
//! every entry that dies (`forget`, when the cache kills it and again when
//! the cleanup pass deletes its row), and gives it a chance to
//! act at the start of each cleanup pass (`poll`). To invalidate an entry a
//! policy calls `ReclaimHandle::reclaim`, which queues the notice without
//! blocking; the next cleanup pass removes the row and notifies the
//! listener.
//!
//! Lock order: the cache may call `admit` while holding a shard lock, so a
//! policy must never call back into the cache from these hooks.
//!
//! Provided policies:
//! - `SoftPolicy`: entries survive until pressure. Pressure is either a
//!   configured capacity bound or an explicit `relieve(n)` call; the least
//!   recently used entries go first.
//! - `WeakPolicy`: for `Arc<T>` values; an entry is reclaimed once the cache
//!   holds the only strong reference to its value.
//! - `TtlPolicy`: entries expire a fixed time after insertion.
//! - `ManualPolicy`: an external reclaimer invalidates entries by key.

use hashbrown::HashMap;
use lru::LruCache;
use parking_lot::Mutex;
use std::borrow::Borrow;
use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::trace;

use crate::reclaim::{EntryId, ReclaimHandle, RemovalCause};

/// How eagerly entries become eligible for reclamation.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum Strength {
    /// Kept until the policy sees real pressure.
    #[default]
    Soft,
    /// Reclaimed as soon as nothing outside the cache holds the value.
    Weak,
}

pub trait ReclamationPolicy<K, V>: Send + Sync {
    /// Short name used in logs and `Cache::policy_name`.
    fn name(&self) -> &'static str;

    fn strength(&self) -> Strength {
        Strength::Soft
    }

    /// A new live entry was installed for `key`.
    fn admit(&self, key: &K, value: &V, handle: &ReclaimHandle);

    /// A live entry was read.
    fn touch(&self, _id: EntryId) {}

    /// The entry for `id` is dead and its row is gone or about to be; drop
    /// any bookkeeping for it. May be called more than once per entry.
    fn forget(&self, _id: EntryId) {}

    /// Called at the start of every cleanup pass.
    fn poll(&self) {}
}

/// Least-recently-used soft reclamation.
pub struct SoftPolicy {
    capacity: Option<usize>,
    order: Mutex<LruCache<EntryId, ReclaimHandle>>,
}

impl SoftPolicy {
    /// Never reclaims on its own; only `relieve` sheds entries.
    pub fn new() -> Self {
        Self {
            capacity: None,
            order: Mutex::new(LruCache::unbounded()),
        }
    }

    /// Reclaims least recently used entries whenever more than `capacity`
    /// entries are tracked.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity.max(1)),
            order: Mutex::new(LruCache::unbounded()),
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Signal memory pressure: reclaim up to `n` least recently used live
    /// entries. Returns how many were reclaimed.
    pub fn relieve(&self, n: usize) -> usize {
        let mut order = self.order.lock();
        let mut reclaimed = 0;
        while reclaimed < n {
            let Some((id, handle)) = order.pop_lru() else {
                break;
            };
            if handle.reclaim(RemovalCause::Reclaimed) {
                trace!(?id, "soft entry reclaimed under pressure");
                reclaimed += 1;
            }
        }
        reclaimed
    }

    /// Entries currently tracked. The cache forgets an entry as soon as it
    /// kills it, so only entries reclaimed from outside the cache linger here
    /// until the next cleanup pass.
    pub fn tracked(&self) -> usize {
        self.order.lock().len()
    }
}

impl Default for SoftPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> ReclamationPolicy<K, V> for SoftPolicy {
    fn name(&self) -> &'static str {
        "soft"
    }

    fn admit(&self, _key: &K, _value: &V, handle: &ReclaimHandle) {
        let mut order = self.order.lock();
        order.push(handle.id(), handle.clone());
        if let Some(cap) = self.capacity {
            while order.len() > cap {
                let Some((id, victim)) = order.pop_lru() else {
                    break;
                };
                if victim.reclaim(RemovalCause::Reclaimed) {
                    trace!(?id, capacity = cap, "soft entry reclaimed over capacity");
                }
            }
        }
    }

    fn touch(&self, id: EntryId) {
        self.order.lock().promote(&id);
    }

    fn forget(&self, id: EntryId) {
        self.order.lock().pop(&id);
    }
}

/// Entries visited per `poll` by `WeakPolicy`.
const WEAK_SCAN_BATCH: usize = 64;

/// Strong-count based weak reclamation for `Arc<T>` values.
///
/// Entries are checked round-robin, at most a fixed batch per cleanup pass,
/// so an unreferenced value is reclaimed within a bounded number of cache
/// calls rather than immediately.
pub struct WeakPolicy<T> {
    ring: Mutex<VecDeque<(Weak<T>, ReclaimHandle)>>,
}

impl<T> WeakPolicy<T> {
    pub fn new() -> Self {
        Self {
            ring: Mutex::new(VecDeque::new()),
        }
    }

    /// Check every tracked entry now instead of one batch.
    pub fn sweep(&self) -> usize {
        let mut ring = self.ring.lock();
        let n = ring.len();
        Self::scan(&mut ring, n)
    }

    fn scan(ring: &mut VecDeque<(Weak<T>, ReclaimHandle)>, budget: usize) -> usize {
        let mut reclaimed = 0;
        for _ in 0..budget.min(ring.len()) {
            let Some((weak, handle)) = ring.pop_front() else {
                break;
            };
            if handle.is_reclaimed() {
                continue;
            }
            // The cache's own copy accounts for one strong reference.
            if weak.strong_count() <= 1 {
                if handle.reclaim(RemovalCause::Reclaimed) {
                    trace!(id = ?handle.id(), "weak entry reclaimed");
                    reclaimed += 1;
                }
                continue;
            }
            ring.push_back((weak, handle));
        }
        reclaimed
    }
}

impl<T> Default for WeakPolicy<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> ReclamationPolicy<K, Arc<T>> for WeakPolicy<T>
where
    T: Send + Sync,
{
    fn name(&self) -> &'static str {
        "weak"
    }

    fn strength(&self) -> Strength {
        Strength::Weak
    }

    fn admit(&self, _key: &K, value: &Arc<T>, handle: &ReclaimHandle) {
        self.ring
            .lock()
            .push_back((Arc::downgrade(value), handle.clone()));
    }

    fn poll(&self) {
        let mut ring = self.ring.lock();
        Self::scan(&mut ring, WEAK_SCAN_BATCH);
    }
}

/// Stale deadlines tolerated beyond twice the live count before compacting.
const TTL_SLACK: usize = 16;

struct TtlState {
    // Insertion order is deadline order.
    deadlines: VecDeque<(Instant, EntryId)>,
    live: HashMap<EntryId, ReclaimHandle>,
}

impl TtlState {
    // Drop deadlines of entries that died before expiring.
    fn compact(&mut self) {
        if self.deadlines.len() <= 2 * self.live.len() + TTL_SLACK {
            return;
        }
        let TtlState { deadlines, live } = self;
        deadlines.retain(|(_, id)| live.contains_key(id));
    }
}

/// Time-to-live expiry measured from insertion.
pub struct TtlPolicy {
    ttl: Duration,
    state: Mutex<TtlState>,
}

impl TtlPolicy {
    /// Entries expire `ttl` after they are installed. Expiry is noticed by
    /// the first cleanup pass after the deadline.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: Mutex::new(TtlState {
                deadlines: VecDeque::new(),
                live: HashMap::new(),
            }),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Entries with a pending deadline.
    pub fn tracked(&self) -> usize {
        self.state.lock().live.len()
    }

    #[cfg(test)]
    fn queued_deadlines(&self) -> usize {
        self.state.lock().deadlines.len()
    }
}

impl<K, V> ReclamationPolicy<K, V> for TtlPolicy {
    fn name(&self) -> &'static str {
        "ttl"
    }

    fn admit(&self, _key: &K, _value: &V, handle: &ReclaimHandle) {
        let mut st = self.state.lock();
        // Taken under the lock so deadlines stay ordered.
        let deadline = Instant::now() + self.ttl;
        st.deadlines.push_back((deadline, handle.id()));
        st.live.insert(handle.id(), handle.clone());
        st.compact();
    }

    fn forget(&self, id: EntryId) {
        let mut st = self.state.lock();
        if st.live.remove(&id).is_some() {
            st.compact();
        }
    }

    fn poll(&self) {
        let mut st = self.state.lock();
        let now = Instant::now();
        while let Some(&(deadline, id)) = st.deadlines.front() {
            if st.live.contains_key(&id) && deadline > now {
                break;
            }
            st.deadlines.pop_front();
            if let Some(handle) = st.live.remove(&id) {
                if handle.reclaim(RemovalCause::Expired) {
                    trace!(?id, "entry expired");
                }
            }
        }
    }
}

struct ManualState<K> {
    by_key: HashMap<K, ReclaimHandle>,
    keys: HashMap<EntryId, K>,
}

/// Reclamation driven entirely from outside: whoever holds the policy
/// decides which keys to invalidate. Useful for embedding runtimes with
/// their own collector, and for simulating reclamation in tests.
pub struct ManualPolicy<K> {
    state: Mutex<ManualState<K>>,
}

impl<K> ManualPolicy<K>
where
    K: Eq + Hash + Clone,
{
    /// Tracks nothing until entries are admitted; never reclaims on its own.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ManualState {
                by_key: HashMap::new(),
                keys: HashMap::new(),
            }),
        }
    }

    /// Invalidate the current entry for `key`. Returns false if there is no
    /// tracked live entry.
    pub fn reclaim<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let state = self.state.lock();
        state
            .by_key
            .get(key)
            .map(|h| h.reclaim(RemovalCause::Reclaimed))
            .unwrap_or(false)
    }

    pub fn tracked(&self) -> usize {
        self.state.lock().by_key.len()
    }
}

impl<K> Default for ManualPolicy<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> ReclamationPolicy<K, V> for ManualPolicy<K>
where
    K: Eq + Hash + Clone + Send,
{
    fn name(&self) -> &'static str {
        "manual"
    }

    fn admit(&self, key: &K, _value: &V, handle: &ReclaimHandle) {
        let mut state = self.state.lock();
        state.keys.insert(handle.id(), key.clone());
        state.by_key.insert(key.clone(), handle.clone());
    }

    fn forget(&self, id: EntryId) {
        let mut state = self.state.lock();
        let Some(key) = state.keys.remove(&id) else {
            return;
        };
        if state.by_key.get(&key).is_some_and(|h| h.id() == id) {
            state.by_key.remove(&key);
        }
    }
}
