//! Cache facade and cleanup pass.
//!
//! Every operation hashes its key once, picks a shard from the hash and
//! works on that shard's `EntryTable` under its lock. Nothing user-supplied
//! runs under a shard lock except `K: Eq`, value drops are deferred until
//! the lock is released, and loaders and listeners always run unlocked.
//!
//! Removal never deletes rows directly. It tombstones the entry (or, for
//! `put`, detaches the old row and links a new one) and the entry's
//! `ReclaimHandle` queues a notice. The cleanup pass at the end of each
//! operation is the only code that deletes rows and fires the listener.

use parking_lot::RwLock;
use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::convert::Infallible;
use std::hash::{BuildHasher, Hash};
use std::panic;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

use crate::config::CacheBuilder;
use crate::entry::{CacheEntry, Retired, Slot};
use crate::entry_table::{EntryTable, Handle};
use crate::error::{CacheError, CacheResult};
use crate::listener::{guarded, panic_message, ListenerPanic, RemovalListener};
use crate::load::{LoadCell, SharedError, Waited};
use crate::policy::{ReclamationPolicy, Strength};
use crate::reclaim::{EntryId, Notice, ReclaimHandle, ReclamationQueue, RemovalCause};
use crate::reentrancy::CleanupGate;

struct Shard<K, V> {
    rows: EntryTable<K, Slot<V>>,
    // Linked rows that hold an in-flight load rather than an entry.
    loading: usize,
}

impl<K, V> Shard<K, V> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            rows: EntryTable::with_capacity(capacity),
            loading: 0,
        }
    }

    fn entries(&self) -> usize {
        self.rows.len() - self.loading
    }

    /// Unlink a row so a new one can take its key. A dead entry keeps its
    /// slot until its notice is applied; an in-flight load is superseded.
    fn detach(&mut self, h: Handle) {
        if self.rows.detach(h) && matches!(self.rows.value(h), Some(Slot::Loading(_))) {
            self.loading -= 1;
        }
    }

    /// Retire whatever row is linked for the key, ahead of linking a new one.
    fn retire_linked<Q>(
        &mut self,
        hash: u64,
        key: &Q,
        cause: RemovalCause,
    ) -> Option<(EntryId, Retired<V>)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
    {
        let h = self.rows.find(hash, key)?;
        let retired = match self.rows.value_mut(h) {
            Some(Slot::Ready(entry)) => Some((entry.id(), entry.tombstone(cause))),
            _ => None,
        };
        self.detach(h);
        retired
    }

    /// The load for `h` finished; returns true if its row is still linked.
    fn finish_loading(&mut self, h: Handle) -> bool {
        let linked = self.rows.is_linked(h);
        if linked {
            self.loading -= 1;
        }
        linked
    }

    /// Delete the row a notice refers to. Rows holding an in-flight load are
    /// never the subject of a notice and are left alone.
    fn remove_dead(&mut self, h: Handle) -> Option<(K, Slot<V>)> {
        match self.rows.value(h) {
            Some(Slot::Ready(_)) => self.rows.remove(h),
            _ => None,
        }
    }
}

enum Claim<V> {
    Hit(V, EntryId),
    Wait(Arc<LoadCell<V>>),
    Lead(Handle, Arc<LoadCell<V>>),
}

/// Concurrent cache with reclaimable entries, single-flight loading and
/// exactly-once removal notification.
///
/// Build one with [`CacheBuilder`], [`new_soft_cache`](crate::new_soft_cache)
/// or [`new_weak_cache`](crate::new_weak_cache).
pub struct Cache<K, V, S = RandomState> {
    shards: Box<[RwLock<Shard<K, V>>]>,
    mask: usize,
    hasher: S,
    queue: ReclamationQueue,
    gate: CleanupGate,
    policy: Arc<dyn ReclamationPolicy<K, V>>,
    listener: Option<Arc<dyn RemovalListener<K, V, S>>>,
    listener_panic: ListenerPanic,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Soft builder with the default hasher; same as [`CacheBuilder::soft`].
    pub fn builder() -> CacheBuilder<K, V> {
        CacheBuilder::soft()
    }
}

impl<K, V, S> Cache<K, V, S>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Send + Sync + 'static,
{
    pub(crate) fn from_builder(builder: CacheBuilder<K, V, S>) -> Self {
        let n = builder.shard_count();
        let per_shard = builder
            .initial_capacity
            .map(|c| c.div_ceil(n))
            .unwrap_or(0);
        let shards: Box<[_]> = (0..n)
            .map(|_| RwLock::new(Shard::with_capacity(per_shard)))
            .collect();
        debug!(
            shards = n,
            policy = builder.policy.name(),
            "reclaiming cache created"
        );
        Self {
            shards,
            mask: n - 1,
            hasher: builder.hasher,
            queue: ReclamationQueue::new(),
            gate: CleanupGate::new(),
            policy: builder.policy,
            listener: builder.listener,
            listener_panic: builder.listener_panic,
        }
    }

    fn make_hash<Q>(&self, q: &Q) -> u64
    where
        Q: ?Sized + Hash,
    {
        self.hasher.hash_one(q)
    }

    fn shard_index(&self, hash: u64) -> usize {
        // Low bits index the table inside the shard; use high bits here.
        (hash >> 32) as usize & self.mask
    }

    /// Build a live entry for a row being linked, and register it with the
    /// policy. Runs under the shard's write lock.
    fn new_entry(&self, shard: usize, row: Handle, key: &K, value: V) -> CacheEntry<V> {
        let handle = ReclaimHandle::new(EntryId::new(shard, row), self.queue.sender());
        self.policy.admit(key, &value, &handle);
        CacheEntry::new(value, handle)
    }

    /// Clone the live value for `key` under the shard's read lock.
    fn lookup_live<Q>(&self, shard_idx: usize, hash: u64, key: &Q) -> Option<(V, EntryId)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
    {
        let shard = self.shards[shard_idx].read();
        shard
            .rows
            .find(hash, key)
            .and_then(|h| match shard.rows.value(h) {
                Some(Slot::Ready(entry)) => entry.live_value().map(|v| (v.clone(), entry.id())),
                _ => None,
            })
    }

    /// The value for `key`, if a live entry exists.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let hash = self.make_hash(key);
        let found = self.lookup_live(self.shard_index(hash), hash, key);
        let value = found.map(|(v, id)| {
            self.policy.touch(id);
            v
        });
        self.run_pending();
        value
    }

    /// True if a live entry exists for `key`.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let hash = self.make_hash(key);
        let present = {
            let shard = self.shards[self.shard_index(hash)].read();
            shard
                .rows
                .find(hash, key)
                .and_then(|h| match shard.rows.value(h) {
                    Some(Slot::Ready(entry)) => entry.live_value().map(|_| ()),
                    _ => None,
                })
                .is_some()
        };
        self.run_pending();
        present
    }

    /// The value for `key`, loading it with `loader` if absent.
    ///
    /// Concurrent callers for the same missing key share a single loader
    /// invocation. A `None` result is returned but not stored.
    ///
    /// `loader` must not call `get_with`/`try_get_with` for the same key on
    /// this cache: the nested call would wait for its own load. Debug builds
    /// detect this and panic; release builds deadlock.
    pub fn get_with<F>(&self, key: K, loader: F) -> Option<V>
    where
        F: FnOnce() -> Option<V>,
    {
        match self.try_get_with(key, || Ok::<_, Infallible>(loader())) {
            Ok(v) => v,
            Err(never) => match *never {},
        }
    }

    /// Like [`get_with`](Self::get_with) for a fallible loader.
    ///
    /// An error is not cached; the next call runs a loader again. Every
    /// caller waiting on the failed load receives the same `Arc`'d error. A
    /// waiter whose own loader has a different error type retries the load
    /// instead.
    pub fn try_get_with<F, E>(&self, key: K, loader: F) -> Result<Option<V>, Arc<E>>
    where
        F: FnOnce() -> Result<Option<V>, E>,
        E: Send + Sync + 'static,
    {
        let hash = self.make_hash(&key);
        let shard = self.shard_index(hash);
        let outcome = loop {
            if let Some((value, id)) = self.lookup_live(shard, hash, &key) {
                self.policy.touch(id);
                break Ok(Some(value));
            }
            match self.claim(shard, hash, &key) {
                Claim::Hit(value, id) => {
                    self.policy.touch(id);
                    break Ok(Some(value));
                }
                Claim::Wait(cell) => match cell.wait() {
                    Waited::Loaded(value) => break Ok(value),
                    Waited::Failed(err) => match err.downcast::<E>() {
                        Ok(err) => break Err(err),
                        Err(_) => continue,
                    },
                    Waited::Abandoned => continue,
                },
                Claim::Lead(row, cell) => break self.lead(shard, row, &cell, loader),
            }
        };
        self.run_pending();
        outcome
    }

    /// Find a live value, join an in-flight load, or link a loading row and
    /// become its leader. Re-checks under the write lock after a read-locked
    /// miss.
    fn claim(&self, shard_idx: usize, hash: u64, key: &K) -> Claim<V> {
        let mut shard = self.shards[shard_idx].write();
        if let Some(h) = shard.rows.find(hash, key) {
            match shard.rows.value(h) {
                Some(Slot::Ready(entry)) => {
                    if let Some(v) = entry.live_value() {
                        return Claim::Hit(v.clone(), entry.id());
                    }
                }
                Some(Slot::Loading(cell)) => return Claim::Wait(cell.clone()),
                None => {}
            }
            // Dead entry awaiting cleanup.
            shard.detach(h);
        }
        let cell = Arc::new(LoadCell::new());
        let row = shard
            .rows
            .insert_unique_with(hash, key.clone(), |_, _| Slot::Loading(cell.clone()));
        shard.loading += 1;
        Claim::Lead(row, cell)
    }

    fn lead<F, E>(
        &self,
        shard: usize,
        row: Handle,
        cell: &LoadCell<V>,
        loader: F,
    ) -> Result<Option<V>, Arc<E>>
    where
        F: FnOnce() -> Result<Option<V>, E>,
        E: Send + Sync + 'static,
    {
        let mut pending = PendingLoad {
            cache: self,
            shard,
            row: Some(row),
            cell,
        };
        let outcome = loader();
        match outcome {
            Ok(Some(value)) => {
                self.install_loaded(shard, row, value.clone());
                pending.row = None;
                cell.complete(Ok(Some(value.clone())));
                Ok(Some(value))
            }
            Ok(None) => {
                self.drop_loading(shard, row);
                pending.row = None;
                cell.complete(Ok(None));
                Ok(None)
            }
            Err(err) => {
                let err = Arc::new(err);
                self.drop_loading(shard, row);
                pending.row = None;
                let shared: SharedError = err.clone();
                cell.complete(Err(shared));
                Err(err)
            }
        }
    }

    /// Turn the loading row into a live entry. The policy hook runs before
    /// any bookkeeping changes, so a panic there leaves the row still loading
    /// for `PendingLoad` to clean up.
    fn install_loaded(&self, shard_idx: usize, row: Handle, value: V) {
        let mut shard = self.shards[shard_idx].write();
        if !shard.rows.is_linked(row) {
            // A put superseded this load while it ran.
            let orphan = shard.rows.remove(row);
            drop(shard);
            drop(orphan);
            return;
        }
        let Some((key, slot)) = shard.rows.get_mut(row) else {
            return;
        };
        let entry = self.new_entry(shard_idx, row, key, value);
        let previous = std::mem::replace(slot, Slot::Ready(entry));
        shard.finish_loading(row);
        drop(shard);
        drop(previous);
    }

    /// Remove a loading row. Safe to repeat: a stale handle is a no-op.
    fn drop_loading(&self, shard_idx: usize, row: Handle) {
        let mut shard = self.shards[shard_idx].write();
        shard.finish_loading(row);
        let removed = shard.rows.remove(row);
        drop(shard);
        drop(removed);
    }

    /// Store `value` under `key`, returning the value it replaced.
    pub fn put(&self, key: K, value: V) -> Option<V> {
        let hash = self.make_hash(&key);
        let shard_idx = self.shard_index(hash);
        let retired = {
            let mut shard = self.shards[shard_idx].write();
            let retired = shard.retire_linked(hash, &key, RemovalCause::Replaced);
            // Stop tracking the old entry before the new one is admitted, so a
            // bounded policy does not count both.
            if let Some((id, _)) = &retired {
                self.policy.forget(*id);
            }
            shard.rows.insert_unique_with(hash, key, |k, row| {
                Slot::Ready(self.new_entry(shard_idx, row, k, value))
            });
            retired
        };
        let previous = retired.and_then(|(_, r)| r.into_live());
        self.run_pending();
        previous
    }

    /// Like [`put`](Self::put) for callers holding an optional value; `None`
    /// is rejected before any entry is built.
    pub fn put_opt(&self, key: K, value: Option<V>) -> CacheResult<Option<V>> {
        match value {
            Some(value) => Ok(self.put(key, value)),
            None => Err(CacheError::RejectedNullValue),
        }
    }

    /// Remove the entry for `key`, returning the value it held.
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let hash = self.make_hash(key);
        let retired = {
            let mut shard = self.shards[self.shard_index(hash)].write();
            shard
                .rows
                .find(hash, key)
                .and_then(|h| match shard.rows.value_mut(h) {
                    Some(Slot::Ready(entry)) => {
                        self.policy.forget(entry.id());
                        Some(entry.tombstone(RemovalCause::Explicit))
                    }
                    _ => None,
                })
        };
        let previous = retired.and_then(Retired::into_live);
        self.run_pending();
        previous
    }

    /// Remove every live entry for which `predicate` returns true; returns
    /// how many were removed.
    ///
    /// Each shard is swept under its write lock, so `predicate` must not
    /// call back into this cache.
    pub fn remove_if<F>(&self, mut predicate: F) -> usize
    where
        F: FnMut(&K, &V) -> bool,
    {
        let mut retired = Vec::new();
        for lock in self.shards.iter() {
            let mut shard = lock.write();
            for (_, key, slot) in shard.rows.iter_mut() {
                if let Slot::Ready(entry) = slot {
                    let matched = entry.live_value().is_some_and(|v| predicate(key, v));
                    if matched {
                        self.policy.forget(entry.id());
                        retired.push(entry.tombstone(RemovalCause::Explicit));
                    }
                }
            }
        }
        let removed = retired.into_iter().filter_map(Retired::into_live).count();
        self.run_pending();
        removed
    }

    /// Remove every live entry. Listeners fire through the cleanup pass like
    /// any other removal.
    pub fn clear(&self) {
        self.remove_if(|_, _| true);
    }

    /// Number of entries after applying pending notices. Approximate while
    /// other threads mutate the cache.
    pub fn size(&self) -> usize {
        self.run_pending();
        self.shards.iter().map(|s| s.read().entries()).sum()
    }

    /// True if no entries remain after a cleanup pass.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Invalidate the live entry for `key` the way a reclaimer would. The
    /// notice is applied by the next cleanup pass. Returns false if there is
    /// no live entry.
    pub fn reclaim<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let hash = self.make_hash(key);
        let shard = self.shards[self.shard_index(hash)].read();
        shard
            .rows
            .find(hash, key)
            .and_then(|h| match shard.rows.value(h) {
                Some(Slot::Ready(entry)) => {
                    let won = entry.handle().reclaim(RemovalCause::Reclaimed);
                    if won {
                        self.policy.forget(entry.id());
                    }
                    Some(won)
                }
                _ => None,
            })
            .unwrap_or(false)
    }

    /// Notices queued and not yet applied.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Strength reported by the configured policy.
    pub fn strength(&self) -> Strength {
        self.policy.strength()
    }

    /// Name of the configured policy, as used in logs.
    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Run a cleanup pass now. Returns the number of notices this call
    /// applied; 0 if another pass was already running.
    pub fn run_pending(&self) -> usize {
        let mut applied = 0;
        loop {
            if self.gate.is_busy() {
                break;
            }
            let Some(pass) = self.gate.try_enter() else {
                break;
            };
            self.policy.poll();
            while let Some(notice) = self.queue.try_pop() {
                self.apply(notice);
                applied += 1;
            }
            drop(pass);
            // A notice queued after the drain but before the gate opened
            // would otherwise wait for the next call.
            if self.queue.is_empty() {
                break;
            }
        }
        if applied > 0 {
            debug!(applied, "cleanup pass applied reclamation notices");
        }
        applied
    }

    fn apply(&self, notice: Notice) {
        let removed = {
            let mut shard = self.shards[notice.id.shard()].write();
            shard.remove_dead(notice.id.handle())
        };
        self.policy.forget(notice.id);
        let Some((key, slot)) = removed else {
            return;
        };
        trace!(id = ?notice.id, cause = ?notice.cause, "entry removed");
        self.notify(&key, notice.cause);
        drop(slot);
    }

    fn notify(&self, key: &K, cause: RemovalCause) {
        let Some(listener) = &self.listener else {
            return;
        };
        let Err(payload) = guarded(|| listener.on_removal(self, key, cause)) else {
            return;
        };
        let reason = panic_message(payload.as_ref());
        match self.listener_panic {
            ListenerPanic::Isolate => {
                warn!(?cause, reason, "removal listener panicked; continuing cleanup");
            }
            ListenerPanic::Propagate => {
                error!(?cause, reason, "removal listener panicked; aborting cleanup");
                panic::resume_unwind(payload);
            }
        }
    }
}

/// Cleans up an in-flight load if anything between claiming it and
/// publishing its outcome unwinds (the loader, the policy hook, `V::clone`).
/// `row` is cleared once the row is resolved; abandoning a completed cell
/// is a no-op, so waiters either see the outcome or retry.
struct PendingLoad<'a, K, V, S>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Send + Sync + 'static,
{
    cache: &'a Cache<K, V, S>,
    shard: usize,
    row: Option<Handle>,
    cell: &'a LoadCell<V>,
}

impl<K, V, S> Drop for PendingLoad<'_, K, V, S>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if let Some(row) = self.row.take() {
            self.cache.drop_loading(self.shard, row);
        }
        self.cell.abandon();
    }
}
