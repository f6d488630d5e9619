//! Reclaim handles, removal causes and the reclamation queue.
//!
//! A `ReclaimHandle` is a one-shot token attached to every cache entry. The
//! first call to `reclaim` wins: it records the cause and posts a `Notice`
//! on the reclamation queue. Later calls are no-ops, which is what makes
//! removal notification exactly-once no matter how many parties (explicit
//! removal, a policy, an embedding runtime) race to invalidate the entry.
//!
//! A notice carries only the entry's identity and cause; the dead value is
//! never reachable through it.

use crossbeam_channel::{Receiver, Sender};
use slotmap::DefaultKey;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::entry_table::Handle;

/// Identity of one cache entry: the shard it lives in and its generational
/// row handle. Never reused for a different entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct EntryId {
    shard: u32,
    slot: DefaultKey,
}

impl EntryId {
    pub(crate) fn new(shard: usize, handle: Handle) -> Self {
        Self {
            shard: shard as u32,
            slot: handle.raw_handle(),
        }
    }

    pub(crate) fn shard(&self) -> usize {
        self.shard as usize
    }

    pub(crate) fn handle(&self) -> Handle {
        Handle::new(self.slot)
    }
}

/// Why an entry left the cache.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum RemovalCause {
    /// `remove`, `remove_if` or `clear`.
    Explicit,
    /// Overwritten by `put`.
    Replaced,
    /// Invalidated by the reclamation policy or an external reclaimer.
    Reclaimed,
    /// Outlived its time-to-live.
    Expired,
}

impl RemovalCause {
    /// True when the cache, not the caller, decided to drop the entry.
    pub fn was_reclaimed(&self) -> bool {
        matches!(self, RemovalCause::Reclaimed | RemovalCause::Expired)
    }

    fn code(self) -> u8 {
        match self {
            RemovalCause::Explicit => 1,
            RemovalCause::Replaced => 2,
            RemovalCause::Reclaimed => 3,
            RemovalCause::Expired => 4,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(RemovalCause::Explicit),
            2 => Some(RemovalCause::Replaced),
            3 => Some(RemovalCause::Reclaimed),
            4 => Some(RemovalCause::Expired),
            _ => None,
        }
    }
}

const ALIVE: u8 = 0;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct Notice {
    pub(crate) id: EntryId,
    pub(crate) cause: RemovalCause,
}

/// Multi-producer queue of notices; drained without blocking by the
/// cleanup pass.
pub(crate) struct ReclamationQueue {
    tx: Sender<Notice>,
    rx: Receiver<Notice>,
}

impl ReclamationQueue {
    pub(crate) fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }

    pub(crate) fn sender(&self) -> Sender<Notice> {
        self.tx.clone()
    }

    pub(crate) fn try_pop(&self) -> Option<Notice> {
        self.rx.try_recv().ok()
    }

    pub(crate) fn len(&self) -> usize {
        self.rx.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

struct HandleState {
    id: EntryId,
    state: AtomicU8,
    queue: Sender<Notice>,
}

/// Reclaimable handle for one cache entry. Cloning shares the same state.
#[derive(Clone)]
pub struct ReclaimHandle {
    inner: Arc<HandleState>,
}

impl ReclaimHandle {
    pub(crate) fn new(id: EntryId, queue: Sender<Notice>) -> Self {
        Self {
            inner: Arc::new(HandleState {
                id,
                state: AtomicU8::new(ALIVE),
                queue,
            }),
        }
    }

    pub fn id(&self) -> EntryId {
        self.inner.id
    }

    pub fn is_reclaimed(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) != ALIVE
    }

    /// The cause recorded by the winning `reclaim` call, if any.
    pub fn cause(&self) -> Option<RemovalCause> {
        RemovalCause::from_code(self.inner.state.load(Ordering::Acquire))
    }

    /// Invalidate the entry and queue its notice. Returns true for the one
    /// call that performed the transition. Never blocks.
    pub fn reclaim(&self, cause: RemovalCause) -> bool {
        let won = self
            .inner
            .state
            .compare_exchange(ALIVE, cause.code(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            // The receiver is gone only once the cache itself was dropped.
            let _ = self.inner.queue.send(Notice {
                id: self.inner.id,
                cause,
            });
        }
        won
    }
}

impl core::fmt::Debug for ReclaimHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ReclaimHandle")
            .field("id", &self.inner.id)
            .field("cause", &self.cause())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;
    use std::thread;

    fn some_id() -> EntryId {
        let mut sm: SlotMap<DefaultKey, ()> = SlotMap::with_key();
        EntryId::new(3, Handle::new(sm.insert(())))
    }

    /// Invariant: only the first `reclaim` wins; exactly one notice is queued and
    /// the first cause sticks.
    #[test]
    fn reclaim_is_one_shot() {
        let q = ReclamationQueue::new();
        let handle = ReclaimHandle::new(some_id(), q.sender());
        assert!(!handle.is_reclaimed());
        assert_eq!(handle.cause(), None);

        assert!(handle.reclaim(RemovalCause::Explicit));
        assert!(!handle.reclaim(RemovalCause::Reclaimed));
        assert!(!handle.clone().reclaim(RemovalCause::Expired));

        assert!(handle.is_reclaimed());
        assert_eq!(handle.cause(), Some(RemovalCause::Explicit));
        assert_eq!(q.len(), 1);
        let notice = q.try_pop().unwrap();
        assert_eq!(notice.id, handle.id());
        assert_eq!(notice.cause, RemovalCause::Explicit);
        assert!(q.try_pop().is_none());
        assert!(q.is_empty());
    }

    /// Invariant: racing reclaimers on several threads still produce one notice.
    #[test]
    fn concurrent_reclaim_queues_once() {
        let q = ReclamationQueue::new();
        let handle = ReclaimHandle::new(some_id(), q.sender());
        let wins: usize = thread::scope(|s| {
            let joins: Vec<_> = (0..8)
                .map(|_| {
                    let h = handle.clone();
                    s.spawn(move || h.reclaim(RemovalCause::Reclaimed) as usize)
                })
                .collect();
            joins.into_iter().map(|j| j.join().unwrap()).sum()
        });
        assert_eq!(wins, 1);
        assert_eq!(q.len(), 1);
    }

    /// Invariant: reclaiming after the queue's receiver is gone does not panic.
    #[test]
    fn reclaim_after_queue_dropped_is_harmless() {
        let q = ReclamationQueue::new();
        let handle = ReclaimHandle::new(some_id(), q.sender());
        drop(q);
        assert!(handle.reclaim(RemovalCause::Expired));
        assert_eq!(handle.cause(), Some(RemovalCause::Expired));
    }

    /// Invariant: entry ids round-trip their shard and row handle.
    #[test]
    fn entry_id_parts() {
        let id = some_id();
        assert_eq!(id.shard(), 3);
        assert_eq!(EntryId::new(id.shard(), id.handle()), id);
        assert!(RemovalCause::Expired.was_reclaimed());
        assert!(!RemovalCause::Replaced.was_reclaimed());
    }
}
