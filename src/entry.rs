//! Cache entries and the table slots that hold them.

use std::sync::Arc;

use crate::load::LoadCell;
use crate::reclaim::{EntryId, ReclaimHandle, RemovalCause};

pub(crate) enum Payload<V> {
    Live(V),
    Tombstone,
}

/// One key's value plus the handle through which it can be reclaimed.
/// Once tombstoned an entry is never revived; a later `put` builds a new one.
pub(crate) struct CacheEntry<V> {
    payload: Payload<V>,
    handle: ReclaimHandle,
}

/// The payload taken out of a tombstoned entry. `value` is handed back to
/// callers only if this tombstoning was the entry's transition to dead.
pub(crate) struct Retired<V> {
    value: Option<V>,
    was_live: bool,
}

impl<V> Retired<V> {
    pub(crate) fn into_live(self) -> Option<V> {
        if self.was_live {
            self.value
        } else {
            None
        }
    }
}

impl<V> CacheEntry<V> {
    pub(crate) fn new(value: V, handle: ReclaimHandle) -> Self {
        Self {
            payload: Payload::Live(value),
            handle,
        }
    }

    pub(crate) fn id(&self) -> EntryId {
        self.handle.id()
    }

    pub(crate) fn handle(&self) -> &ReclaimHandle {
        &self.handle
    }

    /// The value, unless the entry is tombstoned or its handle was reclaimed.
    pub(crate) fn live_value(&self) -> Option<&V> {
        if self.handle.is_reclaimed() {
            return None;
        }
        match &self.payload {
            Payload::Live(v) => Some(v),
            Payload::Tombstone => None,
        }
    }

    /// Mark the entry dead in place and queue its notice (if nobody else
    /// already did).
    pub(crate) fn tombstone(&mut self, cause: RemovalCause) -> Retired<V> {
        let was_live = self.handle.reclaim(cause);
        let value = match std::mem::replace(&mut self.payload, Payload::Tombstone) {
            Payload::Live(v) => Some(v),
            Payload::Tombstone => None,
        };
        Retired { value, was_live }
    }
}

pub(crate) enum Slot<V> {
    Ready(CacheEntry<V>),
    Loading(Arc<LoadCell<V>>),
}
