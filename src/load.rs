//! In-flight load slots.
//!
//! While a loader runs, the table row for its key holds a `Slot::Loading`
//! pointing at a shared `LoadCell`. Other callers for that key clone the
//! cell, release the shard lock and block in `wait` until the leader
//! publishes an outcome or abandons the load (its loader panicked).
//!
//! Errors are shared type-erased, because waiters may have been called with
//! loaders of a different error type than the one that actually ran.

use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::sync::Arc;

use crate::reentrancy::LoadOwner;

pub(crate) type SharedError = Arc<dyn Any + Send + Sync>;

enum LoadState<V> {
    Pending,
    Done(Result<Option<V>, SharedError>),
    Abandoned,
}

/// What a waiter observed.
pub(crate) enum Waited<V> {
    Loaded(Option<V>),
    Failed(SharedError),
    Abandoned,
}

pub(crate) struct LoadCell<V> {
    state: Mutex<LoadState<V>>,
    ready: Condvar,
    owner: LoadOwner,
}

impl<V: Clone> LoadCell<V> {
    /// A pending cell owned by the calling thread.
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(LoadState::Pending),
            ready: Condvar::new(),
            owner: LoadOwner::current(),
        }
    }

    pub(crate) fn complete(&self, outcome: Result<Option<V>, SharedError>) {
        let mut st = self.state.lock();
        *st = LoadState::Done(outcome);
        self.ready.notify_all();
    }

    pub(crate) fn abandon(&self) {
        let mut st = self.state.lock();
        if matches!(*st, LoadState::Pending) {
            *st = LoadState::Abandoned;
        }
        self.ready.notify_all();
    }

    /// Block until the leader finishes.
    pub(crate) fn wait(&self) -> Waited<V> {
        let mut st = self.state.lock();
        loop {
            match &*st {
                LoadState::Pending => {
                    self.owner.check_reentry();
                    self.ready.wait(&mut st);
                }
                LoadState::Done(Ok(v)) => return Waited::Loaded(v.clone()),
                LoadState::Done(Err(e)) => return Waited::Failed(e.clone()),
                LoadState::Abandoned => return Waited::Abandoned,
            }
        }
    }
}
