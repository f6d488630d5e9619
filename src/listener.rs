//! Removal listeners.
//!
//! A listener runs once per entry that leaves the cache, from inside the
//! cleanup pass of whichever thread happened to run it, after the entry's
//! row is already gone. It receives the cache itself, so it may call back
//! into it; such a call proceeds normally and just skips its own cleanup
//! attempt while the current pass is running.
//!
//! Listeners fail by panicking. `ListenerPanic` decides what the pass does
//! about it.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use crate::cache::Cache;
use crate::reclaim::RemovalCause;

pub trait RemovalListener<K, V, S>: Send + Sync {
    fn on_removal(&self, cache: &Cache<K, V, S>, key: &K, cause: RemovalCause);
}

impl<K, V, S, F> RemovalListener<K, V, S> for F
where
    F: Fn(&Cache<K, V, S>, &K, RemovalCause) + Send + Sync,
{
    fn on_removal(&self, cache: &Cache<K, V, S>, key: &K, cause: RemovalCause) {
        self(cache, key, cause)
    }
}

/// What a cleanup pass does when a listener panics.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum ListenerPanic {
    /// Catch the panic, log it and keep draining the remaining notices.
    #[default]
    Isolate,
    /// Stop the pass and resume the panic on the calling thread. The failed
    /// notice counts as delivered; notices not yet drained stay queued for
    /// the next pass.
    Propagate,
}

/// Run `f`, returning the panic payload instead of unwinding.
pub(crate) fn guarded<F: FnOnce()>(f: F) -> Result<(), Box<dyn Any + Send>> {
    panic::catch_unwind(AssertUnwindSafe(f))
}

/// Best-effort text of a panic payload, for logs.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guarded_returns_payload() {
        assert!(guarded(|| {}).is_ok());
        let err = guarded(|| panic!("listener broke")).unwrap_err();
        assert_eq!(panic_message(err.as_ref()), "listener broke");
        let err = guarded(|| panic!("{} broke", "listener")).unwrap_err();
        assert_eq!(panic_message(err.as_ref()), "listener broke");
        let err = guarded(|| std::panic::panic_any(7u8)).unwrap_err();
        assert_eq!(panic_message(err.as_ref()), "<non-string panic payload>");
    }
}
