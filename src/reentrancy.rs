//! Cleanup-pass exclusion and reentrant-load detection.
//!
//! `CleanupGate` is a cooperative skip-if-busy flag: `try_enter` either
//! hands out the single RAII guard or returns `None` immediately. It never
//! blocks, so a removal listener that calls back into the cache just skips
//! its own cleanup attempt instead of deadlocking.
//!
//! `LoadOwner` records which thread runs an in-flight loader. In debug
//! builds a waiter on that same thread (the loader re-entering the cache for
//! its own key) panics instead of waiting forever. In release builds the
//! check compiles away.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug)]
pub(crate) struct CleanupGate {
    busy: AtomicBool,
}

impl CleanupGate {
    pub(crate) const fn new() -> Self {
        Self {
            busy: AtomicBool::new(false),
        }
    }

    /// Take the gate if no pass is running.
    #[inline]
    pub(crate) fn try_enter(&self) -> Option<CleanupGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| CleanupGuard { gate: self })
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Held for the duration of one cleanup pass; released on drop, including
/// while unwinding out of a panicking listener.
pub(crate) struct CleanupGuard<'a> {
    gate: &'a CleanupGate,
}

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        self.gate.busy.store(false, Ordering::Release);
    }
}

#[derive(Debug)]
pub(crate) struct LoadOwner {
    #[cfg(debug_assertions)]
    thread: std::thread::ThreadId,
}

impl LoadOwner {
    pub(crate) fn current() -> Self {
        Self {
            #[cfg(debug_assertions)]
            thread: std::thread::current().id(),
        }
    }

    /// Called before a waiter blocks on a pending load.
    #[inline]
    pub(crate) fn check_reentry(&self) {
        #[cfg(debug_assertions)]
        {
            assert!(
                self.thread != std::thread::current().id(),
                "reentrant load detected: a loader re-entered the cache for its own key"
            );
        }
    }
}
