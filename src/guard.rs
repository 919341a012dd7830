//! Guarded shutdown
//!
//! [`Guard`] holds a single invocable shutdown target so it can be triggered from a signal or
//! console-control handler: `execute` never blocks on anything the handler itself might hold,
//! and the lock it does take is only ever held for the duration of a pointer swap, not the
//! shutdown call itself.

use std::sync::Arc;

use parking_lot::RwLock;

/// Something that can be asked to shut down exactly once.
pub trait Shutdown: Send + Sync {
    /// Perform the shutdown. Must be safe to call from a signal or console-control handler
    /// context: no heap allocation beyond what `Arc` clone already did, no panicking.
    fn shutdown(&self);
}

/// A single-cell holder for the current shutdown target.
///
/// Reader-preferring `RwLock` is deliberate: `execute` is the rare, latency-sensitive path (it
/// may run on a signal thread) and should never wait behind a writer that's mid-swap.
pub struct Guard<T: ?Sized> {
    target: RwLock<Option<Arc<T>>>,
}

impl<T: ?Sized + Shutdown> Guard<T> {
    /// An empty guard with no shutdown target registered.
    pub fn new() -> Self {
        Self {
            target: RwLock::new(None),
        }
    }

    /// Register `target` as the current shutdown target, replacing any previous one.
    pub fn set(&self, target: Option<Arc<T>>) {
        *self.target.write() = target;
    }

    /// Invoke the current shutdown target, if any. The lock is dropped before
    /// [`Shutdown::shutdown`] is called, so a handler racing with [`Self::set`] never deadlocks
    /// and never blocks the setter.
    pub fn execute(&self) {
        let target = self.target.read().clone();
        if let Some(target) = target {
            target.shutdown();
        }
    }
}

impl<T: ?Sized + Shutdown> Default for Guard<T> {
    fn default() -> Self {
        Self::new()
    }
}
