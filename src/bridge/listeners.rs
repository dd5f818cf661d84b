// ABOUTME: Callback registries for status, version, and disconnection events
// ABOUTME: Set-semantics registration with panic isolation per callback

use super::state::StateSnapshot;
use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Callback receiving an engine state snapshot after each status change.
pub type StatusListener = Arc<dyn Fn(&StateSnapshot) + Send + Sync>;

/// Callback receiving a human-readable daemon-version warning.
pub type VersionListener = Arc<dyn Fn(&str) + Send + Sync>;

/// Callback receiving the end-of-session flag, `true` when the daemon
/// closed the connection first.
pub type DisconnectionListener = Arc<dyn Fn(&bool) + Send + Sync>;

/// A deduplicated set of subscriber callbacks.
///
/// Registration is idempotent: callbacks are identified by `Arc` pointer
/// identity, so adding the same handle twice is a no-op and removal takes
/// the handle that was registered. Dispatch works on a snapshot of the set
/// and isolates each callback, so one panicking listener cannot keep the
/// others from running.
pub(crate) struct ListenerSet<A: ?Sized> {
    listeners: RwLock<Vec<Arc<dyn Fn(&A) + Send + Sync>>>,
}

impl<A: ?Sized> ListenerSet<A> {
    pub(crate) fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn add(&self, listener: Arc<dyn Fn(&A) + Send + Sync>) {
        let mut listeners = self.listeners.write();
        if !listeners.iter().any(|known| Arc::ptr_eq(known, &listener)) {
            listeners.push(listener);
        }
    }

    pub(crate) fn remove(&self, listener: &Arc<dyn Fn(&A) + Send + Sync>) {
        self.listeners
            .write()
            .retain(|known| !Arc::ptr_eq(known, listener));
    }

    pub(crate) fn notify(&self, argument: &A) {
        let snapshot = self.listeners.read().clone();
        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(argument))).is_err() {
                log::error!("Listener panicked; continuing with the remaining listeners");
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.listeners.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_add_is_idempotent() {
        let set: ListenerSet<u32> = ListenerSet::new();
        let listener: Arc<dyn Fn(&u32) + Send + Sync> = Arc::new(|_| {});
        set.add(Arc::clone(&listener));
        set.add(Arc::clone(&listener));
        assert_eq!(set.len(), 1);

        set.remove(&listener);
        set.remove(&listener);
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn test_notify_reaches_every_listener() {
        let set: ListenerSet<u32> = ListenerSet::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            set.add(Arc::new(move |value: &u32| {
                calls.fetch_add(*value as usize, Ordering::SeqCst);
            }));
        }

        set.notify(&2);
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_panicking_listener_does_not_starve_others() {
        let set: ListenerSet<u32> = ListenerSet::new();
        let calls = Arc::new(AtomicUsize::new(0));

        set.add(Arc::new(|_: &u32| panic!("deliberate")));
        let counter = Arc::clone(&calls);
        set.add(Arc::new(move |_: &u32| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        set.notify(&1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
