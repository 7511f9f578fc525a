//! Synchronous change notification with disposer-based unsubscription.
//!
//! Status and board observers must fire synchronously, after the mutation
//! that triggered them has fully completed. Callbacks are invoked outside
//! the registry lock, so a callback may subscribe or dispose other
//! subscriptions; issuing a new document transaction from inside a
//! callback is not supported.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;
type Registry<T> = Mutex<HashMap<u64, Callback<T>>>;

/// A set of subscribers notified synchronously on every `emit`.
pub struct Publisher<T> {
    listeners: Arc<Registry<T>>,
    next_id: AtomicU64,
}

impl<T: 'static> Publisher<T> {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register a callback. Dropping the returned disposer unsubscribes.
    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> Disposer {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .expect("listener registry poisoned")
            .insert(id, Arc::new(callback));

        let registry = Arc::downgrade(&self.listeners);
        Disposer::new(move || {
            if let Some(listeners) = Weak::upgrade(&registry) {
                listeners
                    .lock()
                    .expect("listener registry poisoned")
                    .remove(&id);
            }
        })
    }

    /// Deliver `value` to every current subscriber.
    pub fn emit(&self, value: &T) {
        let callbacks: Vec<Callback<T>> = self
            .listeners
            .lock()
            .expect("listener registry poisoned")
            .values()
            .cloned()
            .collect();

        for callback in callbacks {
            callback(value);
        }
    }

    /// Number of live subscribers.
    pub fn len(&self) -> usize {
        self.listeners
            .lock()
            .expect("listener registry poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: 'static> Default for Publisher<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Unsubscribes its listener when dropped.
pub struct Disposer(Option<Box<dyn FnOnce() + Send>>);

impl Disposer {
    fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(release)))
    }

    /// Explicitly unsubscribe; equivalent to dropping.
    pub fn dispose(self) {}
}

impl Drop for Disposer {
    fn drop(&mut self) {
        if let Some(release) = self.0.take() {
            release();
        }
    }
}
