//! Ordered listener registry
//!
//! Listeners are invoked synchronously, in registration order, once per
//! event. The registry lock is not held while a listener runs, so a listener
//! may add or remove listeners (the change applies from the next event).
//! A panicking listener is logged and skipped; the rest still run.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Identifies a registered listener for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub struct ListenerId(u64);

struct Registry<T> {
    next_id: u64,
    entries: Vec<(ListenerId, Callback<T>)>,
}

/// A set of callbacks notified on every event of type `T`.
pub struct Listeners<T> {
    registry: Mutex<Registry<T>>,
}

impl<T> Listeners<T> {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry {
                next_id: 1,
                entries: Vec::new(),
            }),
        }
    }

    /// Register a listener; it sees every event from now on.
    pub fn add<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let mut reg = self.lock();
        let id = ListenerId(reg.next_id);
        reg.next_id += 1;
        reg.entries.push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns false if it was already gone.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut reg = self.lock();
        let before = reg.entries.len();
        reg.entries.retain(|(entry_id, _)| *entry_id != id);
        reg.entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every listener in registration order.
    ///
    /// Returns the number of listeners that completed without panicking.
    pub fn notify(&self, event: &T) -> usize {
        let snapshot: Vec<(ListenerId, Callback<T>)> = self.lock().entries.clone();

        let mut delivered = 0;
        for (id, listener) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(()) => delivered += 1,
                Err(_) => tracing::error!(listener = ?id, "Listener panicked, skipping"),
            }
        }
        delivered
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry<T>> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Unsubscribe token returned by [`subscribe`].
///
/// Dropping the token leaves the listener registered; call
/// [`Subscription::unsubscribe`] to remove it.
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription<T> {
    id: ListenerId,
    registry: Weak<Listeners<T>>,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Remove the listener. Safe to call after the registry is gone.
    pub fn unsubscribe(self) -> bool {
        self.registry
            .upgrade()
            .map_or(false, |registry| registry.remove(self.id))
    }
}

/// Register `listener` on a shared registry and hand back a token.
pub fn subscribe<T, F>(listeners: &Arc<Listeners<T>>, listener: F) -> Subscription<T>
where
    F: Fn(&T) + Send + Sync + 'static,
{
    let id = listeners.add(listener);
    Subscription {
        id,
        registry: Arc::downgrade(listeners),
    }
}
