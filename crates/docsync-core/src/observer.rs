//! Listener registry with explicit subscription handles
//!
//! Registering a callback returns a [`Subscription`]. Disposing (or dropping)
//! the subscription removes the callback, so teardown is an iterate-and-drop
//! over stored handles.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Slots<E> {
    next_id: u64,
    callbacks: Vec<(u64, Callback<E>)>,
}

/// A set of callbacks invoked with `&E` on every emit
pub struct Observer<E> {
    slots: Arc<Mutex<Slots<E>>>,
}

impl<E: 'static> Observer<E> {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(Slots {
                next_id: 0,
                callbacks: Vec::new(),
            })),
        }
    }

    /// Register a callback
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = {
            let mut slots = self.slots.lock();
            let id = slots.next_id;
            slots.next_id += 1;
            slots.callbacks.push((id, Arc::new(callback)));
            id
        };

        let weak: Weak<Mutex<Slots<E>>> = Arc::downgrade(&self.slots);
        Subscription::new(move || {
            if let Some(slots) = weak.upgrade() {
                slots.lock().callbacks.retain(|(slot_id, _)| *slot_id != id);
            }
        })
    }

    /// Invoke every registered callback
    ///
    /// The registry lock is released before callbacks run, so a callback may
    /// subscribe or dispose without deadlocking.
    pub fn emit(&self, event: &E) {
        let callbacks: Vec<Callback<E>> = self
            .slots
            .lock()
            .callbacks
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();

        for callback in callbacks {
            callback(event);
        }
    }

    /// Number of registered callbacks
    pub fn len(&self) -> usize {
        self.slots.lock().callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: 'static> Default for Observer<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle that releases a registration when disposed or dropped
#[must_use = "dropping a Subscription unregisters it immediately"]
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Wrap a release function
    pub fn new<F>(release: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// A subscription with nothing to release
    pub fn noop() -> Self {
        Self { release: None }
    }

    /// Release the registration now
    pub fn dispose(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.release.is_some())
            .finish()
    }
}
