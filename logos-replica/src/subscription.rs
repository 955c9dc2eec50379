//! Subscribe/unsubscribe registry with per-subscriber change detection.
//!
//! Each subscriber remembers the last value it was handed and is only
//! called again when a published value differs from it. Callbacks run
//! after the registry lock is released, so a callback may subscribe or
//! unsubscribe without deadlocking.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Entry<T> {
    callback: Callback<T>,
    last: T,
}

struct Inner<T> {
    next_id: u64,
    current: T,
    entries: BTreeMap<u64, Entry<T>>,
}

pub struct Subscribers<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for Subscribers<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

fn lock<T>(inner: &Mutex<Inner<T>>) -> MutexGuard<'_, Inner<T>> {
    // Callbacks run outside the lock.
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<T: Clone + PartialEq + Send + 'static> Subscribers<T> {
    pub fn new(initial: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_id: 0,
                current: initial,
                entries: BTreeMap::new(),
            })),
        }
    }

    /// Registers `callback` and immediately hands it the current value.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let callback: Callback<T> = Arc::new(callback);
        let (id, current) = {
            let mut inner = lock(&self.inner);
            let id = inner.next_id;
            inner.next_id += 1;
            let current = inner.current.clone();
            inner.entries.insert(
                id,
                Entry {
                    callback: callback.clone(),
                    last: current.clone(),
                },
            );
            (id, current)
        };
        callback(&current);

        let weak: Weak<Mutex<Inner<T>>> = Arc::downgrade(&self.inner);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    lock(&inner).entries.remove(&id);
                }
            })),
        }
    }

    /// Stores `value` and notifies every subscriber whose last value differs.
    pub fn publish(&self, value: T) {
        let due: Vec<Callback<T>> = {
            let mut inner = lock(&self.inner);
            inner.current = value.clone();
            inner
                .entries
                .values_mut()
                .filter(|entry| entry.last != value)
                .map(|entry| {
                    entry.last = value.clone();
                    entry.callback.clone()
                })
                .collect()
        };
        for callback in due {
            callback(&value);
        }
    }

    pub fn current(&self) -> T {
        lock(&self.inner).current.clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every subscriber.
    pub fn clear(&self) {
        lock(&self.inner).entries.clear();
    }
}

/// Handle returned by [`Subscribers::subscribe`].
///
/// Dropping the handle keeps the subscription alive; call
/// [`Subscription::unsubscribe`] to end it.
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}
