//! Subscriptions recorded before any connection exists.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Ordered list of subscriptions waiting for `bootstrap`.
///
/// Entries are appended by `subscribe` and read back in registration
/// order. Bootstrap clears the list only after every entry activated; on a
/// failed bootstrap the entries stay but are never activated again, since
/// the host bootstraps exactly once.
#[derive(Debug)]
pub struct PendingSubscriptions<T> {
    entries: Mutex<Vec<T>>,
}

impl<T> Default for PendingSubscriptions<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> PendingSubscriptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: T) {
        self.lock().push(entry);
    }

    /// Copy of the entries in registration order.
    pub fn snapshot(&self) -> Vec<T> {
        self.lock().clone()
    }

    /// Remove the first `count` entries (the ones a bootstrap pass activated).
    ///
    /// Entries registered while the pass was running stay pending.
    pub fn drain_front(&self, count: usize) {
        let mut entries = self.lock();
        let count = count.min(entries.len());
        entries.drain(..count);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<T>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
