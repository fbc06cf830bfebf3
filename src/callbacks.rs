//! Callback registries keyed by subscription id.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

/// Opaque handle returned when a callback is registered; used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub(crate) fn next() -> Self {
        SubscriptionId(NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// An ordered set of callbacks. Callers snapshot it and invoke the snapshot with no
/// lock held, so a callback may freely add or remove subscriptions.
pub struct CallbackSet<T: ?Sized> {
    entries: Vec<(SubscriptionId, Callback<T>)>,
}

impl<T: ?Sized> CallbackSet<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn add(&mut self, callback: Callback<T>) -> SubscriptionId {
        let id = SubscriptionId::next();
        self.entries.push((id, callback));
        id
    }

    /// Registers under an id issued elsewhere; a second insert with the same id is ignored.
    pub fn insert(&mut self, id: SubscriptionId, callback: Callback<T>) {
        if !self.contains(id) {
            self.entries.push((id, callback));
        }
    }

    pub fn remove(&mut self, id: SubscriptionId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(existing, _)| *existing != id);
        self.entries.len() != before
    }

    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.entries.iter().any(|(existing, _)| *existing == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> Vec<(SubscriptionId, Callback<T>)> {
        self.entries.clone()
    }

    pub fn snapshot(&self) -> Vec<Callback<T>> {
        self.entries.iter().map(|(_, cb)| cb.clone()).collect()
    }
}

impl<T: ?Sized> Default for CallbackSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> fmt::Debug for CallbackSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(id, _)| id))
            .finish()
    }
}
