//! Listener bookkeeping shared by connection and topic listeners

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Opaque disposer token for a registered callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

impl ListenerId {
    /// Process-unique, never reused
    pub fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Callbacks in registration order
pub struct ListenerSet<F: ?Sized> {
    entries: Mutex<BTreeMap<ListenerId, Arc<F>>>,
}

impl<F: ?Sized> Default for ListenerSet<F> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<F: ?Sized> ListenerSet<F> {
    pub fn insert(&self, callback: Arc<F>) -> ListenerId {
        let id = ListenerId::next();
        self.lock().insert(id, callback);
        id
    }

    /// `false` if `id` was already removed
    pub fn remove(&self, id: ListenerId) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Clone of the current callbacks, so they can run without the lock held
    pub fn snapshot(&self) -> Vec<Arc<F>> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<ListenerId, Arc<F>>> {
        // callbacks never run under this lock, so a poisoned map is still consistent
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Callback = dyn Fn(u32) -> u32 + Send + Sync;

    #[test]
    fn test_ids_are_unique_and_ordered() {
        let a = ListenerId::next();
        let b = ListenerId::next();
        assert_ne!(a, b);
        assert!(a < b);
    }

    #[test]
    fn test_insert_snapshot_remove() {
        let set: ListenerSet<Callback> = ListenerSet::default();
        let first = set.insert(Arc::new(|x: u32| x + 1));
        let _second = set.insert(Arc::new(|x: u32| x * 10));

        let results: Vec<u32> = set.snapshot().iter().map(|f| f(2)).collect();
        assert_eq!(results, vec![3, 20]);

        assert!(set.remove(first));
        assert!(!set.remove(first));
        assert_eq!(set.len(), 1);
    }
}
