//! Live connection and listener sets.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique identifier for connections and listeners.
pub(crate) fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Concurrency-safe set keyed by id. Entries are added when a task starts and
/// removed when it exits; readers always work on a point-in-time snapshot.
pub(crate) struct Registry<T> {
    entries: Arc<RwLock<HashMap<u64, T>>>,
}

impl<T> Clone for Registry<T> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<T: Clone> Registry<T> {
    pub(crate) fn insert(&self, id: u64, entry: T) {
        self.entries.write().insert(id, entry);
    }

    pub(crate) fn remove(&self, id: u64) -> Option<T> {
        self.entries.write().remove(&id)
    }

    /// Entries ordered by id, i.e. by creation.
    pub(crate) fn snapshot(&self) -> Vec<T> {
        let entries = self.entries.read();
        let mut ids: Vec<&u64> = entries.keys().collect();
        ids.sort_unstable();
        ids.into_iter().map(|id| entries[id].clone()).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }
}
