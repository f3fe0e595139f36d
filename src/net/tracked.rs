//! Tracked resource sets

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique resource id
pub fn next_resource_id() -> u64 {
    NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Concurrency-safe set of live resource handles keyed by resource id
///
/// Iteration works on a snapshot, so entries may be inserted or removed
/// while a caller walks the result.
pub struct TrackedSet<T> {
    entries: Mutex<HashMap<u64, T>>,
}

impl<T: Clone> TrackedSet<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, T>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, id: u64, value: T) {
        self.lock().insert(id, value);
    }

    pub fn remove(&self, id: u64) -> Option<T> {
        self.lock().remove(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of the current entries
    pub fn snapshot(&self) -> Vec<(u64, T)> {
        self.lock()
            .iter()
            .map(|(id, value)| (*id, value.clone()))
            .collect()
    }
}

impl<T: Clone> Default for TrackedSet<T> {
    fn default() -> Self {
        Self::new()
    }
}
