//! # Singleflight
//!
//! Collapses concurrent calls for the same key into one execution whose
//! result is handed to every caller.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OnceCell;

/// Per-key in-flight call deduplication.
///
/// Only concurrent callers share a result: once a call completes its key is
/// forgotten and the next caller starts a fresh execution.
pub struct Group<K, V> {
    calls: Mutex<HashMap<K, Arc<OnceCell<V>>>>,
}

impl<K, V> Default for Group<K, V> {
    fn default() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> Group<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `work` unless a call for `key` is already in flight, in which
    /// case the in-flight call's result is awaited and returned instead.
    pub async fn work<F, Fut>(&self, key: K, work: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let cell = {
            let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
            calls
                .entry(key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let value = cell.get_or_init(work).await.clone();

        let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        if calls.get(&key).is_some_and(|current| Arc::ptr_eq(current, &cell)) {
            calls.remove(&key);
        }

        value
    }

    /// Number of keys with a call in flight.
    pub fn in_flight(&self) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
