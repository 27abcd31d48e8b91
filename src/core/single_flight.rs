//! Request-coalescing cache
//!
//! Concurrent requests for a key that is not resolved yet join one
//! computation instead of each starting their own. A resolved entry stays until
//! it is taken with [`SingleFlightCache::take_once`].

use dashmap::DashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::OnceCell;

pub struct SingleFlightCache<K, V> {
    entries: DashMap<K, Arc<OnceCell<V>>>,
}

impl<K, V> Default for SingleFlightCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> SingleFlightCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Return the value for `key`, running `init` only if no computation for
    /// it is resolved or in flight. A failed computation leaves no entry behind.
    pub async fn get_or_try_init<F, Fut, E>(&self, key: K, init: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let cell = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        match cell.get_or_try_init(init).await {
            Ok(value) => Ok(value.clone()),
            Err(err) => {
                self.entries
                    .remove_if(&key, |_, current| Arc::ptr_eq(current, &cell) && !current.initialized());
                Err(err)
            }
        }
    }

    /// Remove and return a resolved value. In-flight computations are left alone.
    pub fn take_once(&self, key: &K) -> Option<V> {
        self.entries
            .remove_if(key, |_, cell| cell.initialized())
            .and_then(|(_, cell)| cell.get().cloned())
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries
            .get(key)
            .map(|cell| cell.initialized())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
