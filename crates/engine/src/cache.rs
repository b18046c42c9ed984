//! Read-through memoization with at most one computation in flight per key.

use factor_lab_core::{CacheConfig, Result};
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Hashes request parameters or input versions.
#[must_use]
pub fn cache_key(parts: &impl Hash) -> u64 {
    let mut hasher = DefaultHasher::new();
    parts.hash(&mut hasher);
    hasher.finish()
}

/// What is asked (query kind, factor ids, window) and the input versions the
/// answer depends on. A scope holds one entry; a new version replaces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    scope: u64,
    inputs: u64,
}

impl CacheKey {
    #[must_use]
    pub fn new(scope: &impl Hash, inputs: &impl Hash) -> Self {
        Self {
            scope: cache_key(scope),
            inputs: cache_key(inputs),
        }
    }
}

struct Slot<V> {
    inputs: u64,
    cell: Arc<OnceCell<V>>,
    last_used: u64,
}

struct Slots<V> {
    by_scope: HashMap<u64, Slot<V>>,
    tick: u64,
}

impl<V> Slots<V> {
    /// Drops least recently used scopes until at most `capacity` remain.
    fn evict_over(&mut self, capacity: usize) {
        while self.by_scope.len() > capacity {
            let Some(oldest) = self
                .by_scope
                .iter()
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(scope, _)| *scope)
            else {
                break;
            };
            self.by_scope.remove(&oldest);
        }
    }
}

/// Memoizes values by [`CacheKey`]. Concurrent requests for the same key wait
/// for the first computation. A failed or cancelled computation is dropped,
/// so the next request computes again. At most `max_entries` scopes are
/// held, evicting the least recently used.
pub struct QueryCache<V> {
    enabled: bool,
    max_entries: usize,
    slots: Mutex<Slots<V>>,
}

impl<V: Clone> QueryCache<V> {
    #[must_use]
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_entries: config.max_entries.max(1),
            slots: Mutex::new(Slots {
                by_scope: HashMap::new(),
                tick: 0,
            }),
        }
    }

    /// Returns the cached value for `key`, computing it with `compute` if absent.
    ///
    /// # Errors
    /// Propagates the error of `compute`; nothing is stored in that case.
    pub async fn get_or_try_compute<F, Fut>(&self, key: CacheKey, compute: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        if !self.enabled {
            return compute().await;
        }

        let cell = self.cell_for(key);
        let result = cell.get_or_try_init(compute).await.cloned();
        if result.is_err() {
            let mut slots = self.slots.lock();
            let stale = slots
                .by_scope
                .get(&key.scope)
                .is_some_and(|slot| Arc::ptr_eq(&slot.cell, &cell) && !cell.initialized());
            if stale {
                slots.by_scope.remove(&key.scope);
            }
        }
        result
    }

    fn cell_for(&self, key: CacheKey) -> Arc<OnceCell<V>> {
        let mut slots = self.slots.lock();
        slots.tick += 1;
        let tick = slots.tick;

        let hit = slots
            .by_scope
            .get_mut(&key.scope)
            .filter(|slot| slot.inputs == key.inputs)
            .map(|slot| {
                slot.last_used = tick;
                Arc::clone(&slot.cell)
            });
        if let Some(cell) = hit {
            return cell;
        }

        // a missing scope, or one computed from superseded inputs
        let cell = Arc::new(OnceCell::new());
        slots.by_scope.insert(
            key.scope,
            Slot {
                inputs: key.inputs,
                cell: Arc::clone(&cell),
                last_used: tick,
            },
        );
        slots.evict_over(self.max_entries);
        cell
    }

    /// Number of scopes held, including computations in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().by_scope.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.slots.lock().by_scope.clear();
    }
}
