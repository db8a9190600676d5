//! LRU (Least Recently Used) tracking

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// Tracks access order of keys; the cache owning the values evicts
/// whatever `pop_oldest` hands back.
pub struct LruTracker<K: Clone + Eq + Hash> {
    /// Access generation -> key (first = oldest)
    order: BTreeMap<u64, K>,
    /// Latest generation per key
    positions: HashMap<K, u64>,
    generation: u64,
}

impl<K: Clone + Eq + Hash> LruTracker<K> {
    /// Create an empty tracker
    pub fn new() -> Self {
        LruTracker {
            order: BTreeMap::new(),
            positions: HashMap::new(),
            generation: 0,
        }
    }

    /// Record a use of `key`, inserting it if new
    pub fn touch(&mut self, key: &K) {
        self.generation += 1;
        if let Some(old) = self.positions.insert(key.clone(), self.generation) {
            self.order.remove(&old);
        }
        self.order.insert(self.generation, key.clone());
    }

    /// Stop tracking `key`
    pub fn remove(&mut self, key: &K) {
        if let Some(gen) = self.positions.remove(key) {
            self.order.remove(&gen);
        }
    }

    /// Remove and return the least recently used key
    pub fn pop_oldest(&mut self) -> Option<K> {
        let (_, key) = self.order.pop_first()?;
        self.positions.remove(&key);
        Some(key)
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.positions.clear();
        self.generation = 0;
    }
}

impl<K: Clone + Eq + Hash> Default for LruTracker<K> {
    fn default() -> Self {
        Self::new()
    }
}
