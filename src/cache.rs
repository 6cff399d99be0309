use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

use log::trace;

/// Bounded map with approximate eviction. Correctness of every consumer rests
/// on explicit invalidation, so overflow is handled by dropping an arbitrary
/// quarter of the entries rather than tracking precise recency.
pub(crate) struct Cache<K, V> {
    capacity: usize,
    map: Mutex<HashMap<K, V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> Cache<K, V> {
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(capacity >= 4);
        Self {
            capacity,
            map: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn get(&self, key: &K) -> Option<V> {
        self.map.lock().unwrap().get(key).cloned()
    }

    pub(crate) fn insert(&self, key: K, value: V) {
        let mut map = self.map.lock().unwrap();
        if map.len() >= self.capacity && !map.contains_key(&key) {
            let victims: Vec<K> = map.keys().take(self.capacity / 4).cloned().collect();
            trace!("cache overflow, evicting {} of {} entries", victims.len(), map.len());
            for victim in victims {
                map.remove(&victim);
            }
        }
        map.insert(key, value);
    }

    pub(crate) fn remove(&self, key: &K) {
        self.map.lock().unwrap().remove(key);
    }

    pub(crate) fn clear(&self) {
        self.map.lock().unwrap().clear();
    }
}
