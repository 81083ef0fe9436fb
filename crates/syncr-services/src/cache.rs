//! Time-bounded caches for peer and chunk-list lookups.
//!
//! Entries expire after a fixed TTL and the map is capped — when full, the
//! stalest entry is evicted. Values are cloned out; keep them cheap.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct TtlCache<K, V> {
    ttl: Duration,
    capacity: usize,
    entries: Mutex<HashMap<K, (Instant, V)>>,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        match entries.get(key) {
            Some((stored, value)) if stored.elapsed() < self.ttl => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: K, value: V) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        entries.retain(|_, (stored, _)| stored.elapsed() < self.ttl);
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            if let Some(stalest) = entries
                .iter()
                .min_by_key(|(_, (stored, _))| *stored)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&stalest);
            }
        }
        entries.insert(key, (Instant::now(), value));
    }

    pub fn invalidate(&self, key: &K) {
        self.entries.lock().expect("cache lock poisoned").remove(key);
    }

    pub fn clear(&self) {
        self.entries.lock().expect("cache lock poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_fresh_entries() {
        let cache = TtlCache::new(Duration::from_secs(60), 8);
        cache.insert("k", 1u32);
        assert_eq!(cache.get(&"k"), Some(1));
        assert_eq!(cache.get(&"missing"), None);
    }

    #[test]
    fn expired_entries_are_dropped() {
        let cache = TtlCache::new(Duration::from_millis(0), 8);
        cache.insert("k", 1u32);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(cache.get(&"k"), None);
    }

    #[test]
    fn capacity_evicts_stalest() {
        let cache = TtlCache::new(Duration::from_secs(60), 2);
        cache.insert("a", 1u32);
        std::thread::sleep(Duration::from_millis(2));
        cache.insert("b", 2u32);
        std::thread::sleep(Duration::from_millis(2));
        cache.insert("c", 3u32);
        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.get(&"b"), Some(2));
        assert_eq!(cache.get(&"c"), Some(3));
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache = TtlCache::new(Duration::from_secs(60), 8);
        cache.insert("k", 1u32);
        cache.invalidate(&"k");
        assert_eq!(cache.get(&"k"), None);
    }
}
