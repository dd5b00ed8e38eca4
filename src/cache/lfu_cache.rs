use std::{
    collections::{BTreeMap, HashMap},
    hash::Hash,
};
use tracing::trace;

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    frequency: u64,
    last_used: u64,
}

/// Bounded map that evicts the least frequently used entry, breaking ties by
/// least recent use.
///
/// Entries are indexed twice: by key, and by `(frequency, last_used)` so the
/// eviction candidate is always the first element of the ordered index.
#[derive(Debug)]
pub struct LfuCache<K, V> {
    capacity: usize,
    clock: u64,
    entries: HashMap<K, CacheEntry<V>>,
    order: BTreeMap<(u64, u64), K>,
    metrics: CacheMetrics,
}

impl<K, V> LfuCache<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    /// `capacity` is clamped to at least one entry.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            clock: 0,
            entries: HashMap::new(),
            order: BTreeMap::new(),
            metrics: CacheMetrics::default(),
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Returns a copy of the value and bumps its frequency and recency.
    pub fn get(&mut self, key: &K) -> Option<V> {
        let now = self.tick();
        let Some(entry) = self.entries.get_mut(key) else {
            self.metrics.misses += 1;
            return None;
        };

        self.order.remove(&(entry.frequency, entry.last_used));
        entry.frequency += 1;
        entry.last_used = now;
        self.order.insert((entry.frequency, entry.last_used), key.clone());
        self.metrics.hits += 1;
        Some(entry.value.clone())
    }

    /// Inserts or replaces `key`. Returns the evicted key, if any.
    pub fn insert(&mut self, key: K, value: V) -> Option<K> {
        let now = self.tick();

        if let Some(entry) = self.entries.get_mut(&key) {
            self.order.remove(&(entry.frequency, entry.last_used));
            entry.value = value;
            entry.frequency += 1;
            entry.last_used = now;
            self.order.insert((entry.frequency, entry.last_used), key);
            return None;
        }

        let mut evicted = None;
        if self.entries.len() >= self.capacity {
            if let Some((_, victim)) = self.order.pop_first() {
                self.entries.remove(&victim);
                self.metrics.evictions += 1;
                trace!("entrada de caché expulsada");
                evicted = Some(victim);
            }
        }

        self.order.insert((1, now), key.clone());
        self.entries.insert(
            key,
            CacheEntry {
                value,
                frequency: 1,
                last_used: now,
            },
        );
        evicted
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&(entry.frequency, entry.last_used));
        Some(entry.value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn metrics(&self) -> CacheMetrics {
        self.metrics.clone()
    }
}

/// Basic cache counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheMetrics {
    pub fn hit_rate(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            self.hits as f64 / (self.hits + self.misses) as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_overflow_evicts_oldest_k() {
        let mut cache = LfuCache::new(3);
        for key in ["a", "b", "c"] {
            assert_eq!(cache.insert(key, 0), None);
        }

        let evicted: Vec<_> = ["d", "e"]
            .into_iter()
            .filter_map(|key| cache.insert(key, 0))
            .collect();

        assert_eq!(evicted, vec!["a", "b"]);
        assert_eq!(cache.len(), 3);
        assert!(cache.contains(&"c"));
    }

    #[test]
    fn test_hit_is_not_next_victim() {
        let mut cache = LfuCache::new(2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        assert_eq!(cache.get(&"a"), Some(1));

        assert_eq!(cache.insert("c", 3), Some("b"));
        assert!(cache.contains(&"a"));
    }

    #[test]
    fn test_equal_frequency_breaks_on_recency() {
        let mut cache = LfuCache::new(2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.get(&"b");
        cache.get(&"a");

        // ambos con frecuencia 2, "b" se tocó primero
        assert_eq!(cache.insert("c", 3), Some("b"));
    }

    #[test]
    fn test_replace_and_remove() {
        let mut cache = LfuCache::new(2);
        cache.insert("a", 1);
        assert_eq!(cache.insert("a", 5), None);
        assert_eq!(cache.get(&"a"), Some(5));
        assert_eq!(cache.remove(&"a"), Some(5));
        assert!(cache.is_empty());
        assert_eq!(cache.get(&"a"), None);

        let metrics = cache.metrics();
        assert_eq!((metrics.hits, metrics.misses), (1, 1));
        assert_eq!(metrics.hit_rate(), 0.5);
    }
}
