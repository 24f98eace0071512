//! Bounded, insertion-order-evicting cache.
//!
//! Thin wrapper over the `lru` crate, narrowed to the four operations the
//! coordinator needs (`get`, `put`, `contains`, `clear`) — the same
//! convention the teacher crate uses to wrap general-purpose storage behind
//! a purpose-named module rather than exposing the underlying API wholesale.

use lru::LruCache as Inner;
use std::hash::Hash;
use std::num::NonZeroUsize;

pub struct LruCache<K, V> {
    inner: Inner<K, V>,
}

impl<K: Hash + Eq, V> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).expect("capacity must be non-zero");
        Self {
            inner: Inner::new(cap),
        }
    }

    /// Look up a value, promoting it to most-recently-inserted on hit.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.inner.get(key)
    }

    /// Insert a value, evicting the least-recently-inserted entry if the
    /// cache is at capacity.
    pub fn put(&mut self, key: K, value: V) {
        self.inner.put(key, value);
    }

    /// Membership test without promotion.
    pub fn contains(&self, key: &K) -> bool {
        self.inner.contains(key)
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eviction_is_least_recently_inserted_first() {
        let mut cache: LruCache<i32, &str> = LruCache::new(2);
        cache.put(1, "a");
        cache.put(2, "b");
        cache.put(3, "c"); // evicts 1
        assert!(!cache.contains(&1));
        assert!(cache.contains(&2));
        assert!(cache.contains(&3));
    }

    #[test]
    fn get_promotes_so_next_eviction_differs() {
        let mut cache: LruCache<i32, &str> = LruCache::new(2);
        cache.put(1, "a");
        cache.put(2, "b");
        assert_eq!(cache.get(&1), Some(&"a")); // promotes 1, 2 becomes oldest
        cache.put(3, "c"); // evicts 2, not 1
        assert!(cache.contains(&1));
        assert!(!cache.contains(&2));
        assert!(cache.contains(&3));
    }

    #[test]
    fn contains_does_not_promote() {
        let mut cache: LruCache<i32, &str> = LruCache::new(2);
        cache.put(1, "a");
        cache.put(2, "b");
        assert!(cache.contains(&1)); // no promotion
        cache.put(3, "c"); // evicts 1 still, since contains didn't promote
        assert!(!cache.contains(&1));
    }

    #[test]
    fn clear_empties_cache() {
        let mut cache: LruCache<i32, &str> = LruCache::new(2);
        cache.put(1, "a");
        cache.clear();
        assert!(cache.is_empty());
        assert!(!cache.contains(&1));
    }
}
