use std::hash::Hash;
use std::num::NonZeroUsize;

use lru::LruCache;

/// Bounded map that forgets its least recently used entry first.
///
/// Not synchronized; owners keep it behind their own lock.
pub struct Cache<K: Hash + Eq, V> {
    inner: LruCache<K, V>,
}

impl<K: Hash + Eq, V> Cache<K, V> {
    /// A zero capacity is treated as one.
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Cache {
            inner: LruCache::new(cap),
        }
    }

    pub fn unbounded() -> Self {
        Cache {
            inner: LruCache::unbounded(),
        }
    }

    /// Inserts or refreshes `key`; returns the entry evicted to make room.
    pub fn put(&mut self, key: K, value: V) -> Option<(K, V)> {
        let evicted = if !self.inner.contains(&key) && self.inner.len() >= self.inner.cap().get() {
            self.inner.pop_lru()
        } else {
            None
        };
        self.inner.put(key, value);
        evicted
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.inner.get(key)
    }

    pub fn peek(&self, key: &K) -> Option<&V> {
        self.inner.peek(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.contains(key)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.inner.pop(key)
    }

    pub fn peek_lru(&self) -> Option<(&K, &V)> {
        self.inner.peek_lru()
    }

    pub fn pop_lru(&mut self) -> Option<(K, V)> {
        self.inner.pop_lru()
    }

    /// Entries from least to most recently used.
    pub fn iter_oldest_first(&self) -> impl Iterator<Item = (&K, &V)> {
        self.inner.iter().rev()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.cap().get()
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }
}
