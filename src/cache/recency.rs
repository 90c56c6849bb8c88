//! Access-recency ordering for LRU eviction.

use super::entry::CacheEntry;
use lru::LruCache;

/// Keys ordered from least to most recently used.
///
/// Backed by `LruCache` (hash map plus intrusive linked list), so touching
/// and popping are O(1). Capacity is enforced by the manager against the
/// backend, never by this index.
pub(crate) struct RecencyIndex {
    order: LruCache<String, ()>,
}

impl RecencyIndex {
    pub(crate) fn new() -> Self {
        Self {
            order: LruCache::unbounded(),
        }
    }

    /// Seed from stored entries, oldest access first with ties broken by
    /// creation time.
    ///
    /// `stored` lists every key the backend holds; keys in it without a
    /// readable entry are placed first so they are evicted before anything
    /// that can still be served.
    pub(crate) fn from_entries(entries: Vec<(String, CacheEntry)>, stored: Vec<String>) -> Self {
        let mut index = Self::new();
        index.reseed(entries, stored);
        index
    }

    pub(crate) fn reseed(&mut self, mut entries: Vec<(String, CacheEntry)>, stored: Vec<String>) {
        entries.sort_by(|(ka, a), (kb, b)| {
            a.last_accessed_at
                .cmp(&b.last_accessed_at)
                .then(a.created_at.cmp(&b.created_at))
                .then_with(|| ka.cmp(kb))
        });
        self.order.clear();
        for key in stored {
            self.order.put(key, ());
        }
        for (key, _) in entries {
            // Readable keys already placed by `stored` move behind the unreadable ones.
            self.order.pop(&key);
            self.order.put(key, ());
        }
    }

    pub(crate) fn clear(&mut self) {
        self.order.clear();
    }

    /// Mark `key` as most recently used, inserting it if unknown.
    pub(crate) fn touch(&mut self, key: &str) {
        if self.order.get(key).is_none() {
            self.order.put(key.to_string(), ());
        }
    }

    pub(crate) fn remove(&mut self, key: &str) {
        self.order.pop(key);
    }

    /// Drop every key starting with `prefix`.
    pub(crate) fn remove_prefix(&mut self, prefix: &str) {
        let doomed: Vec<String> = self
            .order
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            self.order.pop(&key);
        }
    }

    pub(crate) fn pop_lru(&mut self) -> Option<String> {
        self.order.pop_lru().map(|(k, _)| k)
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }
}
