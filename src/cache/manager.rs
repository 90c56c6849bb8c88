//! Cache manager.

use super::backend::{self, CacheBackend};
use super::config::{CacheConfig, EvictionPolicy};
use super::entry::CacheEntry;
use super::key::{namespace_of, CacheKey};
use super::recency::RecencyIndex;
use super::serialization::to_json_value;
use super::stats::{AtomicStats, CacheStats};
use crate::{Error, ErrorContext, ErrorKind, Result};
use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

/// Single entry point for cached inference results.
///
/// Owns exactly one backend, enforces TTL on read, evicts on write and keeps
/// hit/miss counters. All mutations (writes, deletes, eviction, hit
/// bookkeeping, lazy reaping) run under one internal lock; backend reads run
/// outside it. `get` fails open, `set` fails closed.
pub struct CacheManager {
    config: CacheConfig,
    backend: Box<dyn CacheBackend>,
    recency: Mutex<RecencyIndex>,
    stats: AtomicStats,
}

impl CacheManager {
    /// Validate `config` and open the backend it selects.
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let backend = backend::open(&config)?;
        Self::with_backend(config, backend)
    }

    /// Manage a caller-supplied backend.
    pub fn with_backend(config: CacheConfig, backend: Box<dyn CacheBackend>) -> Result<Self> {
        config.validate()?;
        let recency = RecencyIndex::from_entries(backend.iterate_namespace("")?, backend.keys("")?);
        debug!(
            backend = backend.name(),
            entries = recency.len(),
            "cache manager ready"
        );
        Ok(Self {
            config,
            backend,
            recency: Mutex::new(recency),
            stats: AtomicStats::new(),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Look up a cached value.
    ///
    /// Absent, expired, unreadable and undecodable entries all come back as
    /// `None` and count as a miss. Expired entries and entries whose stored
    /// bytes cannot be decoded are deleted.
    pub fn get<T, I>(&self, model_id: &str, operation: &str, input: &I) -> Option<T>
    where
        T: DeserializeOwned,
        I: Serialize + ?Sized,
    {
        if !self.config.enabled {
            self.stats.miss();
            return None;
        }
        let key = match CacheKey::for_input(model_id, operation, input) {
            Ok(key) => key,
            Err(e) => return self.fail_open("key derivation failed", model_id, &e),
        };
        let entry = match self.backend.get(&key) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                self.stats.miss();
                debug!(model_id, operation, "cache miss");
                return None;
            }
            Err(e) if e.kind() == ErrorKind::Serialization => {
                if let Err(e) = self.discard(&key) {
                    warn!(model_id, error = %e, "failed to remove corrupted cache entry");
                }
                return self.fail_open("stored entry is corrupted", model_id, &e);
            }
            Err(e) => return self.fail_open("backend read failed", model_id, &e),
        };

        let now = Utc::now();
        if entry.is_expired_at(now) {
            self.stats.miss();
            debug!(model_id, operation, "cache entry expired");
            match self.discard(&key) {
                Ok(true) => self.stats.expired(1),
                Ok(false) => {}
                Err(e) => warn!(model_id, error = %e, "failed to remove expired cache entry"),
            }
            return None;
        }

        let value = match serde_json::from_value::<T>(entry.value) {
            Ok(value) => value,
            Err(e) => {
                let e = Error::from(e);
                return self.fail_open("cached value has unexpected shape", model_id, &e);
            }
        };
        self.stats.hit();
        debug!(model_id, operation, "cache hit");
        if let Err(e) = self.mark_accessed(&key, now) {
            warn!(model_id, error = %e, "failed to record cache access");
        }
        Some(value)
    }

    /// Store a value, evicting least-recently-used entries if the key is new
    /// and the cache is full. `ttl` overrides the configured default.
    pub fn set<T, I>(
        &self,
        model_id: &str,
        operation: &str,
        input: &I,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()>
    where
        T: Serialize + ?Sized,
        I: Serialize + ?Sized,
    {
        if !self.config.enabled {
            return Ok(());
        }
        let key = CacheKey::for_input(model_id, operation, input)?;
        let value = to_json_value(value)?;
        let entry = CacheEntry::new(
            key.as_str(),
            value,
            ttl.unwrap_or_else(|| self.config.default_ttl()),
        );

        let mut recency = self.lock_recency()?;
        let result = self
            .make_room(&mut recency, &key)
            .and_then(|_| self.backend.set(&key, &entry));
        match result {
            Ok(()) => {
                recency.touch(key.as_str());
                self.stats.set();
                debug!(model_id, operation, "cache set");
                Ok(())
            }
            Err(e) => {
                self.stats.error();
                Err(e)
            }
        }
    }

    /// Return the cached value, or compute, store and return it.
    ///
    /// Errors from `compute` propagate and nothing is stored.
    pub fn get_or_compute<T, I, F>(
        &self,
        model_id: &str,
        operation: &str,
        input: &I,
        ttl: Option<Duration>,
        compute: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        I: Serialize + ?Sized,
        F: FnOnce() -> Result<T>,
    {
        if let Some(value) = self.get(model_id, operation, input) {
            return Ok(value);
        }
        let value = compute()?;
        self.set(model_id, operation, input, &value, ttl)?;
        Ok(value)
    }

    /// Whether a live entry exists. Does not affect stats or recency.
    pub fn contains<I>(&self, model_id: &str, operation: &str, input: &I) -> bool
    where
        I: Serialize + ?Sized,
    {
        if !self.config.enabled {
            return false;
        }
        CacheKey::for_input(model_id, operation, input)
            .and_then(|key| self.backend.get(&key))
            .map(|entry| entry.map_or(false, |e| !e.is_expired()))
            .unwrap_or(false)
    }

    /// Remove one entry. Deleting an absent key returns `Ok(false)`.
    pub fn delete<I>(&self, model_id: &str, operation: &str, input: &I) -> Result<bool>
    where
        I: Serialize + ?Sized,
    {
        if !self.config.enabled {
            return Ok(false);
        }
        let key = CacheKey::for_input(model_id, operation, input)?;
        let mut recency = self.lock_recency()?;
        let deleted = self.backend.delete(&key)?;
        recency.remove(key.as_str());
        if deleted {
            self.stats.deleted(1);
        }
        Ok(deleted)
    }

    /// Remove every entry cached for `model_id`; other models are untouched.
    pub fn clear_namespace(&self, model_id: &str) -> Result<usize> {
        if !self.config.enabled {
            return Ok(0);
        }
        let prefix = namespace_of(model_id);
        let mut recency = self.lock_recency()?;
        let removed = self.backend.clear_namespace(&prefix)?;
        recency.remove_prefix(&prefix);
        self.stats.deleted(removed as u64);
        debug!(model_id, removed, "cache namespace cleared");
        Ok(removed)
    }

    /// Remove every entry of every namespace.
    pub fn clear(&self) -> Result<usize> {
        if !self.config.enabled {
            return Ok(0);
        }
        let mut recency = self.lock_recency()?;
        let removed = self.backend.clear_namespace("")?;
        recency.clear();
        self.stats.deleted(removed as u64);
        Ok(removed)
    }

    /// Eagerly delete expired entries; returns how many were removed.
    pub fn purge_expired(&self) -> Result<usize> {
        if !self.config.enabled {
            return Ok(0);
        }
        let mut recency = self.lock_recency()?;
        let now = Utc::now();
        let mut removed = 0;
        for (key, entry) in self.backend.iterate_namespace("")? {
            if entry.is_expired_at(now) {
                let key = stored_key(key);
                if self.backend.delete(&key)? {
                    removed += 1;
                }
                recency.remove(key.as_str());
            }
        }
        self.stats.expired(removed as u64);
        Ok(removed)
    }

    pub fn get_stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    /// Zero the counters. Stored entries are untouched.
    pub fn reset(&self) {
        self.stats.reset();
    }

    /// Number of entries currently held by the backend.
    pub fn get_size(&self) -> Result<usize> {
        self.backend.size()
    }

    fn lock_recency(&self) -> Result<MutexGuard<'_, RecencyIndex>> {
        self.recency.lock().map_err(|_| {
            Error::runtime_with_context(
                "cache recency lock poisoned",
                ErrorContext::new().with_source("cache_manager"),
            )
        })
    }

    fn fail_open<T>(&self, what: &str, model_id: &str, error: &Error) -> Option<T> {
        self.stats.miss();
        self.stats.error();
        warn!(model_id, error = %error, "{}; treating as cache miss", what);
        None
    }

    /// Delete `key` unless a live entry is found once the lock is held; a
    /// concurrent `set` may have replaced it in the meantime. Returns whether
    /// anything was deleted.
    fn discard(&self, key: &CacheKey) -> Result<bool> {
        let mut recency = self.lock_recency()?;
        match self.backend.get(key) {
            Ok(Some(entry)) if !entry.is_expired() => return Ok(false),
            Ok(None) => {
                recency.remove(key.as_str());
                return Ok(false);
            }
            // Expired, or unreadable: either way it has to go.
            Ok(Some(_)) | Err(_) => {}
        }
        let deleted = self.backend.delete(key)?;
        recency.remove(key.as_str());
        Ok(deleted)
    }

    fn mark_accessed(&self, key: &CacheKey, at: chrono::DateTime<Utc>) -> Result<()> {
        // A key deleted in between only leaves a stale index slot, which
        // eviction skips.
        if self.backend.touch(key, at)? {
            self.lock_recency()?.touch(key.as_str());
        }
        Ok(())
    }

    /// Evict until one slot is free for `key`. Overwrites need no room.
    fn make_room(&self, recency: &mut RecencyIndex, key: &CacheKey) -> Result<()> {
        if self.backend.contains(key)? {
            return Ok(());
        }
        let mut reseeded = false;
        while self.backend.size()? >= self.config.max_size {
            let victim = match self.config.eviction_policy {
                EvictionPolicy::Lru => recency.pop_lru(),
            };
            match victim {
                Some(victim) => {
                    if self.backend.delete(&stored_key(victim.clone()))? {
                        self.stats.evicted();
                        debug!(key = %victim, "evicted least recently used cache entry");
                    }
                }
                // Entries written by another process, or left undecodable,
                // are unknown to the index; pick them up once before giving up.
                None if !reseeded => {
                    recency.reseed(self.backend.iterate_namespace("")?, self.backend.keys("")?);
                    recency.remove(key.as_str());
                    reseeded = true;
                }
                None => {
                    return Err(Error::backend_with_context(
                        "cache is full and no entry could be evicted",
                        ErrorContext::new()
                            .with_details(format!("max_size = {}", self.config.max_size))
                            .with_source("cache_manager"),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Rebuild a key handle from its stored string form; model and operation are
/// not recoverable from the digest and are left empty.
fn stored_key(hash: String) -> CacheKey {
    CacheKey {
        hash,
        model_id: String::new(),
        operation: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backend::MemoryCache;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn manager(max_size: usize) -> CacheManager {
        CacheManager::new(CacheConfig::memory(max_size)).unwrap()
    }

    /// Backend whose reads or writes always fail.
    struct FailingBackend {
        fail_reads: bool,
        inner: MemoryCache,
    }

    impl CacheBackend for FailingBackend {
        fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
            if self.fail_reads {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "disk on fire").into());
            }
            self.inner.get(key)
        }
        fn set(&self, key: &CacheKey, entry: &CacheEntry) -> Result<()> {
            if !self.fail_reads {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full").into());
            }
            self.inner.set(key, entry)
        }
        fn touch(&self, key: &CacheKey, at: chrono::DateTime<Utc>) -> Result<bool> {
            self.inner.touch(key, at)
        }
        fn delete(&self, key: &CacheKey) -> Result<bool> {
            self.inner.delete(key)
        }
        fn clear_namespace(&self, prefix: &str) -> Result<usize> {
            self.inner.clear_namespace(prefix)
        }
        fn iterate_namespace(&self, prefix: &str) -> Result<Vec<(String, CacheEntry)>> {
            self.inner.iterate_namespace(prefix)
        }
        fn size(&self) -> Result<usize> {
            self.inner.size()
        }
        fn contains(&self, key: &CacheKey) -> Result<bool> {
            self.inner.contains(key)
        }
        fn name(&self) -> &'static str {
            "failing"
        }
    }

    #[test]
    fn test_get_after_set() {
        let cache = manager(10);
        cache.set("gpt-4o", "chat", "hi", &json!({"text": "hello"}), None).unwrap();
        let value: Option<serde_json::Value> = cache.get("gpt-4o", "chat", "hi");
        assert_eq!(value, Some(json!({"text": "hello"})));
        let other: Option<serde_json::Value> = cache.get("gpt-4o", "embed", "hi");
        assert_eq!(other, None);
        let stats = cache.get_stats();
        assert_eq!((stats.hits, stats.misses, stats.sets), (1, 1, 1));
    }

    #[test]
    fn test_typed_values() {
        #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
        struct Completion {
            text: String,
            tokens: u32,
        }
        let cache = manager(10);
        let completion = Completion { text: "ok".into(), tokens: 2 };
        cache.set("m", "complete", &json!({"prompt": "p", "t": 0.2}), &completion, None).unwrap();
        let back: Option<Completion> =
            cache.get("m", "complete", &json!({"t": 0.2, "prompt": "p"}));
        assert_eq!(back, Some(completion));
    }

    #[test]
    fn test_wrong_shape_is_a_miss() {
        let cache = manager(10);
        cache.set("m", "op", "in", "a string", None).unwrap();
        let as_number: Option<u64> = cache.get("m", "op", "in");
        assert_eq!(as_number, None);
        let stats = cache.get_stats();
        assert_eq!((stats.hits, stats.misses, stats.errors), (0, 1, 1));
    }

    #[test]
    fn test_expired_entry_is_reaped() {
        let cache = manager(10);
        cache.set("m", "op", "in", &1, Some(Duration::from_millis(50))).unwrap();
        assert_eq!(cache.get::<i32, _>("m", "op", "in"), Some(1));
        std::thread::sleep(Duration::from_millis(80));
        assert!(!cache.contains("m", "op", "in"));
        assert_eq!(cache.get::<i32, _>("m", "op", "in"), None);
        assert_eq!(cache.get_size().unwrap(), 0);
        assert_eq!(cache.get_stats().expirations, 1);
    }

    #[test]
    fn test_purge_expired() {
        let cache = manager(10);
        cache.set("m", "op", "short", &1, Some(Duration::from_millis(20))).unwrap();
        cache.set("m", "op", "long", &2, None).unwrap();
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.purge_expired().unwrap(), 1);
        assert_eq!(cache.get_size().unwrap(), 1);
        assert_eq!(cache.get::<i32, _>("m", "op", "long"), Some(2));
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let cache = manager(2);
        cache.set("m", "op", "a", &1, None).unwrap();
        cache.set("m", "op", "b", &2, None).unwrap();
        cache.set("m", "op", "a", &3, None).unwrap();
        assert_eq!(cache.get_size().unwrap(), 2);
        assert_eq!(cache.get_stats().evictions, 0);
        assert_eq!(cache.get::<i32, _>("m", "op", "a"), Some(3));
        let stats = cache.get_stats();
        assert_eq!(stats.hits + stats.misses, 1);
    }

    #[test]
    fn test_overwrite_refreshes_recency() {
        let cache = manager(2);
        cache.set("m", "op", "a", &1, None).unwrap();
        cache.set("m", "op", "b", &2, None).unwrap();
        cache.set("m", "op", "a", &10, None).unwrap();
        cache.set("m", "op", "c", &3, None).unwrap();
        assert!(cache.contains("m", "op", "a"));
        assert!(!cache.contains("m", "op", "b"));
    }

    #[test]
    fn test_get_or_compute() {
        let cache = manager(10);
        let calls = AtomicUsize::new(0);
        let compute = || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!("expensive"))
        };
        let first = cache.get_or_compute("m", "op", "in", None, compute).unwrap();
        let second = cache.get_or_compute("m", "op", "in", None, compute).unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let err = cache
            .get_or_compute::<serde_json::Value, _, _>("m", "op", "other", None, || {
                Err(Error::runtime_with_context("model down", ErrorContext::new()))
            })
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Runtime);
        assert!(!cache.contains("m", "op", "other"));
    }

    #[test]
    fn test_disabled_cache() {
        let cache = CacheManager::new(CacheConfig::memory(10).with_enabled(false)).unwrap();
        assert!(!cache.is_enabled());
        assert_eq!(cache.backend_name(), "null");
        cache.set("m", "op", "in", &1, None).unwrap();
        assert_eq!(cache.get::<i32, _>("m", "op", "in"), None);
        assert!(!cache.delete("m", "op", "in").unwrap());
        assert_eq!(cache.get_size().unwrap(), 0);
        let stats = cache.get_stats();
        assert_eq!((stats.hits, stats.misses), (0, 1));
    }

    #[test]
    fn test_invalid_config_is_fatal() {
        let err = CacheManager::new(CacheConfig::memory(0)).err().unwrap();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_read_failure_fails_open() {
        let backend = FailingBackend {
            fail_reads: true,
            inner: MemoryCache::new(),
        };
        let cache = CacheManager::with_backend(CacheConfig::memory(10), Box::new(backend)).unwrap();
        cache.set("m", "op", "in", &1, None).unwrap();
        assert_eq!(cache.get::<i32, _>("m", "op", "in"), None);
        let stats = cache.get_stats();
        assert_eq!((stats.misses, stats.errors), (1, 1));
    }

    #[test]
    fn test_write_failure_fails_closed() {
        let backend = FailingBackend {
            fail_reads: false,
            inner: MemoryCache::new(),
        };
        let cache = CacheManager::with_backend(CacheConfig::memory(10), Box::new(backend)).unwrap();
        let err = cache.set("m", "op", "in", &1, None).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::BackendIo);
        assert_eq!(cache.get_stats().errors, 1);
    }

    #[test]
    fn test_unserializable_value_is_an_error() {
        use std::collections::HashMap;
        let cache = manager(10);
        // Non-string map keys cannot be represented as JSON objects.
        let mut bad: HashMap<(u8, u8), u8> = HashMap::new();
        bad.insert((1, 2), 3);
        let err = cache.set("m", "op", "in", &bad, None).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Serialization);
        assert_eq!(cache.get_size().unwrap(), 0);
    }

    #[test]
    fn test_non_finite_floats_are_rejected() {
        let cache = manager(10);
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let err = cache.set("m", "op", "in", &bad, None).unwrap_err();
            assert_eq!(err.kind(), crate::ErrorKind::Serialization);
            let err = cache.set("m", "op", "nested", &json!({"x": 1}), None).and_then(|_| {
                cache.set("m", "op", "nested", &vec![Some(1.0), Some(bad)], None)
            });
            assert_eq!(err.unwrap_err().kind(), crate::ErrorKind::Serialization);
        }
        // The rejected overwrite left the previous value in place.
        assert_eq!(cache.get::<serde_json::Value, _>("m", "op", "nested"), Some(json!({"x": 1})));
        assert!(!cache.contains("m", "op", "in"));
        cache.set("m", "op", "in", &None::<f64>, None).unwrap();
        assert_eq!(cache.get::<Option<f64>, _>("m", "op", "in"), Some(None));
    }

    #[test]
    fn test_evicts_entries_unknown_to_index() {
        let backend = Arc::new(MemoryCache::new());
        // Pre-populate behind the manager's back after construction.
        struct Shared(Arc<MemoryCache>);
        impl CacheBackend for Shared {
            fn get(&self, k: &CacheKey) -> Result<Option<CacheEntry>> {
                self.0.get(k)
            }
            fn set(&self, k: &CacheKey, e: &CacheEntry) -> Result<()> {
                self.0.set(k, e)
            }
            fn touch(&self, k: &CacheKey, at: chrono::DateTime<Utc>) -> Result<bool> {
                self.0.touch(k, at)
            }
            fn delete(&self, k: &CacheKey) -> Result<bool> {
                self.0.delete(k)
            }
            fn clear_namespace(&self, p: &str) -> Result<usize> {
                self.0.clear_namespace(p)
            }
            fn iterate_namespace(&self, p: &str) -> Result<Vec<(String, CacheEntry)>> {
                self.0.iterate_namespace(p)
            }
            fn size(&self) -> Result<usize> {
                self.0.size()
            }
            fn name(&self) -> &'static str {
                "shared"
            }
        }
        let shared = Box::new(Shared(Arc::clone(&backend)));
        let cache = CacheManager::with_backend(CacheConfig::memory(2), shared).unwrap();
        for input in ["x", "y"] {
            let key = CacheKey::for_input("m", "op", input).unwrap();
            backend
                .set(&key, &CacheEntry::new(key.as_str(), json!(input), Duration::from_secs(60)))
                .unwrap();
        }
        cache.set("m", "op", "z", &1, None).unwrap();
        assert_eq!(cache.get_size().unwrap(), 2);
        assert_eq!(cache.get_stats().evictions, 1);
        assert!(cache.contains("m", "op", "z"));
    }
}
