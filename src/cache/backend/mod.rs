//! Cache backend implementations.

mod disk;
mod memory;
mod sqlite;

pub use disk::DiskCache;
pub use memory::MemoryCache;
pub use sqlite::SqliteCache;

use super::config::{BackendKind, CacheConfig};
use super::entry::CacheEntry;
use super::key::CacheKey;
use crate::Result;
use chrono::{DateTime, Utc};

/// Storage contract shared by every backend.
///
/// Backends own physical storage only; TTL, eviction and statistics live in
/// the manager. Implementations must round-trip values exactly and never let
/// a reader observe a partially written entry.
pub trait CacheBackend: Send + Sync {
    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>>;
    /// Insert or overwrite the entry stored under `key`.
    fn set(&self, key: &CacheKey, entry: &CacheEntry) -> Result<()>;
    /// Refresh `last_accessed_at` only. Returns false if the key is absent.
    fn touch(&self, key: &CacheKey, at: DateTime<Utc>) -> Result<bool>;
    fn delete(&self, key: &CacheKey) -> Result<bool>;
    /// Remove every entry whose key starts with `prefix`; returns how many.
    fn clear_namespace(&self, prefix: &str) -> Result<usize>;
    /// Readable entries whose key starts with `prefix`. Entries that fail to
    /// decode are skipped; [`CacheBackend::keys`] still reports them.
    fn iterate_namespace(&self, prefix: &str) -> Result<Vec<(String, CacheEntry)>>;
    /// Every stored key starting with `prefix`, undecodable entries included.
    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .iterate_namespace(prefix)?
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }
    /// Number of stored entries, expired-but-unreaped ones included.
    fn size(&self) -> Result<usize>;
    fn contains(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }
    fn name(&self) -> &'static str;
}

/// Build the backend selected by `config`.
///
/// A disabled configuration gets a [`NullCache`] so no storage is created.
pub fn open(config: &CacheConfig) -> Result<Box<dyn CacheBackend>> {
    if !config.enabled {
        return Ok(Box::new(NullCache::new()));
    }
    let backend: Box<dyn CacheBackend> = match config.backend {
        BackendKind::Memory => Box::new(MemoryCache::new()),
        BackendKind::Disk => Box::new(DiskCache::open(&config.backend_config.disk)?),
        BackendKind::Sqlite => Box::new(SqliteCache::open(&config.backend_config.sqlite)?),
    };
    tracing::info!(backend = backend.name(), "cache backend opened");
    Ok(backend)
}

pub struct NullCache;
impl NullCache {
    pub fn new() -> Self {
        Self
    }
}
impl Default for NullCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheBackend for NullCache {
    fn get(&self, _: &CacheKey) -> Result<Option<CacheEntry>> {
        Ok(None)
    }
    fn set(&self, _: &CacheKey, _: &CacheEntry) -> Result<()> {
        Ok(())
    }
    fn touch(&self, _: &CacheKey, _: DateTime<Utc>) -> Result<bool> {
        Ok(false)
    }
    fn delete(&self, _: &CacheKey) -> Result<bool> {
        Ok(false)
    }
    fn clear_namespace(&self, _: &str) -> Result<usize> {
        Ok(0)
    }
    fn iterate_namespace(&self, _: &str) -> Result<Vec<(String, CacheEntry)>> {
        Ok(Vec::new())
    }
    fn size(&self) -> Result<usize> {
        Ok(0)
    }
    fn name(&self) -> &'static str {
        "null"
    }
}

/// Contract checks run against every backend implementation.
#[cfg(test)]
pub(crate) mod contract {
    use super::*;
    use crate::cache::key::namespace_of;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn entry(key: &CacheKey, value: serde_json::Value) -> CacheEntry {
        CacheEntry::new(key.as_str(), value, Duration::from_secs(60))
    }

    pub(crate) fn round_trip(backend: &dyn CacheBackend) {
        let key = CacheKey::new("model-a", "chat", "hello");
        let value = json!({"text": "hi", "logprobs": [-0.25, -1.5], "usage": {"in": 3, "out": 1}});
        assert!(backend.get(&key).unwrap().is_none());
        backend.set(&key, &entry(&key, value.clone())).unwrap();
        let stored = backend.get(&key).unwrap().unwrap();
        assert_eq!(stored.value, value);
        assert_eq!(stored.key, key.as_str());
        assert!(backend.contains(&key).unwrap());
        assert_eq!(backend.size().unwrap(), 1);

        backend.set(&key, &entry(&key, json!("v2"))).unwrap();
        assert_eq!(backend.get(&key).unwrap().unwrap().value, json!("v2"));
        assert_eq!(backend.size().unwrap(), 1);
    }

    pub(crate) fn touch_and_delete(backend: &dyn CacheBackend) {
        let key = CacheKey::new("model-a", "chat", "touch");
        let e = entry(&key, json!(1));
        backend.set(&key, &e).unwrap();
        let later = e.last_accessed_at + chrono::Duration::seconds(5);
        assert!(backend.touch(&key, later).unwrap());
        let stored = backend.get(&key).unwrap().unwrap();
        assert_eq!(stored.last_accessed_at.timestamp_millis(), later.timestamp_millis());
        assert_eq!(stored.value, json!(1));

        assert!(backend.delete(&key).unwrap());
        assert!(!backend.delete(&key).unwrap());
        assert!(!backend.touch(&key, later).unwrap());
        assert_eq!(backend.size().unwrap(), 0);
    }

    pub(crate) fn namespaces(backend: &dyn CacheBackend) {
        let a1 = CacheKey::new("model-a", "op", "1");
        let a2 = CacheKey::new("model-a", "op", "2");
        let b1 = CacheKey::new("model-b", "op", "1");
        for k in [&a1, &a2, &b1] {
            backend.set(k, &entry(k, json!(k.as_str()))).unwrap();
        }
        let listed = backend.iterate_namespace(&namespace_of("model-a")).unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|(k, e)| k == &e.key && k.starts_with(a1.namespace())));
        assert_eq!(backend.iterate_namespace("").unwrap().len(), 3);
        let mut keys = backend.keys(&namespace_of("model-a")).unwrap();
        keys.sort();
        let mut expected = vec![a1.hash.clone(), a2.hash.clone()];
        expected.sort();
        assert_eq!(keys, expected);

        assert_eq!(backend.clear_namespace(&namespace_of("model-a")).unwrap(), 2);
        assert_eq!(backend.size().unwrap(), 1);
        assert!(backend.get(&b1).unwrap().is_some());
        assert_eq!(backend.clear_namespace(&namespace_of("model-a")).unwrap(), 0);
    }

    pub(crate) fn concurrent_writers(backend: Arc<dyn CacheBackend>) {
        let key = CacheKey::new("model-a", "op", "shared");
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let backend = Arc::clone(&backend);
                let key = key.clone();
                std::thread::spawn(move || {
                    for i in 0..20 {
                        let payload = json!({"writer": t, "seq": i, "body": "x".repeat(256)});
                        backend.set(&key, &entry(&key, payload)).unwrap();
                        let seen = backend.get(&key).unwrap().unwrap();
                        assert_eq!(seen.value["body"].as_str().unwrap().len(), 256);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(backend.size().unwrap(), 1);
        let last = backend.get(&key).unwrap().unwrap().value;
        assert_eq!(last["seq"], json!(19));
    }
}
