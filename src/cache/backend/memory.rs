//! In-process memory backend.

use super::CacheBackend;
use crate::cache::entry::CacheEntry;
use crate::cache::key::CacheKey;
use crate::{Error, ErrorContext, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Volatile in-process backend; contents are lost when the process exits.
pub struct MemoryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, CacheEntry>>> {
        self.entries.read().map_err(|_| poisoned())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, CacheEntry>>> {
        self.entries.write().map_err(|_| poisoned())
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> Error {
    Error::runtime_with_context(
        "memory cache lock poisoned",
        ErrorContext::new().with_source("memory_cache"),
    )
}

impl CacheBackend for MemoryCache {
    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        Ok(self.read()?.get(key.as_str()).cloned())
    }
    fn set(&self, key: &CacheKey, entry: &CacheEntry) -> Result<()> {
        self.write()?.insert(key.as_str().to_string(), entry.clone());
        Ok(())
    }
    fn touch(&self, key: &CacheKey, at: DateTime<Utc>) -> Result<bool> {
        match self.write()?.get_mut(key.as_str()) {
            Some(entry) => {
                entry.last_accessed_at = at;
                Ok(true)
            }
            None => Ok(false),
        }
    }
    fn delete(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.write()?.remove(key.as_str()).is_some())
    }
    fn clear_namespace(&self, prefix: &str) -> Result<usize> {
        let mut entries = self.write()?;
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(prefix));
        Ok(before - entries.len())
    }
    fn iterate_namespace(&self, prefix: &str) -> Result<Vec<(String, CacheEntry)>> {
        Ok(self
            .read()?
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect())
    }
    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .read()?
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
    fn size(&self) -> Result<usize> {
        Ok(self.read()?.len())
    }
    fn name(&self) -> &'static str {
        "memory"
    }
}
