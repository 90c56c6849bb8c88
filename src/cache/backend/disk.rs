//! File-per-entry disk backend.

use super::CacheBackend;
use crate::cache::config::DiskConfig;
use crate::cache::entry::CacheEntry;
use crate::cache::key::CacheKey;
use crate::cache::serialization::SerializationFormat;
use crate::{Error, ErrorContext, Result};
use chrono::{DateTime, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::SystemTime;
use uuid::Uuid;

/// Durable backend storing one serialized entry per file.
///
/// Files are named `<key>.<ext>` inside the cache directory. Writes go to a
/// hidden temporary file first and are renamed into place, so a reader in
/// this or any other process sees either the old entry or the new one.
///
/// `touch` records the access time as the file's modification time and never
/// rewrites the entry. The `last_accessed_at` reported on read is the later of
/// the serialized field and that time.
pub struct DiskCache {
    dir: PathBuf,
    format: SerializationFormat,
    lock: RwLock<()>,
}

impl DiskCache {
    pub fn open(config: &DiskConfig) -> Result<Self> {
        fs::create_dir_all(&config.cache_dir).map_err(|e| {
            Error::backend_with_context(
                format!("failed to create cache directory: {}", e),
                ErrorContext::new()
                    .with_details(config.cache_dir.display().to_string())
                    .with_source("disk_cache"),
            )
        })?;
        Ok(Self {
            dir: config.cache_dir.clone(),
            format: config.serialization,
            lock: RwLock::new(()),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", key, self.format.extension()))
    }

    fn read_guard(&self) -> Result<RwLockReadGuard<'_, ()>> {
        self.lock.read().map_err(|_| poisoned())
    }

    fn write_guard(&self) -> Result<RwLockWriteGuard<'_, ()>> {
        self.lock.write().map_err(|_| poisoned())
    }

    fn read_entry(&self, key: &str) -> Result<Option<CacheEntry>> {
        let path = self.path_for(key);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let modified = file.metadata().and_then(|m| m.modified()).ok();

        let mut entry: CacheEntry = self.format.decode(&bytes).map_err(|e| {
            Error::serialization_with_context(
                format!("corrupted cache file: {}", e),
                ErrorContext::new()
                    .with_details(path.display().to_string())
                    .with_source("disk_cache"),
            )
        })?;
        if let Some(modified) = modified {
            entry.last_accessed_at = entry.last_accessed_at.max(DateTime::<Utc>::from(modified));
        }
        Ok(Some(entry))
    }

    fn write_entry(&self, key: &str, entry: &CacheEntry) -> Result<()> {
        let bytes = self.format.encode(entry)?;
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", key, Uuid::new_v4().simple()));
        let written = File::create(&tmp)
            .and_then(|mut f| {
                f.write_all(&bytes)?;
                f.sync_all()
            })
            .and_then(|_| fs::rename(&tmp, self.path_for(key)));
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    /// Keys of every entry file in the configured format.
    fn stored_keys(&self) -> Result<Vec<String>> {
        let suffix = format!(".{}", self.format.extension());
        let mut keys = Vec::new();
        for item in fs::read_dir(&self.dir)? {
            let item = item?;
            let name = item.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') {
                continue;
            }
            if let Some(key) = name.strip_suffix(&suffix) {
                keys.push(key.to_string());
            }
        }
        Ok(keys)
    }
}

fn poisoned() -> Error {
    Error::runtime_with_context(
        "disk cache lock poisoned",
        ErrorContext::new().with_source("disk_cache"),
    )
}

impl CacheBackend for DiskCache {
    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let _guard = self.read_guard()?;
        self.read_entry(key.as_str())
    }

    fn set(&self, key: &CacheKey, entry: &CacheEntry) -> Result<()> {
        let _guard = self.write_guard()?;
        self.write_entry(key.as_str(), entry)
    }

    fn touch(&self, key: &CacheKey, at: DateTime<Utc>) -> Result<bool> {
        let _guard = self.read_guard()?;
        let file = match OpenOptions::new().write(true).open(self.path_for(key.as_str())) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        file.set_modified(SystemTime::from(at))?;
        Ok(true)
    }

    fn delete(&self, key: &CacheKey) -> Result<bool> {
        let _guard = self.write_guard()?;
        match fs::remove_file(self.path_for(key.as_str())) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn clear_namespace(&self, prefix: &str) -> Result<usize> {
        let _guard = self.write_guard()?;
        let mut removed = 0;
        for key in self.stored_keys()? {
            if !key.starts_with(prefix) {
                continue;
            }
            match fs::remove_file(self.path_for(&key)) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }

    fn iterate_namespace(&self, prefix: &str) -> Result<Vec<(String, CacheEntry)>> {
        let _guard = self.read_guard()?;
        let mut out = Vec::new();
        for key in self.stored_keys()? {
            if !key.starts_with(prefix) {
                continue;
            }
            match self.read_entry(&key) {
                Ok(Some(entry)) => out.push((key, entry)),
                Ok(None) => {}
                Err(e) => tracing::warn!(key = %key, error = %e, "skipping unreadable cache file"),
            }
        }
        Ok(out)
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let _guard = self.read_guard()?;
        let mut keys = self.stored_keys()?;
        keys.retain(|key| key.starts_with(prefix));
        Ok(keys)
    }

    fn size(&self) -> Result<usize> {
        let _guard = self.read_guard()?;
        Ok(self.stored_keys()?.len())
    }

    // Presence only; an unreadable file still occupies a slot.
    fn contains(&self, key: &CacheKey) -> Result<bool> {
        let _guard = self.read_guard()?;
        Ok(self.path_for(key.as_str()).is_file())
    }

    fn name(&self) -> &'static str {
        "disk"
    }
}
