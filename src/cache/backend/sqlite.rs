//! SQLite database backend.

use super::CacheBackend;
use crate::cache::config::SqliteConfig;
use crate::cache::entry::CacheEntry;
use crate::cache::key::CacheKey;
use crate::cache::serialization::SerializationFormat;
use crate::{Error, ErrorContext, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS cache_entries (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    last_accessed_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cache_entries_last_accessed ON cache_entries(last_accessed_at);
";

/// Durable backend storing entries as rows of a local SQLite database.
///
/// Values are serialized in the configured format; timestamps are stored as
/// Unix milliseconds. Cross-process access relies on SQLite's own locking
/// (WAL journal plus a busy timeout).
pub struct SqliteCache {
    conn: Mutex<Connection>,
    format: SerializationFormat,
}

impl SqliteCache {
    pub fn open(config: &SqliteConfig) -> Result<Self> {
        if let Some(parent) = config.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::backend_with_context(
                    format!("failed to create database directory: {}", e),
                    ErrorContext::new()
                        .with_details(parent.display().to_string())
                        .with_source("sqlite_cache"),
                )
            })?;
        }
        let conn = Connection::open(&config.db_path).map_err(|e| open_error(&config.db_path, e))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            format: config.serialization,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| {
            Error::runtime_with_context(
                "sqlite connection lock poisoned",
                ErrorContext::new().with_source("sqlite_cache"),
            )
        })
    }

    fn entry_from_row(&self, row: &Row<'_>) -> Result<(String, CacheEntry)> {
        let key: String = row.get(0)?;
        let blob: Vec<u8> = row.get(1)?;
        let value = self.format.decode(&blob).map_err(|e| {
            Error::serialization_with_context(
                format!("corrupted cache row: {}", e),
                ErrorContext::new()
                    .with_details(key.clone())
                    .with_source("sqlite_cache"),
            )
        })?;
        let entry = CacheEntry {
            key: key.clone(),
            value,
            created_at: from_millis(row.get(2)?)?,
            expires_at: from_millis(row.get(3)?)?,
            last_accessed_at: from_millis(row.get(4)?)?,
        };
        Ok((key, entry))
    }
}

fn open_error(path: &Path, e: rusqlite::Error) -> Error {
    Error::backend_with_context(
        format!("failed to open cache database: {}", e),
        ErrorContext::new()
            .with_details(path.display().to_string())
            .with_source("sqlite_cache"),
    )
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single().ok_or_else(|| {
        Error::serialization_with_context(
            "timestamp out of range",
            ErrorContext::new()
                .with_details(ms.to_string())
                .with_source("sqlite_cache"),
        )
    })
}

impl CacheBackend for SqliteCache {
    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let conn = self.conn()?;
        let found = conn
            .query_row(
                "SELECT key, value, created_at, expires_at, last_accessed_at
                 FROM cache_entries WHERE key = ?1",
                params![key.as_str()],
                |row| Ok(self.entry_from_row(row)),
            )
            .optional()?;
        Ok(found.transpose()?.map(|(_, entry)| entry))
    }

    fn set(&self, key: &CacheKey, entry: &CacheEntry) -> Result<()> {
        let blob = self.format.encode(&entry.value)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO cache_entries
             (key, value, created_at, expires_at, last_accessed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                key.as_str(),
                blob,
                entry.created_at.timestamp_millis(),
                entry.expires_at.timestamp_millis(),
                entry.last_accessed_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    fn touch(&self, key: &CacheKey, at: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE cache_entries SET last_accessed_at = ?2 WHERE key = ?1",
            params![key.as_str(), at.timestamp_millis()],
        )?;
        Ok(changed > 0)
    }

    fn delete(&self, key: &CacheKey) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "DELETE FROM cache_entries WHERE key = ?1",
            params![key.as_str()],
        )?;
        Ok(changed > 0)
    }

    fn clear_namespace(&self, prefix: &str) -> Result<usize> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM cache_entries WHERE substr(key, 1, length(?1)) = ?1",
            params![prefix],
        )?;
        Ok(removed)
    }

    fn iterate_namespace(&self, prefix: &str) -> Result<Vec<(String, CacheEntry)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT key, value, created_at, expires_at, last_accessed_at
             FROM cache_entries WHERE substr(key, 1, length(?1)) = ?1
             ORDER BY last_accessed_at, created_at",
        )?;
        let mut rows = stmt.query(params![prefix])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            match self.entry_from_row(row) {
                Ok(pair) => out.push(pair),
                Err(e) => tracing::warn!(error = %e, "skipping unreadable cache row"),
            }
        }
        Ok(out)
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT key FROM cache_entries WHERE substr(key, 1, length(?1)) = ?1",
        )?;
        let keys = stmt
            .query_map(params![prefix], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(keys)
    }

    fn size(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn contains(&self, key: &CacheKey) -> Result<bool> {
        let conn = self.conn()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM cache_entries WHERE key = ?1",
                params![key.as_str()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}
