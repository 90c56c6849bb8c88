//! Cache configuration
//!
//! `CacheConfig` is the whole configuration surface of the cache. It can be
//! built in code, parsed from YAML/JSON, or adjusted from `AI_CACHE_*`
//! environment variables. Every entry point ends in [`CacheConfig::validate`],
//! so an invalid value is reported at construction time and never coerced.

use super::serialization::SerializationFormat;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_TTL_SECS: u64 = 3600;
pub const DEFAULT_MAX_SIZE: usize = 1000;

/// Storage implementation behind the cache manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Volatile in-process map
    #[default]
    Memory,
    /// One file per entry under a directory
    Disk,
    /// Rows in a local SQLite database file
    Sqlite,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Memory => "memory",
            BackendKind::Disk => "disk",
            BackendKind::Sqlite => "sqlite",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(BackendKind::Memory),
            "disk" => Ok(BackendKind::Disk),
            "sqlite" => Ok(BackendKind::Sqlite),
            other => Err(Error::configuration_with_context(
                format!("unsupported cache backend '{}'", other),
                ErrorContext::new()
                    .with_field_path("backend")
                    .with_details("expected one of: memory, disk, sqlite"),
            )),
        }
    }
}

/// Strategy applied when an insert would overflow `max_size`.
///
/// Only LRU is defined; other names are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    #[default]
    Lru,
}

impl fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvictionPolicy::Lru => f.write_str("lru"),
        }
    }
}

impl FromStr for EvictionPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lru" => Ok(EvictionPolicy::Lru),
            other => Err(Error::configuration_with_context(
                format!("unsupported eviction policy '{}'", other),
                ErrorContext::new()
                    .with_field_path("eviction_policy")
                    .with_details("only 'lru' is supported"),
            )),
        }
    }
}

/// Settings for the disk backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiskConfig {
    pub cache_dir: PathBuf,
    pub serialization: SerializationFormat,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(".cache/inference"),
            serialization: SerializationFormat::Json,
        }
    }
}

/// Settings for the SQLite backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SqliteConfig {
    pub db_path: PathBuf,
    pub serialization: SerializationFormat,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(".cache/inference.db"),
            serialization: SerializationFormat::Json,
        }
    }
}

/// Per-backend settings, keyed by backend name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendConfig {
    pub disk: DiskConfig,
    pub sqlite: SqliteConfig,
}

/// Configuration for the cache manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Toggle caching without removing call sites
    pub enabled: bool,
    /// Selected storage implementation
    pub backend: BackendKind,
    /// Default time-to-live in seconds, applied when `set` has no override
    pub ttl: u64,
    /// Upper bound on the number of stored entries
    pub max_size: usize,
    pub eviction_policy: EvictionPolicy,
    pub backend_config: BackendConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: BackendKind::Memory,
            ttl: DEFAULT_TTL_SECS,
            max_size: DEFAULT_MAX_SIZE,
            eviction_policy: EvictionPolicy::Lru,
            backend_config: BackendConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// In-memory configuration with the given capacity.
    pub fn memory(max_size: usize) -> Self {
        Self::default().with_max_size(max_size)
    }

    /// Disk configuration rooted at `cache_dir`.
    pub fn disk(cache_dir: impl Into<PathBuf>) -> Self {
        Self::default()
            .with_backend(BackendKind::Disk)
            .with_disk_dir(cache_dir)
    }

    /// SQLite configuration stored at `db_path`.
    pub fn sqlite(db_path: impl Into<PathBuf>) -> Self {
        Self::default()
            .with_backend(BackendKind::Sqlite)
            .with_sqlite_path(db_path)
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_ttl_secs(mut self, ttl: u64) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.eviction_policy = policy;
        self
    }

    pub fn with_disk_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.backend_config.disk.cache_dir = cache_dir.into();
        self
    }

    pub fn with_sqlite_path(mut self, db_path: impl Into<PathBuf>) -> Self {
        self.backend_config.sqlite.db_path = db_path.into();
        self
    }

    /// Set the serialization format of both durable backends.
    pub fn with_serialization(mut self, format: SerializationFormat) -> Self {
        self.backend_config.disk.serialization = format;
        self.backend_config.sqlite.serialization = format;
        self
    }

    /// Default TTL as a duration.
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.ttl)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: CacheConfig = serde_yaml::from_str(content).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid cache configuration: {}", e),
                ErrorContext::new().with_source("yaml"),
            )
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: CacheConfig = serde_json::from_str(content).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid cache configuration: {}", e),
                ErrorContext::new().with_source("json"),
            )
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.yaml`/`.yml` or `.json` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration_with_context(
                format!("failed to read cache configuration: {}", e),
                ErrorContext::new().with_details(path.display().to_string()),
            )
        })?;
        match ext.as_deref() {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            Some("json") => Self::from_json_str(&content),
            _ => Err(Error::configuration_with_context(
                "unrecognized configuration file extension",
                ErrorContext::new()
                    .with_details(path.display().to_string())
                    .with_source("expected .yaml, .yml or .json"),
            )),
        }
    }

    /// Apply `AI_CACHE_*` environment variables on top of this configuration.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Some(v) = env_var("AI_CACHE_ENABLED") {
            self.enabled = parse_bool("AI_CACHE_ENABLED", &v)?;
        }
        if let Some(v) = env_var("AI_CACHE_BACKEND") {
            self.backend = v.parse()?;
        }
        if let Some(v) = env_var("AI_CACHE_TTL") {
            self.ttl = parse_number("AI_CACHE_TTL", &v)?;
        }
        if let Some(v) = env_var("AI_CACHE_MAX_SIZE") {
            self.max_size = parse_number("AI_CACHE_MAX_SIZE", &v)?;
        }
        if let Some(v) = env_var("AI_CACHE_EVICTION_POLICY") {
            self.eviction_policy = v.parse()?;
        }
        if let Some(v) = env_var("AI_CACHE_DIR") {
            self.backend_config.disk.cache_dir = PathBuf::from(v);
        }
        if let Some(v) = env_var("AI_CACHE_DB_PATH") {
            self.backend_config.sqlite.db_path = PathBuf::from(v);
        }
        if let Some(v) = env_var("AI_CACHE_SERIALIZATION") {
            self = self.with_serialization(v.parse()?);
        }
        self.validate()?;
        Ok(self)
    }

    /// Check numeric bounds and the settings of the selected backend.
    pub fn validate(&self) -> Result<()> {
        if self.ttl == 0 {
            return Err(invalid("ttl", "ttl must be greater than zero"));
        }
        if self.max_size == 0 {
            return Err(invalid("max_size", "max_size must be greater than zero"));
        }
        match self.backend {
            BackendKind::Memory => {}
            BackendKind::Disk => {
                if self.backend_config.disk.cache_dir.as_os_str().is_empty() {
                    return Err(invalid(
                        "backend_config.disk.cache_dir",
                        "disk backend requires a cache_dir",
                    ));
                }
            }
            BackendKind::Sqlite => {
                if self.backend_config.sqlite.db_path.as_os_str().is_empty() {
                    return Err(invalid(
                        "backend_config.sqlite.db_path",
                        "sqlite backend requires a db_path",
                    ));
                }
            }
        }
        Ok(())
    }
}

fn invalid(field: &str, message: &str) -> Error {
    Error::configuration_with_context(
        message,
        ErrorContext::new()
            .with_field_path(field)
            .with_source("cache_config"),
    )
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::configuration_with_context(
            format!("invalid boolean '{}'", other),
            ErrorContext::new().with_field_path(name),
        )),
    }
}

fn parse_number<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        Error::configuration_with_context(
            format!("invalid non-negative integer '{}'", value.trim()),
            ErrorContext::new().with_field_path(name),
        )
    })
}
