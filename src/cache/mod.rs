//! 推理结果缓存模块：可插拔后端、TTL 过期、LRU 淘汰与命中率统计。
//!
//! # Inference Result Caching Module
//!
//! This module caches the results of expensive model invocations, keyed by
//! `(model_id, operation, input)`, behind a single thread-safe façade.
//!
//! ## Overview
//!
//! - Values expire after a time-to-live; expired entries are never returned
//! - The number of stored entries is bounded; the least recently used entry
//!   is evicted to make room
//! - Entries of one model form a namespace that can be cleared on its own
//! - Hit/miss counters feed benchmarking and reporting layers
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`CacheManager`] | Façade enforcing TTL, eviction and statistics |
//! | [`CacheConfig`] | Validated configuration (YAML/JSON/env/builder) |
//! | [`CacheBackend`] | Storage contract implemented by every backend |
//! | [`MemoryCache`] | Volatile in-process backend |
//! | [`DiskCache`] | One file per entry, durable across restarts |
//! | [`SqliteCache`] | Rows in a local SQLite database, durable |
//! | [`NullCache`] | No-op backend used when caching is disabled |
//! | [`CacheKey`] | Collision-resistant key derived from the request triple |
//!
//! ## Example
//!
//! ```rust
//! use ai_lib_cache::cache::{CacheConfig, CacheManager};
//! use std::time::Duration;
//!
//! let cache = CacheManager::new(CacheConfig::memory(1000)).unwrap();
//! cache
//!     .set("openai/gpt-4o", "chat", "What is Rust?", "A systems language.", None)
//!     .unwrap();
//!
//! let hit: Option<String> = cache.get("openai/gpt-4o", "chat", "What is Rust?");
//! assert_eq!(hit.as_deref(), Some("A systems language."));
//!
//! // Per-entry TTL override
//! cache
//!     .set("openai/gpt-4o", "embed", "hello", &vec![0.1_f32, 0.2], Some(Duration::from_secs(60)))
//!     .unwrap();
//! assert_eq!(cache.get_stats().hits, 1);
//! ```
//!
//! ## Failure Semantics
//!
//! Reads fail open: a backend or decoding failure during `get` is logged and
//! reported as a miss. Writes fail closed: `set` returns the error.

mod backend;
mod config;
mod entry;
mod key;
mod manager;
mod recency;
mod serialization;
mod stats;

pub use backend::{
    open as open_backend, CacheBackend, DiskCache, MemoryCache, NullCache, SqliteCache,
};
pub use config::{
    BackendConfig, BackendKind, CacheConfig, DiskConfig, EvictionPolicy, SqliteConfig,
    DEFAULT_MAX_SIZE, DEFAULT_TTL_SECS,
};
pub use entry::{CacheEntry, MAX_TTL};
pub use key::{namespace_of, CacheKey, NAMESPACE_WIDTH};
pub use manager::CacheManager;
pub use serialization::SerializationFormat;
pub use stats::CacheStats;
