//! # ai-lib-cache
//!
//! AI-Protocol 运行时的推理结果缓存：在昂贵的模型调用前提供可插拔的缓存层。
//!
//! Pluggable inference-result cache for AI-Protocol runtimes.
//!
//! ## Overview
//!
//! Model invocations are slow and billed per call. This crate sits in front of
//! them and remembers results keyed by `(model_id, operation, input)`, with
//! the storage tier selected by configuration rather than at call sites.
//!
//! ## Key Features
//!
//! - **Pluggable backends**: in-memory, one-file-per-entry on disk, or SQLite
//! - **TTL**: per-cache default with per-entry overrides
//! - **Bounded size**: LRU eviction with O(1) recency updates
//! - **Namespaces**: clear one model's entries without touching others
//! - **Telemetry**: hit/miss counters and hit ratio via [`cache::CacheStats`]
//! - **Thread-safe**: share one [`cache::CacheManager`] across threads
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ai_lib_cache::cache::{CacheConfig, CacheManager};
//!
//! fn main() -> ai_lib_cache::Result<()> {
//!     let config = CacheConfig::from_file("cache.yaml")?.with_env_overrides()?;
//!     let cache = CacheManager::new(config)?;
//!
//!     let answer: String =
//!         cache.get_or_compute("deepseek/deepseek-chat", "chat", "2+2?", None, || {
//!             // call the model here
//!             Ok("4".to_string())
//!         })?;
//!     println!("{answer} ({:.0}% hit ratio)", cache.get_stats().hit_ratio * 100.0);
//!     Ok(())
//! }
//! ```

pub mod cache;

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext, ErrorKind};

pub use cache::{CacheConfig, CacheManager, CacheStats};
