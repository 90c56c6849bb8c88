//! Stored cache entry.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A cached value together with its expiry and access metadata.
///
/// Timestamps are wall-clock UTC so durable backends can be reopened by
/// another process and still agree on expiry and recency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, value: serde_json::Value, ttl: Duration) -> Self {
        Self::created_at(key, value, ttl, Utc::now())
    }

    pub fn created_at(
        key: impl Into<String>,
        value: serde_json::Value,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            key: key.into(),
            value,
            created_at: now,
            expires_at: expiry_from(now, ttl),
            last_accessed_at: now,
        }
    }

    /// Expired strictly after `expires_at`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Remaining lifetime, or `None` once expired.
    pub fn time_to_live(&self) -> Option<Duration> {
        (self.expires_at - Utc::now()).to_std().ok()
    }
}

/// Longest lifetime an entry can have; larger TTLs are clamped.
pub const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn expiry_from(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    ChronoDuration::from_std(ttl.min(MAX_TTL))
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(now)
}
