//! Cache key generation.

use super::serialization::to_json_value;
use crate::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Width (in hex characters) of the namespace segment at the front of every key.
pub const NAMESPACE_WIDTH: usize = 16;

/// Deterministic identifier for a `(model_id, operation, input)` triple.
///
/// The string form is `<namespace>-<digest>`: `namespace` is a fixed-width
/// fingerprint of the model id, so every key of one model shares the same
/// prefix and no two models' prefixes overlap; `digest` is the SHA-256 of the
/// length-prefixed triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub hash: String,
    pub model_id: String,
    pub operation: String,
}

impl CacheKey {
    /// Build a key from an already canonical input string.
    pub fn new(model_id: &str, operation: &str, input: &str) -> Self {
        let mut hasher = Sha256::new();
        for field in [model_id, operation, input] {
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
        let digest = to_hex(&hasher.finalize());
        Self {
            hash: format!("{}-{}", namespace_of(model_id), digest),
            model_id: model_id.to_string(),
            operation: operation.to_string(),
        }
    }

    /// Build a key from any serializable input payload.
    ///
    /// The payload goes through `serde_json::Value` first, which orders object
    /// keys, so structurally equal inputs produce the same key. Inputs holding
    /// NaN or infinite floats are rejected rather than aliased to `null`.
    pub fn for_input<I: Serialize + ?Sized>(
        model_id: &str,
        operation: &str,
        input: &I,
    ) -> Result<Self> {
        let canonical = serde_json::to_string(&to_json_value(input)?)?;
        Ok(Self::new(model_id, operation, &canonical))
    }

    pub fn as_str(&self) -> &str {
        &self.hash
    }

    /// Namespace prefix shared by every key of this key's model.
    pub fn namespace(&self) -> &str {
        &self.hash[..NAMESPACE_WIDTH]
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.hash)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.hash
    }
}

/// Key prefix for every entry stored under `model_id`.
pub fn namespace_of(model_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"ns:");
    hasher.update(model_id.as_bytes());
    let mut ns = to_hex(&hasher.finalize());
    ns.truncate(NAMESPACE_WIDTH);
    ns
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
