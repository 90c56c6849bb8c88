//! On-disk encodings for durable backends.

use crate::{Error, ErrorContext, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Format used by the disk and SQLite backends to persist entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializationFormat {
    /// Human-readable JSON
    #[default]
    Json,
    /// Compact binary MessagePack
    #[serde(alias = "messagepack")]
    Msgpack,
}

impl SerializationFormat {
    /// File extension used by the disk backend.
    pub fn extension(&self) -> &'static str {
        match self {
            SerializationFormat::Json => "json",
            SerializationFormat::Msgpack => "msgpack",
        }
    }

    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            SerializationFormat::Json => Ok(serde_json::to_vec(value)?),
            SerializationFormat::Msgpack => rmp_serde::to_vec_named(value).map_err(|e| {
                Error::serialization_with_context(
                    e.to_string(),
                    ErrorContext::new().with_source("msgpack_encode"),
                )
            }),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            SerializationFormat::Json => Ok(serde_json::from_slice(bytes)?),
            SerializationFormat::Msgpack => rmp_serde::from_slice(bytes).map_err(|e| {
                Error::serialization_with_context(
                    e.to_string(),
                    ErrorContext::new().with_source("msgpack_decode"),
                )
            }),
        }
    }
}

/// Convert `value` into the JSON tree held by cache entries.
///
/// `serde_json` maps NaN and infinities to `null`, which would not read back
/// as the value written; such values are rejected instead.
pub(crate) fn to_json_value<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
    let json = serde_json::to_value(value)?;
    if contains_null(&json) && has_non_finite_float(value) {
        return Err(Error::serialization_with_context(
            "non-finite float cannot be cached",
            ErrorContext::new()
                .with_details("NaN and infinite values have no JSON representation")
                .with_source("cache_value"),
        ));
    }
    Ok(json)
}

fn contains_null(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.iter().any(contains_null),
        Value::Object(map) => map.values().any(contains_null),
        _ => false,
    }
}

// serde_yaml keeps NaN and infinities as numbers.
fn has_non_finite_float<T: Serialize + ?Sized>(value: &T) -> bool {
    serde_yaml::to_value(value).map_or(false, |v| yaml_non_finite(&v))
}

fn yaml_non_finite(value: &serde_yaml::Value) -> bool {
    use serde_yaml::Value as Yaml;
    match value {
        Yaml::Number(n) => n.is_nan() || n.is_infinite(),
        Yaml::Sequence(items) => items.iter().any(yaml_non_finite),
        Yaml::Mapping(map) => map.iter().any(|(k, v)| yaml_non_finite(k) || yaml_non_finite(v)),
        Yaml::Tagged(tagged) => yaml_non_finite(&tagged.value),
        _ => false,
    }
}

impl fmt::Display for SerializationFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for SerializationFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(SerializationFormat::Json),
            "msgpack" | "messagepack" => Ok(SerializationFormat::Msgpack),
            other => Err(Error::configuration_with_context(
                format!("unsupported serialization format '{}'", other),
                ErrorContext::new()
                    .with_field_path("serialization")
                    .with_details("expected one of: json, msgpack"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_round_trip_both_formats() {
        let value = json!({
            "text": "bonjour ✓",
            "tokens": [1, 2, 3],
            "score": 0.1 + 0.2,
            "big": u64::MAX,
            "neg": -42,
            "nested": {"ok": true, "none": null}
        });
        for format in [SerializationFormat::Json, SerializationFormat::Msgpack] {
            let bytes = format.encode(&value).unwrap();
            let back: serde_json::Value = format.decode(&bytes).unwrap();
            assert_eq!(back, value, "format {}", format);
        }
    }

    #[test]
    fn test_corrupt_bytes_are_serialization_errors() {
        for format in [SerializationFormat::Json, SerializationFormat::Msgpack] {
            let err = format.decode::<serde_json::Value>(&[0xc1, 0xff, 0x00]).unwrap_err();
            assert_eq!(err.kind(), crate::ErrorKind::Serialization);
        }
    }

    #[test]
    fn test_non_finite_floats_are_rejected() {
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let err = to_json_value(&bad).unwrap_err();
            assert_eq!(err.kind(), crate::ErrorKind::Serialization);
            let err = to_json_value(&json_like(bad)).unwrap_err();
            assert_eq!(err.kind(), crate::ErrorKind::Serialization);
        }
        // Real nulls and finite floats are fine.
        let ok = to_json_value(&(None::<f64>, vec![Some(1.5), None], f64::MAX)).unwrap();
        assert_eq!(ok, json!([null, [1.5, null], f64::MAX]));
    }

    fn json_like(score: f64) -> std::collections::BTreeMap<&'static str, Vec<f64>> {
        std::collections::BTreeMap::from([("scores", vec![0.5, score])])
    }

    #[test]
    fn test_parse() {
        assert_eq!("JSON".parse::<SerializationFormat>().unwrap(), SerializationFormat::Json);
        assert_eq!(
            "messagepack".parse::<SerializationFormat>().unwrap(),
            SerializationFormat::Msgpack
        );
        assert!("pickle".parse::<SerializationFormat>().unwrap_err().is_configuration());
    }
}
