//! Content-based hashing for scenario configurations.
//!
//! Configs are canonicalized before hashing so that formatting differences
//! never change the cache key:
//! - object keys are emitted in sorted order
//! - integral floats collapse to integers (`1.0` and `1` hash the same)
//! - RFC 3339 timestamps are rewritten in UTC; timestamps without an offset
//!   are read as UTC
//!
//! Everything else (including non-timestamp strings) is hashed verbatim.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::{CoreError, CoreResult};

const HASH_HEX_LEN: usize = 64;

/// Largest magnitude at which every integer is exactly representable in f64.
const MAX_EXACT_F64_INT: f64 = 9_007_199_254_740_992.0;

/// SHA-256 digest of a canonical config, as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConfigHash(String);

impl ConfigHash {
    pub fn parse(s: &str) -> CoreResult<Self> {
        let well_formed = s.len() == HASH_HEX_LEN
            && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if !well_formed {
            return Err(CoreError::InvalidHash(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for ConfigHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ConfigHash {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ConfigHash> for String {
    fn from(hash: ConfigHash) -> Self {
        hash.0
    }
}

/// Rewrite `value` into its canonical form.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = Map::new();
            for (key, v) in entries {
                out.insert(key.clone(), canonicalize(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::Number(n) => canonical_number(n),
        Value::String(s) => canonical_string(s),
        Value::Null | Value::Bool(_) => value.clone(),
    }
}

fn canonical_number(n: &Number) -> Value {
    if n.is_f64()
        && let Some(f) = n.as_f64()
        && f.fract() == 0.0
        && f.abs() < MAX_EXACT_F64_INT
    {
        return Value::from(f as i64);
    }
    Value::Number(n.clone())
}

fn canonical_string(s: &str) -> Value {
    let trimmed = s.trim();
    if looks_like_timestamp(trimmed) {
        if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
            return Value::String(format_utc(ts.with_timezone(&Utc)));
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f") {
            return Value::String(format_utc(naive.and_utc()));
        }
    }
    Value::String(s.to_string())
}

fn looks_like_timestamp(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() >= 19
        && b[4] == b'-'
        && b[7] == b'-'
        && matches!(b[10], b'T' | b't')
        && b[13] == b':'
}

fn format_utc(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Compact JSON text of the canonical form.
pub fn canonical_json(value: &Value) -> String {
    serde_json::to_string(&canonicalize(value)).unwrap_or_default()
}

pub fn config_hash(value: &Value) -> ConfigHash {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(value).as_bytes());
    ConfigHash(format!("{:x}", hasher.finalize()))
}

/// Hash any serializable config.
pub fn hash_serializable<T: Serialize>(config: &T) -> CoreResult<ConfigHash> {
    let value = serde_json::to_value(config)?;
    Ok(config_hash(&value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hash_stability() {
        let config = json!({"entity": "x", "start": "2024-01-01", "end": "2024-01-02"});
        let hash1 = config_hash(&config);
        let hash2 = config_hash(&config);
        assert_eq!(hash1, hash2);
        assert_eq!(hash1.as_str().len(), 64);
    }

    #[test]
    fn key_order_and_whitespace_do_not_matter() {
        let a: Value =
            serde_json::from_str(r#"{"entity":"x","window":{"from":1,"to":2}}"#).unwrap();
        let b: Value = serde_json::from_str(
            r#"{
                "window": { "to": 2, "from": 1 },
                "entity": "x"
            }"#,
        )
        .unwrap();
        assert_eq!(config_hash(&a), config_hash(&b));
    }

    #[test]
    fn equivalent_timestamps_hash_identically() {
        let utc = json!({"start": "2024-01-01T00:00:00Z"});
        let offset = json!({"start": "2024-01-01T01:00:00+01:00"});
        let fractional = json!({"start": "2024-01-01T00:00:00.000Z"});
        let naive = json!({"start": "2024-01-01T00:00:00"});
        let h = config_hash(&utc);
        assert_eq!(h, config_hash(&offset));
        assert_eq!(h, config_hash(&fractional));
        assert_eq!(h, config_hash(&naive));
    }

    #[test]
    fn integral_floats_collapse() {
        assert_eq!(
            config_hash(&json!({"resolution": 60})),
            config_hash(&json!({"resolution": 60.0}))
        );
        assert_ne!(
            config_hash(&json!({"resolution": 60})),
            config_hash(&json!({"resolution": 60.5}))
        );
    }

    #[test]
    fn hash_differs_for_different_inputs() {
        let a = json!({"entity": "x", "start": "2024-01-01"});
        let b = json!({"entity": "y", "start": "2024-01-01"});
        let c = json!({"entity": "x", "start": "2024-01-02"});
        assert_ne!(config_hash(&a), config_hash(&b));
        assert_ne!(config_hash(&a), config_hash(&c));
    }

    #[test]
    fn plain_strings_are_not_trimmed() {
        assert_ne!(
            config_hash(&json!({"name": "site"})),
            config_hash(&json!({"name": " site"}))
        );
    }

    #[test]
    fn parse_rejects_malformed_hashes() {
        let good = config_hash(&json!({}));
        assert_eq!(ConfigHash::parse(good.as_str()).unwrap(), good);
        assert!(ConfigHash::parse("abc").is_err());
        assert!(ConfigHash::parse(&"G".repeat(64)).is_err());
    }

    #[test]
    fn serializable_matches_value_hash() {
        #[derive(Serialize)]
        struct Cfg {
            entity: &'static str,
            hours: u32,
        }
        let typed = hash_serializable(&Cfg {
            entity: "x",
            hours: 24,
        })
        .unwrap();
        assert_eq!(typed, config_hash(&json!({"hours": 24, "entity": "x"})));
    }
}
