use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::LookupMode;
use crate::record::Record;

const PREFIX: &str = "geolabel:";

/// Inputs of a cache key that come from configuration.
#[derive(Debug, Clone)]
pub struct KeySpec {
    pub api: String,
    pub format: String,
    pub mode: LookupMode,
    pub fields: Regex,
}

/// Deterministic cache key for one record under one configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Hash of the request template, label format, mode and the record fields
    /// selected by `spec.fields`. Other record fields do not contribute, so
    /// records sharing an address share a slot.
    pub fn compute(record: &Record, spec: &KeySpec) -> Self {
        let selected: BTreeMap<&str, Value> = record
            .iter()
            .filter(|(name, _)| spec.fields.is_match(name))
            .map(|(name, value)| (name.as_str(), canonical(value)))
            .collect();
        let selected = serde_json::to_string(&selected).unwrap_or_default();

        let mut h = Sha256::new();
        h.update(spec.api.as_bytes());
        h.update(b"\n");
        h.update(spec.format.as_bytes());
        h.update(b"\n");
        h.update(spec.mode.as_str().as_bytes());
        h.update(b"\n");
        h.update(selected.as_bytes());
        Self(format!("{PREFIX}{}", hex::encode(h.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Copy of `value` with object keys sorted at every depth, so that equal
/// values serialize identically whatever their insertion order.
fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonical(v))).collect();
            Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}
