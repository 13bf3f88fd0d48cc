//! Cache key derivation.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Deterministic key over a tool name and its arguments.
///
/// Arguments are normalized before hashing: object keys are sorted
/// recursively, so `{"a":1,"b":2}` and `{"b":2,"a":1}` produce the same key.
/// Array order is preserved since it is usually meaningful.
///
/// SHA-256 keeps keys stable across processes and restarts, which a shared
/// backend requires.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(tool: &str, args: &Value) -> Self {
        let canonical = canonicalize(args);
        let mut hasher = Sha256::new();
        hasher.update(tool.as_bytes());
        hasher.update([0u8]);
        // Serializing a Value built from BTreeMaps cannot fail.
        hasher.update(canonical.to_string().as_bytes());
        let digest = hex::encode(hasher.finalize());
        Self(format!("{tool}:{digest}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The tool segment of the key.
    pub fn tool(&self) -> &str {
        self.0.split_once(':').map_or(&self.0, |(tool, _)| tool)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k.clone(), v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
