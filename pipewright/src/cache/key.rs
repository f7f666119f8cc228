//! Cache key derivation.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Prefix for keys derived from structured values.
pub const STRUCTURED_PREFIX: &str = "obj:";

/// Hex characters kept from the SHA-256 of a structured key.
const HASH_LEN: usize = 32;

/// Serializes `value` as JSON with object keys sorted at every level.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Derives a stable key from a structured value.
#[must_use]
pub fn hash_value(value: &Value) -> String {
    let digest = hex::encode(Sha256::digest(canonical_json(value).as_bytes()));
    format!("{STRUCTURED_PREFIX}{}", &digest[..HASH_LEN])
}

/// Types usable as cache keys.
///
/// Strings are used verbatim; anything else is canonicalised and hashed.
pub trait ToCacheKey {
    /// The key string, before namespacing.
    fn to_cache_key(&self) -> String;
}

impl ToCacheKey for str {
    fn to_cache_key(&self) -> String {
        self.to_string()
    }
}

impl ToCacheKey for String {
    fn to_cache_key(&self) -> String {
        self.clone()
    }
}

impl ToCacheKey for Value {
    fn to_cache_key(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            other => hash_value(other),
        }
    }
}

/// Wraps any serializable value so it can be used as a key.
#[derive(Debug, Clone)]
pub struct Structured<T>(pub T);

impl<T: Serialize> ToCacheKey for Structured<T> {
    fn to_cache_key(&self) -> String {
        // Values that cannot be represented as JSON collapse to the null key.
        serde_json::to_value(&self.0)
            .unwrap_or(Value::Null)
            .to_cache_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let a = json!({"b": 1, "a": {"z": [1, {"y": 2, "x": 1}], "c": null}});
        assert_eq!(
            canonical_json(&a),
            r#"{"a":{"c":null,"z":[1,{"x":1,"y":2}]},"b":1}"#
        );
    }

    #[test]
    fn test_structured_keys_are_stable_and_prefixed() {
        let k1 = json!({"stage": "write", "config": {"words": 10, "model": "m"}}).to_cache_key();
        let k2 = json!({"config": {"model": "m", "words": 10}, "stage": "write"}).to_cache_key();
        assert_eq!(k1, k2);
        assert!(k1.starts_with(STRUCTURED_PREFIX));
        assert_eq!(k1.len(), STRUCTURED_PREFIX.len() + HASH_LEN);

        let k3 = json!({"stage": "write", "config": {"words": 11, "model": "m"}}).to_cache_key();
        assert_ne!(k1, k3);
    }

    #[test]
    fn test_strings_are_verbatim() {
        assert_eq!("plain".to_cache_key(), "plain");
        assert_eq!(json!("plain").to_cache_key(), "plain");
        assert_eq!(Structured(("a", 1)).to_cache_key(), json!(["a", 1]).to_cache_key());
    }
}
