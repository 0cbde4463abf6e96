//! Attribute hashing for change detection.
//!
//! Hashes are computed over canonical JSON (object keys sorted, no
//! whitespace), so two attribute maps hash equal exactly when they are
//! equal as JSON values. Trigger instances and state fingerprints both
//! rely on this.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Hasher for attribute maps and other JSON documents.
#[derive(Debug, Default)]
pub struct AttributeHasher;

impl AttributeHasher {
    /// Creates a new attribute hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the hash of an attribute map.
    #[must_use]
    pub fn hash_attributes(&self, attributes: &BTreeMap<String, Value>) -> String {
        let mut hasher = Sha256::new();
        for (name, value) in attributes {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            write_canonical(&mut hasher, value);
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }

    /// Computes the hash of an arbitrary JSON value.
    #[must_use]
    pub fn hash_value(&self, value: &Value) -> String {
        let mut hasher = Sha256::new();
        write_canonical(&mut hasher, value);
        hex::encode(hasher.finalize())
    }

    /// Computes the hash of raw bytes.
    #[must_use]
    pub fn hash_bytes(&self, bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes to determine if they are equal.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        // Constant-time comparison
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

/// Feeds the canonical JSON encoding of `value` into the hasher.
fn write_canonical(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            hasher.update(b"{");
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    hasher.update(b",");
                }
                hasher.update(Value::String(key.clone()).to_string().as_bytes());
                hasher.update(b":");
                if let Some(child) = map.get(key) {
                    write_canonical(hasher, child);
                }
            }
            hasher.update(b"}");
        }
        Value::Array(items) => {
            hasher.update(b"[");
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    hasher.update(b",");
                }
                write_canonical(hasher, item);
            }
            hasher.update(b"]");
        }
        scalar => hasher.update(scalar.to_string().as_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_hash_deterministic() {
        let hasher = AttributeHasher::new();
        let a = attrs(&[("image", json!("nginx:1.25")), ("replicas", json!(3))]);
        assert_eq!(hasher.hash_attributes(&a), hasher.hash_attributes(&a.clone()));
    }

    #[test]
    fn test_nested_key_order_does_not_matter() {
        let hasher = AttributeHasher::new();
        let one: Value = serde_json::from_str(r#"{"b": 1, "a": {"y": 2, "x": 1}}"#).expect("json");
        let two: Value = serde_json::from_str(r#"{"a": {"x": 1, "y": 2}, "b": 1}"#).expect("json");
        assert_eq!(hasher.hash_value(&one), hasher.hash_value(&two));
    }

    #[test]
    fn test_different_values_different_hash() {
        let hasher = AttributeHasher::new();
        let a = attrs(&[("version", json!("1"))]);
        let b = attrs(&[("version", json!(1))]);
        assert_ne!(hasher.hash_attributes(&a), hasher.hash_attributes(&b));
    }

    #[test]
    fn test_short_hash() {
        let hasher = AttributeHasher::new();
        let short = hasher.short_hash("abcdef1234567890abcdef1234567890");
        assert_eq!(short, "abcdef12");
    }

    #[test]
    fn test_hashes_match() {
        assert!(AttributeHasher::hashes_match("abc123", "abc123"));
        assert!(!AttributeHasher::hashes_match("abc123", "abc124"));
        assert!(!AttributeHasher::hashes_match("abc123", "abc12"));
    }
}
