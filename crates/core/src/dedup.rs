//! Deduplication keys.
//!
//! A job's logical identity is `(owner_ref, job_type, locale, payload)`. The
//! payload is normalised before hashing: mapping keys are sorted recursively,
//! array order is kept. Two payloads that differ only in key order therefore
//! produce the same key.

use core::fmt::Write as _;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

/// Deterministic key identifying a job's logical content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupKey(String);

impl DedupKey {
    /// Derive the key for a job.
    ///
    /// Format: `<job_type>:<sha256 hex>`, so keys stay bounded in length and
    /// remain greppable by type. Each hashed field is length-prefixed, so no
    /// field content can shift the boundary between two others.
    pub fn derive(owner_ref: &str, job_type: &str, locale: &str, payload: &JsonValue) -> Self {
        let payload_hash = payload_hash(payload);

        let mut hasher = Sha256::new();
        for field in [owner_ref, job_type, locale, payload_hash.as_str()] {
            hasher.update((field.len() as u64).to_be_bytes());
            hasher.update(field.as_bytes());
        }

        Self(format!("{job_type}:{}", hex::encode(hasher.finalize())))
    }

    /// Wrap a key read back from storage.
    pub fn from_stored(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl core::fmt::Display for DedupKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hex SHA-256 of the normalised payload.
pub fn payload_hash(payload: &JsonValue) -> String {
    hex::encode(Sha256::digest(canonical_json(payload).as_bytes()))
}

/// Serialise `value` with every object's keys sorted, at every depth.
pub fn canonical_json(value: &JsonValue) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));

            out.push('{');
            for (idx, (key, child)) in entries.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_canonical(child, out);
            }
            out.push('}');
        }
        JsonValue::Array(items) => {
            out.push('[');
            for (idx, child) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(child, out);
            }
            out.push(']');
        }
        JsonValue::String(s) => write_string(s, out),
        // null / bool / number have a single textual form
        scalar => {
            let _ = write!(out, "{scalar}");
        }
    }
}

fn write_string(s: &str, out: &mut String) {
    let _ = write!(out, "{}", JsonValue::String(s.to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::{Map, json};

    #[test]
    fn nested_key_order_does_not_matter() {
        let a = json!({"topic": "rust", "meta": {"b": 1, "a": [3, 1, 2]}});
        let b = json!({"meta": {"a": [3, 1, 2], "b": 1}, "topic": "rust"});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(
            DedupKey::derive("run-7", "generate", "en", &a),
            DedupKey::derive("run-7", "generate", "en", &b)
        );
    }

    #[test]
    fn array_order_matters() {
        let a = json!({"tags": ["a", "b"]});
        let b = json!({"tags": ["b", "a"]});
        assert_ne!(payload_hash(&a), payload_hash(&b));
    }

    #[test]
    fn every_identity_component_participates() {
        let payload = json!({"topic": "rust"});
        let base = DedupKey::derive("run-7", "generate", "en", &payload);
        assert_ne!(base, DedupKey::derive("run-8", "generate", "en", &payload));
        assert_ne!(base, DedupKey::derive("run-7", "distribute", "en", &payload));
        assert_ne!(base, DedupKey::derive("run-7", "generate", "de", &payload));
        assert_ne!(
            base,
            DedupKey::derive("run-7", "generate", "en", &json!({"topic": "go"}))
        );
        assert!(base.as_str().starts_with("generate:"));
    }

    #[test]
    fn field_boundaries_cannot_be_shifted() {
        let payload = json!({"topic": "rust"});
        assert_ne!(
            DedupKey::derive("x\u{1f}generate\u{1f}en", "generate", "en", &payload),
            DedupKey::derive("x", "generate", "en\u{1f}generate\u{1f}en", &payload)
        );
        assert_ne!(
            DedupKey::derive("ab", "generate", "c", &payload),
            DedupKey::derive("a", "generate", "bc", &payload)
        );
    }

    #[test]
    fn canonical_form_is_valid_json() {
        let value = json!({"z": null, "a": {"q": "line\n\"quoted\"", "n": 1.5}, "t": true});
        let reparsed: JsonValue = serde_json::from_str(&canonical_json(&value)).unwrap();
        assert_eq!(reparsed, value);
    }

    proptest! {
        #[test]
        fn insertion_order_never_changes_the_key(
            entries in proptest::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..12),
        ) {
            let mut forward = Map::new();
            for (k, v) in entries.iter() {
                forward.insert(k.clone(), json!(v));
            }
            let mut backward = Map::new();
            for (k, v) in entries.iter().rev() {
                backward.insert(k.clone(), json!(v));
            }

            let forward = JsonValue::Object(forward);
            let backward = JsonValue::Object(backward);
            prop_assert_eq!(
                DedupKey::derive("", "generate", "", &forward),
                DedupKey::derive("", "generate", "", &backward)
            );
        }
    }
}
