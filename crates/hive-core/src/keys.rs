//! Content addressing: canonical JSON and BLAKE3 digests.

use serde_json::{Map, Value};

/// Recursively sort object keys so logically equal values serialize
/// identically, whatever order their keys were inserted in.
pub fn normalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for k in keys {
                sorted.insert(k.clone(), normalize(&map[k]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        other => other.clone(),
    }
}

/// Canonical string form of a JSON value.
pub fn canonical_json(value: &Value) -> String {
    // Serializing a Value cannot fail: keys are always strings.
    serde_json::to_string(&normalize(value)).unwrap_or_default()
}

/// Hex digest over length-prefixed parts, so `("ab", "c")` and `("a", "bc")`
/// never collide.
pub fn digest_parts(parts: &[&[u8]]) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    hex::encode(hasher.finalize().as_bytes())
}
