use serde_json::Value as JsonValue;

/// BLAKE3 of raw bytes, hex encoded. The dedup key for snapshots, binary
/// chunks, and blobs.
pub fn content_hash_hex(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Canonical JSON text: object keys sorted recursively, no whitespace.
/// Snapshot identity hashes over this form so key order never splits
/// identical payloads.
pub fn canonical_json(value: &JsonValue) -> String {
    canonicalize(value).to_string()
}

pub fn snapshot_content_hash(value: &JsonValue) -> String {
    content_hash_hex(canonical_json(value).as_bytes())
}

fn canonicalize(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => {
            let mut sorted: Vec<(&String, &JsonValue)> = map.iter().collect();
            sorted.sort_by(|(a, _), (b, _)| a.cmp(b));
            JsonValue::Object(
                sorted
                    .into_iter()
                    .map(|(key, value)| (key.clone(), canonicalize(value)))
                    .collect(),
            )
        }
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::{canonical_json, snapshot_content_hash};
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let value = json!({"b": 1, "a": {"d": 2, "c": 3}});
        assert_eq!(canonical_json(&value), r#"{"a":{"c":3,"d":2},"b":1}"#);
    }

    #[test]
    fn key_order_does_not_change_the_snapshot_hash() {
        let first = json!({"theme": "dark", "lang": "en"});
        let second = json!({"lang": "en", "theme": "dark"});
        assert_eq!(snapshot_content_hash(&first), snapshot_content_hash(&second));
    }

    #[test]
    fn different_content_produces_different_hashes() {
        let first = json!({"theme": "dark"});
        let second = json!({"theme": "light"});
        assert_ne!(snapshot_content_hash(&first), snapshot_content_hash(&second));
    }
}
