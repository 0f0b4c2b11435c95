use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::ValueRef;

/// Reserved field name carrying an item's dedup key in the JSON view
/// rendered for executors.
pub const UNIQUE_KEY_FIELD: &str = "@uniqueKey";

/// Reserved field name carrying the index of the source that produced an
/// item in the JSON view rendered for executors.
pub const SOURCE_INDEX_FIELD: &str = "@sourceIndex";

/// One unit of data produced by a source, carried through filter, steps,
/// and post.
///
/// The engine keeps its bookkeeping (originating source, dedup key) in the
/// envelope rather than inside the payload's own key space. The reserved
/// names only appear in [`Item::to_value`], the snapshot executors see.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub payload: ValueRef,
    /// Index of the source that produced this item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_index: Option<usize>,
    /// Deterministic dedup key for this item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_key: Option<String>,
}

impl Item {
    pub fn new(payload: ValueRef) -> Self {
        Self {
            payload,
            source_index: None,
            unique_key: None,
        }
    }

    /// Tag the item with its originating source and dedup key.
    ///
    /// The key is the value of `key_field` inside the payload when present
    /// (stringified), otherwise the sha256 hex of the serialized payload.
    pub fn tagged(payload: ValueRef, source_index: usize, key_field: Option<&str>) -> Self {
        let unique_key = derive_key(&payload, key_field);
        Self {
            payload,
            source_index: Some(source_index),
            unique_key: Some(unique_key),
        }
    }

    /// Render the executor-visible JSON view, injecting the reserved
    /// `@uniqueKey` / `@sourceIndex` fields for object payloads.
    pub fn to_value(&self) -> serde_json::Value {
        let mut value = self.payload.as_ref().clone();
        if let serde_json::Value::Object(map) = &mut value {
            if let Some(key) = &self.unique_key {
                map.insert(UNIQUE_KEY_FIELD.to_string(), serde_json::json!(key));
            }
            if let Some(index) = self.source_index {
                map.insert(SOURCE_INDEX_FIELD.to_string(), serde_json::json!(index));
            }
        }
        value
    }

    /// Rebuild an envelope from an executor-visible JSON view, pulling the
    /// reserved fields back out of the payload. Values that never carried
    /// tags produce an untagged item.
    pub fn from_value(value: serde_json::Value) -> Self {
        let mut value = value;
        let (unique_key, source_index) = match &mut value {
            serde_json::Value::Object(map) => {
                let key = map
                    .remove(UNIQUE_KEY_FIELD)
                    .and_then(|v| v.as_str().map(str::to_string));
                let index = map
                    .remove(SOURCE_INDEX_FIELD)
                    .and_then(|v| v.as_u64().map(|n| n as usize));
                (key, index)
            }
            _ => (None, None),
        };
        Self {
            payload: ValueRef::new(value),
            source_index,
            unique_key,
        }
    }
}

fn derive_key(payload: &ValueRef, key_field: Option<&str>) -> String {
    if let Some(field) = key_field {
        if let Some(value) = payload.path(field) {
            return match value.as_ref() {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
        }
    }
    content_hash(payload)
}

/// Content hash over the canonical JSON serialization of the payload.
fn content_hash(payload: &ValueRef) -> String {
    let mut hasher = Sha256::new();
    // serde_json object serialization is order-preserving, which is stable
    // for payloads parsed from the same upstream document.
    let _ = serde_json::to_writer(&mut hasher, payload.as_ref());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_field_wins_over_content_hash() {
        let item = Item::tagged(ValueRef::new(json!({"id": "abc", "v": 1})), 0, Some("id"));
        assert_eq!(item.unique_key.as_deref(), Some("abc"));
        assert_eq!(item.source_index, Some(0));
    }

    #[test]
    fn missing_key_field_falls_back_to_hash() {
        let payload = ValueRef::new(json!({"v": 1}));
        let item = Item::tagged(payload.clone(), 2, Some("id"));
        let hashed = Item::tagged(payload, 2, None);
        assert_eq!(item.unique_key, hashed.unique_key);
        let key = item.unique_key.unwrap();
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn content_hash_is_deterministic_and_content_sensitive() {
        let a = Item::tagged(ValueRef::new(json!({"a": 1})), 0, None);
        let b = Item::tagged(ValueRef::new(json!({"a": 1})), 1, None);
        let c = Item::tagged(ValueRef::new(json!({"a": 2})), 0, None);
        assert_eq!(a.unique_key, b.unique_key);
        assert_ne!(a.unique_key, c.unique_key);
    }

    #[test]
    fn value_round_trip_preserves_tags() {
        let item = Item::tagged(ValueRef::new(json!({"id": "x"})), 3, Some("id"));
        let view = item.to_value();
        assert_eq!(view[UNIQUE_KEY_FIELD], json!("x"));
        assert_eq!(view[SOURCE_INDEX_FIELD], json!(3));

        let back = Item::from_value(view);
        assert_eq!(back.unique_key.as_deref(), Some("x"));
        assert_eq!(back.source_index, Some(3));
        assert_eq!(back.payload.as_ref(), &json!({"id": "x"}));
    }

    #[test]
    fn scalar_payloads_carry_no_reserved_fields() {
        let item = Item::tagged(ValueRef::new(json!("plain")), 0, None);
        assert_eq!(item.to_value(), json!("plain"));
        let back = Item::from_value(json!("plain"));
        assert!(back.unique_key.is_none());
        assert!(back.source_index.is_none());
    }
}
