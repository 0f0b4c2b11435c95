use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A shared, immutable JSON value.
///
/// Stage results and item payloads are passed around frequently; wrapping
/// them in an `Arc` keeps clones cheap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ValueRef(Arc<serde_json::Value>);

impl ValueRef {
    pub fn new(value: serde_json::Value) -> Self {
        Self(Arc::new(value))
    }

    pub fn null() -> Self {
        Self::new(serde_json::Value::Null)
    }

    /// Look up a dotted path (`a.b.0.c`) inside the value.
    ///
    /// Path segments that parse as integers index into arrays; everything
    /// else is an object key. Returns `None` as soon as a segment is
    /// missing.
    pub fn path(&self, path: &str) -> Option<ValueRef> {
        let mut current = self.as_ref();
        for segment in path.split('.') {
            current = match current {
                serde_json::Value::Object(map) => map.get(segment)?,
                serde_json::Value::Array(items) => {
                    let index: usize = segment.parse().ok()?;
                    items.get(index)?
                }
                _ => return None,
            };
        }
        Some(ValueRef::new(current.clone()))
    }

    /// JSON truthiness: null, `false`, `0`, and `""` are falsy; arrays and
    /// objects are truthy regardless of contents.
    pub fn is_truthy(&self) -> bool {
        is_truthy(self.as_ref())
    }
}

impl AsRef<serde_json::Value> for ValueRef {
    fn as_ref(&self) -> &serde_json::Value {
        &self.0
    }
}

impl<T: Into<serde_json::Value>> From<T> for ValueRef {
    fn from(value: T) -> Self {
        Self::new(value.into())
    }
}

impl Default for ValueRef {
    fn default() -> Self {
        Self::null()
    }
}

/// Truthiness over a borrowed JSON value.
pub(crate) fn is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn path_walks_objects_and_arrays() {
        let value = ValueRef::new(json!({"feed": {"entries": [{"id": "a"}, {"id": "b"}]}}));
        let hit = value.path("feed.entries.1.id").unwrap();
        assert_eq!(hit.as_ref(), &json!("b"));
        assert!(value.path("feed.missing").is_none());
        assert!(value.path("feed.entries.7").is_none());
    }

    #[test]
    fn truthiness_matches_json_conventions() {
        assert!(!ValueRef::new(json!(null)).is_truthy());
        assert!(!ValueRef::new(json!(false)).is_truthy());
        assert!(!ValueRef::new(json!(0)).is_truthy());
        assert!(!ValueRef::new(json!("")).is_truthy());
        assert!(ValueRef::new(json!("0")).is_truthy());
        assert!(ValueRef::new(json!([])).is_truthy());
        assert!(ValueRef::new(json!({})).is_truthy());
        assert!(ValueRef::new(json!(1.5)).is_truthy());
    }
}
