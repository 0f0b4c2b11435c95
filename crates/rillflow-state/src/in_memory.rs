use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt as _};
use rillflow_core::ValueRef;
use tokio::sync::RwLock;

use crate::{Result, StateStore};

/// In-memory implementation of [`StateStore`].
///
/// Suitable for tests and for runs that do not need persistence across
/// process restarts. Tracks the number of `set` calls so tests can assert
/// the engine's write-only-when-changed behavior.
#[derive(Default)]
pub struct InMemoryStateStore {
    entries: Arc<RwLock<HashMap<String, ValueRef>>>,
    writes: AtomicUsize,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `set` calls issued against this store.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl StateStore for InMemoryStateStore {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<ValueRef>>> {
        let entries = self.entries.clone();
        let key = key.to_string();
        async move { Ok(entries.read().await.get(&key).cloned()) }.boxed()
    }

    fn set(&self, key: &str, value: ValueRef) -> BoxFuture<'_, Result<()>> {
        let entries = self.entries.clone();
        let key = key.to_string();
        self.writes.fetch_add(1, Ordering::SeqCst);
        async move {
            entries.write().await.insert(key, value);
            Ok(())
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn get_returns_latest_set_value() {
        let store = InMemoryStateStore::new();
        assert!(store.get("state").await.unwrap().is_none());

        store.set("state", ValueRef::new(json!({"n": 1}))).await.unwrap();
        store.set("state", ValueRef::new(json!({"n": 2}))).await.unwrap();

        let value = store.get("state").await.unwrap().unwrap();
        assert_eq!(value.as_ref(), &json!({"n": 2}));
        assert_eq!(store.write_count(), 2);
    }
}
