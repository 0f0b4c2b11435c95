use error_stack::ResultExt as _;
use rillflow_core::ValueRef;
use rillflow_state::{StateStore, INTERNAL_STATE_KEY, STATE_KEY};
use serde::{Deserialize, Serialize};

use crate::{ExecutionError, Result};

/// Upper bound on the number of remembered dedup keys per workflow.
pub const MAX_SEEN_KEYS: usize = 1000;

/// The engine-private record of previously seen item keys.
///
/// Keys are kept most-recent-first, never duplicated, and capped at
/// [`MAX_SEEN_KEYS`] entries.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InternalState {
    #[serde(default)]
    pub keys: Vec<String>,
}

impl InternalState {
    pub fn contains(&self, key: &str) -> bool {
        self.keys.iter().any(|k| k == key)
    }

    /// Record a key as seen. Already-present keys are left where they are
    /// (treated as already-seen, not re-inserted); new keys go to the
    /// front and the list truncates to the cap.
    pub fn remember(&mut self, key: &str) {
        if self.contains(key) {
            return;
        }
        self.keys.insert(0, key.to_string());
        self.keys.truncate(MAX_SEEN_KEYS);
    }
}

/// Persisted state lifecycle for one workflow run.
///
/// `load` captures serialized snapshots of both documents; `persist`
/// writes a document back only when its serialization moved away from the
/// snapshot, so an unchanged run issues no `set` calls.
#[derive(Debug)]
pub(crate) struct StateSnapshot {
    pub state: ValueRef,
    pub internal_state: InternalState,
    init_state: String,
    init_internal_state: String,
}

impl StateSnapshot {
    pub async fn load(store: &dyn StateStore) -> Result<Self> {
        let state = store
            .get(STATE_KEY)
            .await
            .change_context(ExecutionError::StateLoad)?
            .unwrap_or_default();

        let internal_state = match store
            .get(INTERNAL_STATE_KEY)
            .await
            .change_context(ExecutionError::StateLoad)?
        {
            Some(value) => serde_json::from_value(value.as_ref().clone())
                .change_context(ExecutionError::StateLoad)?,
            None => InternalState::default(),
        };

        let init_state = serialize_state(&state)?;
        let init_internal_state = serialize_internal(&internal_state)?;

        Ok(Self {
            state,
            internal_state,
            init_state,
            init_internal_state,
        })
    }

    /// Write back whichever documents changed since `load`.
    pub async fn persist(
        &self,
        store: &dyn StateStore,
        state: &ValueRef,
        internal_state: &InternalState,
    ) -> Result<()> {
        let current_state = serialize_state(state)?;
        if current_state != self.init_state {
            tracing::debug!("Persisting changed workflow state");
            store
                .set(STATE_KEY, state.clone())
                .await
                .change_context(ExecutionError::StatePersist)?;
        }

        let current_internal = serialize_internal(internal_state)?;
        if current_internal != self.init_internal_state {
            tracing::debug!(keys = internal_state.keys.len(), "Persisting dedup record");
            let value = serde_json::to_value(internal_state)
                .change_context(ExecutionError::StatePersist)?;
            store
                .set(INTERNAL_STATE_KEY, ValueRef::new(value))
                .await
                .change_context(ExecutionError::StatePersist)?;
        }

        Ok(())
    }
}

fn serialize_state(state: &ValueRef) -> Result<String> {
    serde_json::to_string(state.as_ref()).change_context(ExecutionError::StateLoad)
}

fn serialize_internal(internal: &InternalState) -> Result<String> {
    serde_json::to_string(internal).change_context(ExecutionError::StateLoad)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rillflow_state::InMemoryStateStore;
    use serde_json::json;

    #[test]
    fn remember_caps_and_orders_keys() {
        let mut state = InternalState::default();
        for i in 0..(MAX_SEEN_KEYS + 50) {
            state.remember(&format!("key-{i}"));
        }
        assert_eq!(state.keys.len(), MAX_SEEN_KEYS);
        // Most recent first.
        assert_eq!(state.keys[0], format!("key-{}", MAX_SEEN_KEYS + 49));
        // The oldest 50 fell off.
        assert!(!state.contains("key-0"));
        assert!(!state.contains("key-49"));
        assert!(state.contains("key-50"));
    }

    #[test]
    fn remember_does_not_reinsert_known_keys() {
        let mut state = InternalState::default();
        state.remember("a");
        state.remember("b");
        state.remember("a");
        assert_eq!(state.keys, vec!["b".to_string(), "a".to_string()]);
    }

    #[tokio::test]
    async fn persist_skips_unchanged_documents() {
        let store = InMemoryStateStore::new();
        let snapshot = StateSnapshot::load(&store).await.unwrap();

        // Nothing changed: no writes at all.
        snapshot
            .persist(&store, &snapshot.state, &snapshot.internal_state)
            .await
            .unwrap();
        assert_eq!(store.write_count(), 0);

        // Only the dedup record changed: exactly one write.
        let mut internal = snapshot.internal_state.clone();
        internal.remember("k");
        snapshot
            .persist(&store, &snapshot.state, &internal)
            .await
            .unwrap();
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn load_round_trips_persisted_values() {
        let store = InMemoryStateStore::new();
        let snapshot = StateSnapshot::load(&store).await.unwrap();

        let state = ValueRef::new(json!({"cursor": 7}));
        let mut internal = InternalState::default();
        internal.remember("seen-1");
        snapshot.persist(&store, &state, &internal).await.unwrap();

        let reloaded = StateSnapshot::load(&store).await.unwrap();
        assert_eq!(reloaded.state.as_ref(), &json!({"cursor": 7}));
        assert_eq!(reloaded.internal_state.keys, vec!["seen-1".to_string()]);
    }
}
