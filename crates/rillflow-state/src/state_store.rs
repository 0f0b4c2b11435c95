use futures::future::BoxFuture;
use rillflow_core::ValueRef;

use crate::Result;

/// Key under which a workflow's user-visible state is persisted.
pub const STATE_KEY: &str = "state";

/// Key under which the engine's dedup record is persisted.
pub const INTERNAL_STATE_KEY: &str = "internalState";

/// Trait for persisting per-workflow state between runs.
///
/// Implementations are namespaced: one store instance owns the documents
/// of exactly one workflow for the duration of a run. The engine reads
/// both keys once at workflow start and writes each back at most once at
/// the end, only when the value changed.
pub trait StateStore: Send + Sync {
    /// Retrieve the value stored under `key`, or `None` when absent.
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<ValueRef>>>;

    /// Store `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: ValueRef) -> BoxFuture<'_, Result<()>>;
}
