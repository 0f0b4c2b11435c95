use std::path::PathBuf;

use indexmap::IndexMap;
use rillflow_core::{StageResponse, ValueRef};

/// Snapshot of the public region of the execution context, rendered for
/// one executor invocation.
///
/// Items appear in their JSON view, carrying the reserved `@uniqueKey`
/// and `@sourceIndex` fields; executors must not repurpose those names.
#[derive(Debug, Clone, Default)]
pub struct StageContext {
    /// Resolved environment entries for this workflow. The engine never
    /// touches the process environment.
    pub env: IndexMap<String, String>,
    /// Absolute path of the workflow file, when it came from one.
    pub workflow_path: Option<PathBuf>,
    /// Workflow path relative to the discovery root.
    pub workflow_relative_path: Option<String>,
    /// Working directory of the run.
    pub cwd: Option<PathBuf>,
    /// Responses of completed sources, keyed by index and declared alias.
    pub sources: IndexMap<String, StageResponse>,
    /// Responses of completed steps for the current item, keyed by index
    /// and declared alias.
    pub steps: IndexMap<String, StageResponse>,
    /// Response of the filter stage, once it ran.
    pub filter: Option<StageResponse>,
    /// The workflow's persisted user state. An executor replaces it by
    /// returning an object carrying the reserved `@state` field; the
    /// engine folds that value back and strips the field from the
    /// recorded result.
    pub state: ValueRef,
    /// The aggregated item list, in JSON view.
    pub items: Vec<serde_json::Value>,
    /// The current item, during the step loop.
    pub item: Option<serde_json::Value>,
    /// Index of the current item within `items`.
    pub item_index: Option<usize>,
    /// Dedup key of the current item.
    pub item_key: Option<String>,
    /// Index of the source that produced the current item.
    pub item_source_index: Option<usize>,
    /// Response of the most recent stage invocation.
    pub last: Option<StageResponse>,
}
