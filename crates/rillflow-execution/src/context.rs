use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;
use rillflow_core::{Item, StageResponse, ValueRef, STATE_FIELD};
use rillflow_plugin::StageContext;
use rillflow_state::StateStore;

use crate::dedup::InternalState;
use crate::resolver::{ResolvedSource, ResolvedWorkflowOptions};

/// Which kind of stage is currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StageKind {
    #[default]
    Source,
    Filter,
    Step,
    Post,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Source => "source",
            StageKind::Filter => "filter",
            StageKind::Step => "step",
            StageKind::Post => "post",
        }
    }
}

/// Stage responses addressable by numeric index and declared alias.
///
/// The alias entry is a copy of the indexed entry taken at assignment
/// time; both views stay identical because responses are immutable.
#[derive(Debug, Clone, Default)]
pub struct ResponseTable {
    ordered: Vec<StageResponse>,
    aliases: IndexMap<String, StageResponse>,
}

impl ResponseTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, response: StageResponse, id: Option<&str>) {
        if let Some(id) = id {
            self.aliases.insert(id.to_string(), response.clone());
        }
        self.ordered.push(response);
    }

    pub fn by_index(&self, index: usize) -> Option<&StageResponse> {
        self.ordered.get(index)
    }

    pub fn by_id(&self, id: &str) -> Option<&StageResponse> {
        self.aliases.get(id)
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    /// Flatten into one map keyed by stringified index plus aliases, the
    /// shape executors see.
    pub fn as_map(&self) -> IndexMap<String, StageResponse> {
        let mut map: IndexMap<String, StageResponse> = self
            .ordered
            .iter()
            .enumerate()
            .map(|(i, r)| (i.to_string(), r.clone()))
            .collect();
        for (id, response) in &self.aliases {
            map.insert(id.clone(), response.clone());
        }
        map
    }
}

/// The single mutable object threaded through one workflow run.
///
/// The public fields make up the region executors can observe (via
/// [`ExecutionContext::stage_view`]); the crate-private fields are engine
/// bookkeeping that never leaves the core.
pub struct ExecutionContext {
    // Public region.
    pub env: IndexMap<String, String>,
    pub workflow_path: Option<PathBuf>,
    pub workflow_relative_path: Option<String>,
    pub cwd: Option<PathBuf>,
    pub sources: ResponseTable,
    pub steps: ResponseTable,
    pub filter: Option<StageResponse>,
    pub state: ValueRef,
    pub items: Vec<Item>,
    pub item: Option<Item>,
    pub item_index: Option<usize>,
    pub item_key: Option<String>,
    pub item_source_index: Option<usize>,
    pub last: Option<StageResponse>,
    pub options: ResolvedWorkflowOptions,

    // Internal region.
    pub(crate) internal_state: InternalState,
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) sources_options: Vec<ResolvedSource>,
    pub(crate) item_source_options: Option<ResolvedSource>,
    pub(crate) current_stage: StageKind,
}

impl ExecutionContext {
    pub(crate) fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            env: IndexMap::new(),
            workflow_path: None,
            workflow_relative_path: None,
            cwd: std::env::current_dir().ok(),
            sources: ResponseTable::new(),
            steps: ResponseTable::new(),
            filter: None,
            state: ValueRef::null(),
            items: Vec::new(),
            item: None,
            item_index: None,
            item_key: None,
            item_source_index: None,
            last: None,
            options: ResolvedWorkflowOptions::default(),
            internal_state: InternalState::default(),
            store,
            sources_options: Vec::new(),
            item_source_options: None,
            current_stage: StageKind::default(),
        }
    }

    /// Record a stage response into the scratch fields.
    pub(crate) fn apply_response(&mut self, response: &StageResponse) {
        self.last = Some(response.clone());
    }

    /// Render the executor-visible snapshot of the public region.
    pub(crate) fn stage_view(&self) -> StageContext {
        StageContext {
            env: self.env.clone(),
            workflow_path: self.workflow_path.clone(),
            workflow_relative_path: self.workflow_relative_path.clone(),
            cwd: self.cwd.clone(),
            sources: self.sources.as_map(),
            steps: self.steps.as_map(),
            filter: self.filter.clone(),
            state: self.state.clone(),
            items: self.items.iter().map(Item::to_value).collect(),
            item: self.item.as_ref().map(Item::to_value),
            item_index: self.item_index,
            item_key: self.item_key.clone(),
            item_source_index: self.item_source_index,
            last: self.last.clone(),
        }
    }

    /// Fold an `@state` entry of an executor result back into the
    /// context, returning the result without the reserved field.
    pub(crate) fn absorb_state(&mut self, result: ValueRef) -> ValueRef {
        let serde_json::Value::Object(map) = result.as_ref() else {
            return result;
        };
        if !map.contains_key(STATE_FIELD) {
            return result;
        }
        let mut map = map.clone();
        if let Some(state) = map.remove(STATE_FIELD) {
            self.state = ValueRef::new(state);
        }
        ValueRef::new(serde_json::Value::Object(map))
    }

    pub fn internal_state(&self) -> &InternalState {
        &self.internal_state
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("workflow_relative_path", &self.workflow_relative_path)
            .field("sources", &self.sources)
            .field("steps", &self.steps)
            .field("filter", &self.filter)
            .field("state", &self.state)
            .field("items", &self.items)
            .field("item_index", &self.item_index)
            .field("item_key", &self.item_key)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
