use std::path::Path;

use error_stack::ResultExt as _;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{ParseError, Result};

/// A user-authored workflow definition: sources that produce items, an
/// optional filter, per-item steps, and an optional post stage.
///
/// Workflows are parsed once per run and never mutated. Raw stage fields
/// stay as JSON values until the resolver evaluates them against the
/// execution context, because most of them accept `${NAME}` placeholders.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    /// The sources that produce items for this workflow.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<SourceSpec>,

    /// Optional boolean-mask filter over the aggregated items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<StepSpec>,

    /// The steps to run for every surviving item, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepSpec>,

    /// Optional action after all items have been processed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post: Option<StepSpec>,

    /// Workflow-level general options.
    #[serde(flatten)]
    pub options: WorkflowOptions,
}

/// Workflow-level general options.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowOptions {
    /// Skip the whole workflow when this resolves false.
    #[serde(default, rename = "if", skip_serializing_if = "Option::is_none")]
    pub if_: Option<serde_json::Value>,

    /// Raise log verbosity for this workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<serde_json::Value>,

    /// Store namespace override for this workflow's persisted state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<serde_json::Value>,

    /// Default seconds to pause after each stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sleep: Option<serde_json::Value>,

    /// Maximum number of aggregated items to keep.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<serde_json::Value>,

    /// Bypass dedup filtering and recording for every source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force: Option<serde_json::Value>,

    /// Environment entries resolved into the context env map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<IndexMap<String, serde_json::Value>>,
}

/// One configured unit of work: a source, the filter, a step, or post.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSpec {
    /// Alias under which this stage's response is also addressable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,

    /// Module path identifying the executor implementation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<serde_json::Value>,

    /// Name of the registered executor to invoke.
    #[serde(default, rename = "use", skip_serializing_if = "Option::is_none")]
    pub use_: Option<serde_json::Value>,

    /// Inline script body for executors that interpret one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<serde_json::Value>,

    /// Arguments passed to the executor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<serde_json::Value>,

    /// Skip this stage (as a successful no-op) when this resolves false.
    #[serde(default, rename = "if", skip_serializing_if = "Option::is_none")]
    pub if_: Option<serde_json::Value>,

    /// Raise log verbosity while this stage runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<serde_json::Value>,

    /// Environment entries resolved into the context env map before the
    /// rest of this stage's fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<IndexMap<String, serde_json::Value>>,

    /// Shell command to run after the executor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<serde_json::Value>,

    /// Post-invocation validation step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assert: Option<Box<StepSpec>>,

    /// Secondary action after a successful invocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post: Option<Box<StepSpec>>,

    /// Downgrade a failure to a warning; stops only this stage's siblings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continue_on_error: Option<serde_json::Value>,

    /// Maximum number of items this stage keeps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<serde_json::Value>,

    /// Seconds to pause after this stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sleep: Option<serde_json::Value>,
}

impl StepSpec {
    /// Whether this spec expects to execute code (as opposed to being a
    /// pure pass-through, e.g. a filter that only truncates).
    pub fn wants_execution(&self) -> bool {
        self.use_.is_some() || self.run.is_some()
    }
}

/// A source: a step spec plus the fields governing item extraction.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    #[serde(flatten)]
    pub step: StepSpec,

    /// Bypass dedup filtering and recording for this source's items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force: Option<serde_json::Value>,

    /// Dotted path to the item list inside the raw result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_path: Option<serde_json::Value>,

    /// Payload field to use as the dedup key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<serde_json::Value>,

    /// Reverse item order before the survivor policy applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverse: Option<serde_json::Value>,

    /// Name of an executor returning a boolean mask over this source's items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_from: Option<serde_json::Value>,

    /// Name of an executor returning the replacement item list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_items_from: Option<serde_json::Value>,
}

impl Workflow {
    /// Parses a workflow from a YAML string.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml_ng::from_str(yaml).change_context(ParseError::InvalidDocument)
    }

    /// Parses a workflow from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).change_context(ParseError::InvalidDocument)
    }

    /// Parses a workflow file, dispatching on extension (`.yml`, `.yaml`,
    /// `.json`).
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .change_context_lazy(|| ParseError::ReadFile(path.to_path_buf()))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yml") | Some("yaml") => Self::from_yaml_str(&content),
            Some("json") => Self::from_json_str(&content),
            _ => Err(ParseError::UnrecognizedExtension(path.to_path_buf()).into()),
        }
    }
}
