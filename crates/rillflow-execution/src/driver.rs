//! Workflow discovery and the per-workflow failure boundary.
//!
//! The engine runs each discovered workflow inside its own failure
//! domain: a fatal error in one workflow is recorded and the next one
//! still runs. State stores are opened per workflow under a namespace
//! derived from the workflow's relative path (or its `database`
//! override), so sibling workflows never share persisted state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use error_stack::{Report, ResultExt as _};
use futures::future::{BoxFuture, FutureExt as _};
use rillflow_core::Workflow;
use rillflow_plugin::Executors;
use rillflow_state::{FileStateStore, InMemoryStateStore, StateStore};
use tracing::Instrument as _;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::context::{ExecutionContext, StageKind};
use crate::dedup::StateSnapshot;
use crate::filter::run_filter;
use crate::invoker::{apply_cmd, invoke, run_substeps};
use crate::items::{maybe_sleep, run_sources};
use crate::resolver::{resolve_step, resolve_workflow_options};
use crate::step_loop::run_steps;
use crate::{ExecutionError, Result};

/// Opens a state store for a workflow namespace.
pub trait StoreProvider: Send + Sync {
    fn open(&self, namespace: &str) -> BoxFuture<'_, Result<Arc<dyn StateStore>>>;
}

/// Store provider backed by JSON documents under one state directory.
pub struct FileStoreProvider {
    state_dir: PathBuf,
}

impl FileStoreProvider {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }
}

impl StoreProvider for FileStoreProvider {
    fn open(&self, namespace: &str) -> BoxFuture<'_, Result<Arc<dyn StateStore>>> {
        let namespace = namespace.to_string();
        async move {
            let store = FileStateStore::open(&self.state_dir, &namespace)
                .await
                .change_context_lazy(|| ExecutionError::StoreOpen(namespace.clone()))?;
            Ok(Arc::new(store) as Arc<dyn StateStore>)
        }
        .boxed()
    }
}

/// In-memory store provider.
///
/// Stores are kept per namespace for the provider's lifetime, so a
/// second run through the same engine observes the first run's state.
#[derive(Default)]
pub struct InMemoryStoreProvider {
    stores: Mutex<HashMap<String, Arc<InMemoryStateStore>>>,
}

impl InMemoryStoreProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// The store for `namespace`, creating it when absent.
    pub fn store(&self, namespace: &str) -> Arc<InMemoryStateStore> {
        self.stores
            .lock()
            .unwrap()
            .entry(namespace.to_string())
            .or_default()
            .clone()
    }
}

impl StoreProvider for InMemoryStoreProvider {
    fn open(&self, namespace: &str) -> BoxFuture<'_, Result<Arc<dyn StateStore>>> {
        let store = self.store(namespace);
        async move { Ok(store as Arc<dyn StateStore>) }.boxed()
    }
}

/// One fatal workflow outcome inside a run.
#[derive(Debug)]
pub struct WorkflowFailure {
    pub relative_path: String,
    pub error: Report<ExecutionError>,
}

/// Aggregated outcome of one engine run.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub succeeded: usize,
    pub skipped: usize,
    pub failures: Vec<WorkflowFailure>,
}

impl RunSummary {
    pub fn ok(&self) -> bool {
        self.failures.is_empty()
    }
}

/// How a single workflow ended, short of a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowOutcome {
    Ran,
    Skipped,
}

/// The workflow engine: an executor registry plus a store provider.
pub struct Engine {
    executors: Executors,
    stores: Arc<dyn StoreProvider>,
    force_all: bool,
}

impl Engine {
    pub fn new(executors: Executors, stores: Arc<dyn StoreProvider>) -> Self {
        Self {
            executors,
            stores,
            force_all: false,
        }
    }

    /// Bypass dedup filtering and recording for every workflow in this
    /// engine's runs.
    pub fn force_all(mut self, force: bool) -> Self {
        self.force_all = force;
        self
    }

    /// Run one workflow file, or every workflow under a directory.
    ///
    /// Workflows run in relative-path order. Each runs in its own
    /// failure domain; fatal errors land in the summary instead of
    /// aborting the run.
    pub async fn run_path(&self, path: &Path) -> Result<RunSummary> {
        let discovered = discover(path)?;
        tracing::info!(workflows = discovered.len(), path = %path.display(), "Starting run");

        let mut summary = RunSummary::default();
        for workflow in &discovered {
            match self.run_file(workflow).await {
                Ok(WorkflowOutcome::Ran) => summary.succeeded += 1,
                Ok(WorkflowOutcome::Skipped) => summary.skipped += 1,
                Err(error) => {
                    tracing::error!(
                        workflow = %workflow.relative_path,
                        error = ?error,
                        "Workflow failed"
                    );
                    summary.failures.push(WorkflowFailure {
                        relative_path: workflow.relative_path.clone(),
                        error,
                    });
                }
            }
        }

        tracing::info!(
            succeeded = summary.succeeded,
            skipped = summary.skipped,
            failed = summary.failures.len(),
            "Run finished"
        );
        Ok(summary)
    }

    async fn run_file(&self, discovered: &DiscoveredWorkflow) -> Result<WorkflowOutcome> {
        let workflow = Workflow::from_file(&discovered.path)
            .change_context_lazy(|| ExecutionError::Parse(discovered.path.clone()))?;
        self.run_workflow(
            &workflow,
            Some(&discovered.path),
            Some(&discovered.relative_path),
        )
        .await
    }

    /// Run one parsed workflow end to end.
    ///
    /// The state namespace is the `database` option when set, otherwise
    /// the relative path.
    pub async fn run_workflow(
        &self,
        workflow: &Workflow,
        path: Option<&Path>,
        relative_path: Option<&str>,
    ) -> Result<WorkflowOutcome> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "workflow",
            %run_id,
            path = relative_path.unwrap_or("<inline>")
        );
        self.execute(workflow, path, relative_path)
            .instrument(span)
            .await
    }

    async fn execute(
        &self,
        workflow: &Workflow,
        path: Option<&Path>,
        relative_path: Option<&str>,
    ) -> Result<WorkflowOutcome> {
        let mut ctx = ExecutionContext::new(Arc::new(InMemoryStateStore::new()));
        ctx.workflow_path = path.map(Path::to_path_buf);
        ctx.workflow_relative_path = relative_path.map(str::to_string);
        if let Some(parent) = path
            .and_then(Path::parent)
            .filter(|p| !p.as_os_str().is_empty())
        {
            ctx.cwd = Some(parent.to_path_buf());
        }

        ctx.options = resolve_workflow_options(&workflow.options, &mut ctx);
        if self.force_all {
            ctx.options.force = true;
        }
        if !ctx.options.if_ {
            tracing::info!("Workflow disabled, skipping");
            return Ok(WorkflowOutcome::Skipped);
        }
        if ctx.options.debug {
            tracing::debug!(options = ?ctx.options, "Resolved workflow options");
        }

        let namespace = ctx
            .options
            .database
            .clone()
            .or_else(|| ctx.workflow_relative_path.clone())
            .unwrap_or_else(|| "default".to_string());
        let store = self.stores.open(&namespace).await?;
        ctx.store = store.clone();

        let snapshot = StateSnapshot::load(store.as_ref()).await?;
        ctx.state = snapshot.state.clone();
        ctx.internal_state = snapshot.internal_state.clone();

        run_sources(&mut ctx, workflow, &self.executors).await?;

        if ctx.items.is_empty() {
            tracing::info!("No new items, nothing to do");
        } else {
            run_filter(&mut ctx, workflow, &self.executors).await?;
            run_steps(&mut ctx, workflow, &self.executors).await?;
            run_post(&mut ctx, workflow, &self.executors).await?;
        }

        snapshot
            .persist(store.as_ref(), &ctx.state, &ctx.internal_state)
            .await?;
        Ok(WorkflowOutcome::Ran)
    }
}

/// Run the workflow's post stage, when one is configured.
async fn run_post(
    ctx: &mut ExecutionContext,
    workflow: &Workflow,
    executors: &Executors,
) -> Result<()> {
    let Some(spec) = &workflow.post else {
        return Ok(());
    };

    ctx.current_stage = StageKind::Post;
    let resolved = resolve_step(spec, ctx);
    let response = invoke(ctx, &resolved, executors).await;
    let response = apply_cmd(response, &resolved, ctx).await;

    let failure = if !response.is_real_ok {
        response
            .error
            .clone()
            .or_else(|| Some(format!("post command exited with {:?}", response.cmd_code)))
    } else {
        run_substeps(ctx, &resolved, executors).await.err()
    };

    match failure {
        None => {
            if resolved.if_ {
                maybe_sleep(resolved.sleep.or(ctx.options.sleep)).await;
            }
            Ok(())
        }
        Some(message) if resolved.continue_on_error => {
            tracing::warn!(%message, "Post stage failed, continuing");
            Ok(())
        }
        Some(message) => Err(Report::new(ExecutionError::Post).attach_printable(message)),
    }
}

struct DiscoveredWorkflow {
    path: PathBuf,
    relative_path: String,
}

/// List the workflow files under `path`, in relative-path order.
///
/// A file path yields exactly that workflow; a directory is walked
/// recursively for `.yml` and `.yaml` files.
fn discover(path: &Path) -> Result<Vec<DiscoveredWorkflow>> {
    if path.is_file() {
        let relative_path = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        return Ok(vec![DiscoveredWorkflow {
            path: path.to_path_buf(),
            relative_path,
        }]);
    }

    let mut found = Vec::new();
    for entry in WalkDir::new(path) {
        let entry =
            entry.change_context_lazy(|| ExecutionError::Discover(path.to_path_buf()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let extension = entry.path().extension().and_then(|e| e.to_str());
        if !matches!(extension, Some("yml") | Some("yaml")) {
            continue;
        }
        let relative_path = entry
            .path()
            .strip_prefix(path)
            .unwrap_or(entry.path())
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        found.push(DiscoveredWorkflow {
            path: entry.path().to_path_buf(),
            relative_path,
        });
    }

    found.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rillflow_mock::{MockBehavior, MockExecutor};
    use serde_json::json;

    fn engine(mock: &MockExecutor) -> (Engine, Arc<InMemoryStoreProvider>) {
        let mut executors = Executors::new();
        executors.register("src", Arc::new(mock.clone())).unwrap();
        executors.register("step", Arc::new(mock.clone())).unwrap();
        let provider = Arc::new(InMemoryStoreProvider::new());
        (Engine::new(executors, provider.clone()), provider)
    }

    #[tokio::test]
    async fn disabled_workflows_are_skipped_without_opening_a_store() {
        let mock = MockExecutor::new();
        let (engine, provider) = engine(&mock);

        let wf = Workflow::from_yaml_str("if: false\nsources:\n  - use: src\n").unwrap();
        let outcome = engine.run_workflow(&wf, None, Some("a.yml")).await.unwrap();
        assert!(matches!(outcome, WorkflowOutcome::Skipped));
        assert_eq!(mock.call_count("src"), 0);
        assert!(provider.stores.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn database_option_overrides_the_namespace() {
        let mock = MockExecutor::new();
        mock.behavior("src", MockBehavior::result(json!([{"id": "x"}])));
        let (engine, provider) = engine(&mock);

        let wf = Workflow::from_yaml_str(
            "database: shared\nsources:\n  - use: src\n    key: id\n",
        )
        .unwrap();
        engine.run_workflow(&wf, None, Some("a.yml")).await.unwrap();

        let store = provider.store("shared");
        assert!(store
            .get(rillflow_state::INTERNAL_STATE_KEY)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn rerun_with_unchanged_state_issues_no_writes() {
        let mock = MockExecutor::new();
        mock.behavior("src", MockBehavior::result(json!([{"id": "x"}])));
        let (engine, provider) = engine(&mock);

        let wf = Workflow::from_yaml_str("sources:\n  - use: src\n    key: id\n").unwrap();
        engine.run_workflow(&wf, None, Some("a.yml")).await.unwrap();
        let store = provider.store("a.yml");
        assert_eq!(store.write_count(), 1);

        // The same item is already recorded; the second run changes
        // nothing and persists nothing.
        engine.run_workflow(&wf, None, Some("a.yml")).await.unwrap();
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn step_state_updates_are_persisted_once() {
        let mock = MockExecutor::new();
        mock.behavior("src", MockBehavior::result(json!([{"id": "x"}])));
        mock.behavior(
            "step",
            MockBehavior::result(json!({"sent": true, "@state": {"cursor": 7}})),
        );
        let (engine, provider) = engine(&mock);

        let wf = Workflow::from_yaml_str(
            "sources:\n  - use: src\n    key: id\nsteps:\n  - use: step\n",
        )
        .unwrap();
        engine.run_workflow(&wf, None, Some("a.yml")).await.unwrap();

        let store = provider.store("a.yml");
        let state = store.get(rillflow_state::STATE_KEY).await.unwrap().unwrap();
        assert_eq!(state.as_ref(), &json!({"cursor": 7}));
        // One write for the state, one for the dedup keys.
        assert_eq!(store.write_count(), 2);

        // The item is already recorded, so the second run changes nothing.
        engine.run_workflow(&wf, None, Some("a.yml")).await.unwrap();
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn post_runs_only_when_items_survive() {
        let mock = MockExecutor::new();
        mock.behavior("src", MockBehavior::result(json!([])));
        mock.behavior("done", MockBehavior::result(json!("done")));
        let (mut engine, _provider) = engine(&mock);
        engine
            .executors
            .register("done", Arc::new(mock.clone()))
            .unwrap();

        let wf = Workflow::from_yaml_str("sources:\n  - use: src\npost:\n  use: done\n").unwrap();
        engine.run_workflow(&wf, None, Some("a.yml")).await.unwrap();
        assert_eq!(mock.call_count("done"), 0);
    }

    #[tokio::test]
    async fn fatal_post_failure_fails_the_workflow() {
        let mock = MockExecutor::new();
        mock.behavior("src", MockBehavior::result(json!([{"id": "x"}])));
        mock.behavior("done", MockBehavior::error("smtp down"));
        let (mut engine, _provider) = engine(&mock);
        engine
            .executors
            .register("done", Arc::new(mock.clone()))
            .unwrap();

        let wf = Workflow::from_yaml_str(
            "sources:\n  - use: src\n    key: id\npost:\n  use: done\n",
        )
        .unwrap();
        let err = engine
            .run_workflow(&wf, None, Some("a.yml"))
            .await
            .unwrap_err();
        assert!(matches!(err.current_context(), ExecutionError::Post));
    }

    #[tokio::test]
    async fn discovery_orders_by_relative_path() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("b.yml"), "steps: []\n").unwrap();
        std::fs::write(dir.path().join("a.yaml"), "steps: []\n").unwrap();
        std::fs::write(dir.path().join("nested/c.yml"), "steps: []\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let found = discover(dir.path()).unwrap();
        let relative: Vec<_> = found.iter().map(|w| w.relative_path.as_str()).collect();
        assert_eq!(relative, vec!["a.yaml", "b.yml", "nested/c.yml"]);
    }

    #[tokio::test]
    async fn one_broken_workflow_does_not_stop_its_siblings() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.yml"), "sources: 12\n").unwrap();
        std::fs::write(
            dir.path().join("b.yml"),
            "sources:\n  - use: src\n    key: id\n",
        )
        .unwrap();

        let mock = MockExecutor::new();
        mock.behavior("src", MockBehavior::result(json!([{"id": "x"}])));
        let (engine, _provider) = engine(&mock);

        let summary = engine.run_path(dir.path()).await.unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].relative_path, "a.yml");
        assert!(!summary.ok());
        assert_eq!(mock.call_count("src"), 1);
    }

    #[tokio::test]
    async fn force_all_overrides_every_workflow() {
        let mock = MockExecutor::new();
        mock.behavior("src", MockBehavior::result(json!([{"id": "x"}])));
        mock.behavior("step", MockBehavior::result(json!("ok")));
        let (engine, provider) = engine(&mock);
        let engine = engine.force_all(true);

        let wf = Workflow::from_yaml_str(
            "sources:\n  - use: src\n    key: id\nsteps:\n  - use: step\n",
        )
        .unwrap();
        engine.run_workflow(&wf, None, Some("a.yml")).await.unwrap();
        engine.run_workflow(&wf, None, Some("a.yml")).await.unwrap();

        // Dedup bypassed: the step ran for the item both times and no
        // keys were recorded.
        assert_eq!(mock.call_count("step"), 2);
        let store = provider.store("a.yml");
        assert!(store
            .get(rillflow_state::INTERNAL_STATE_KEY)
            .await
            .unwrap()
            .is_none());
    }
}
