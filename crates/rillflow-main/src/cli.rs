use std::path::PathBuf;
use std::sync::Arc;

use error_stack::ResultExt as _;
use rillflow_execution::{Engine, FileStoreProvider, RunSummary};
use rillflow_plugin::Executors;

use crate::error::{MainError, Result};
use crate::shell::ShellExecutor;

/// Rillflow command line application.
#[derive(clap::Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
pub enum Command {
    /// Run a workflow file, or every workflow under a directory.
    Run {
        /// Path to a workflow file or a directory of workflows.
        #[arg(long, value_name = "PATH", value_hint = clap::ValueHint::AnyPath)]
        path: PathBuf,

        /// Directory holding the persisted per-workflow state.
        #[arg(long, value_name = "DIR", default_value = ".rillflow", value_hint = clap::ValueHint::DirPath)]
        state_dir: PathBuf,

        /// Re-process every item, ignoring and skipping the dedup record.
        #[arg(long)]
        force: bool,
    },
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Command::Run {
                path,
                state_dir,
                force,
            } => {
                let summary = run(&path, &state_dir, force).await?;
                if !summary.ok() {
                    return Err(MainError::WorkflowsFailed(summary.failures.len()).into());
                }
                Ok(())
            }
        }
    }
}

/// Run the workflows under `path` with the built-in executors.
pub async fn run(path: &std::path::Path, state_dir: &std::path::Path, force: bool) -> Result<RunSummary> {
    let mut executors = Executors::new();
    executors
        .register("run", Arc::new(ShellExecutor))
        .change_context(MainError::RegisterExecutor)?;

    let engine = Engine::new(executors, Arc::new(FileStoreProvider::new(state_dir)))
        .force_all(force);
    let summary = engine.run_path(path).await.change_context(MainError::Run)?;

    for failure in &summary.failures {
        tracing::error!(workflow = %failure.relative_path, error = ?failure.error, "Failed");
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_scripts_execute_without_registered_executors() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("shell.yml"),
            r#"
sources:
  - run: "printf '[{\"id\": \"a\"}, {\"id\": \"b\"}]'"
    key: id
steps:
  - run: "printf 'handled %s' \"$RILLFLOW_ITEM_KEY\""
"#,
        )
        .unwrap();

        let state_dir = dir.path().join("state");
        let summary = run(dir.path(), &state_dir, false).await.unwrap();
        assert!(summary.ok());
        assert_eq!(summary.succeeded, 1);

        // A second run was deduplicated down to nothing, but still counts
        // as a success.
        let summary = run(dir.path(), &state_dir, false).await.unwrap();
        assert!(summary.ok());
        assert_eq!(summary.succeeded, 1);
    }

    #[tokio::test]
    async fn failures_surface_as_a_failed_summary() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("broken.yml"),
            "sources:\n  - use: unregistered\n",
        )
        .unwrap();

        let summary = run(dir.path(), &dir.path().join("state"), false)
            .await
            .unwrap();
        assert!(!summary.ok());
        assert_eq!(summary.failures.len(), 1);
    }
}
