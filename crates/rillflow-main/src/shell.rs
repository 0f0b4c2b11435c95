//! The built-in `run` executor: stages that declare a `run` script and
//! no `use` name dispatch here.

use futures::future::{BoxFuture, FutureExt as _};
use rillflow_core::ValueRef;
use rillflow_plugin::{ExecutorError, InvocationSpec, Result, StageContext, StepExecutor};

/// Executes a stage's `run` field as a shell script.
///
/// The context env map is exported into the script's environment, along
/// with `RILLFLOW_ARGS` (the resolved args as JSON) and, inside the step
/// loop, `RILLFLOW_ITEM`/`RILLFLOW_ITEM_KEY`/`RILLFLOW_ITEM_INDEX`.
/// Stdout is parsed as JSON when it parses, otherwise kept as a string.
pub struct ShellExecutor;

impl StepExecutor for ShellExecutor {
    fn execute<'a>(
        &'a self,
        spec: &'a InvocationSpec,
        ctx: &'a StageContext,
    ) -> BoxFuture<'a, Result<ValueRef>> {
        async move {
            let script = spec.run.as_deref().ok_or_else(|| {
                error_stack::Report::new(ExecutorError::Execution(spec.name.clone()))
                    .attach_printable("stage has no run script")
            })?;

            let mut command = tokio::process::Command::new("sh");
            command.arg("-c").arg(script).envs(ctx.env.iter());
            if let Some(cwd) = &ctx.cwd {
                command.current_dir(cwd);
            }
            command.env("RILLFLOW_ARGS", spec.args.as_ref().to_string());
            if let Some(item) = &ctx.item {
                command.env("RILLFLOW_ITEM", item.to_string());
            }
            if let Some(key) = &ctx.item_key {
                command.env("RILLFLOW_ITEM_KEY", key);
            }
            if let Some(index) = ctx.item_index {
                command.env("RILLFLOW_ITEM_INDEX", index.to_string());
            }

            let output = command.output().await.map_err(|e| {
                error_stack::Report::new(e)
                    .change_context(ExecutorError::Execution(spec.name.clone()))
            })?;

            let stdout = String::from_utf8_lossy(&output.stdout)
                .trim_end_matches('\n')
                .to_string();

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
                return Err(error_stack::Report::new(ExecutorError::Execution(
                    spec.name.clone(),
                ))
                .attach_printable(format!(
                    "script exited with {:?}: {stderr}",
                    output.status.code()
                )));
            }

            let result = serde_json::from_str(&stdout)
                .map(ValueRef::new)
                .unwrap_or_else(|_| ValueRef::new(serde_json::Value::String(stdout)));
            Ok(result)
        }
        .boxed()
    }
}
