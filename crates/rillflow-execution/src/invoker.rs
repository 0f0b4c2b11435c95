//! Single-stage invocation: call the opaque executor, optionally run the
//! stage's shell command, and normalize everything into a
//! [`StageResponse`].

use rillflow_core::StageResponse;
use rillflow_plugin::{Executors, InvocationSpec};

use crate::context::ExecutionContext;
use crate::resolver::{resolve_step, ResolvedStep};

/// Invoke the executor for one resolved stage.
///
/// `if: false` short-circuits into a successful no-op without touching
/// the executor. Executor errors are caught here and recorded on the
/// response; whether they abort anything is the caller's policy.
pub(crate) async fn invoke(
    ctx: &mut ExecutionContext,
    resolved: &ResolvedStep,
    executors: &Executors,
) -> StageResponse {
    if !resolved.if_ {
        tracing::debug!(stage = ctx.current_stage.as_str(), "Stage disabled, skipping");
        let response = StageResponse::skipped();
        ctx.apply_response(&response);
        return response;
    }

    let response = match resolved.executor_name() {
        None => StageResponse::skipped(),
        Some(name) => {
            let spec = InvocationSpec {
                name: name.clone(),
                from: resolved.from.clone(),
                run: resolved.run.clone(),
                args: resolved.args.clone(),
            };
            let view = ctx.stage_view();
            match executors.get(&name) {
                Err(e) => StageResponse::failure(e.to_string()),
                Ok(executor) => match executor.execute(&spec, &view).await {
                    Ok(result) => StageResponse::success(ctx.absorb_state(result)),
                    Err(e) => StageResponse::failure(e.to_string()),
                },
            }
        }
    };

    if resolved.debug {
        tracing::debug!(
            stage = ctx.current_stage.as_str(),
            ok = response.ok,
            "Stage executor finished"
        );
    }

    ctx.apply_response(&response);
    response
}

/// Run the stage's shell command, when one is configured and the stage is
/// enabled, and fold its outcome into the response. The command never
/// affects `result`; only the cmd fields and the effective success change.
pub(crate) async fn apply_cmd(
    response: StageResponse,
    resolved: &ResolvedStep,
    ctx: &mut ExecutionContext,
) -> StageResponse {
    let Some(cmd) = resolved.cmd.as_deref().filter(|_| resolved.if_) else {
        return response;
    };

    let response = match run_cmd(cmd, ctx).await {
        Ok((stdout, code)) => response.with_cmd(stdout, code),
        Err(message) => {
            tracing::warn!(cmd, %message, "Shell command could not run");
            response.with_cmd(message, None)
        }
    };
    ctx.apply_response(&response);
    response
}

async fn run_cmd(cmd: &str, ctx: &ExecutionContext) -> Result<(String, Option<i32>), String> {
    let mut command = tokio::process::Command::new("sh");
    command.arg("-c").arg(cmd).envs(ctx.env.iter());
    if let Some(cwd) = &ctx.cwd {
        command.current_dir(cwd);
    }

    let output = command.output().await.map_err(|e| e.to_string())?;
    let stdout = String::from_utf8_lossy(&output.stdout)
        .trim_end_matches('\n')
        .to_string();
    Ok((stdout, output.status.code()))
}

/// Run a stage's `assert`/`post` sub-steps. A failed assertion (error,
/// falsy result, or failed cmd) or a failed post action surfaces as this
/// stage's failure, subject to the parent stage's error policy. A disabled
/// parent stage runs no sub-steps at all.
pub(crate) async fn run_substeps(
    ctx: &mut ExecutionContext,
    resolved: &ResolvedStep,
    executors: &Executors,
) -> Result<(), String> {
    if !resolved.if_ {
        return Ok(());
    }

    if let Some(assert_spec) = &resolved.assert {
        let assert_resolved = resolve_step(assert_spec, ctx);
        let response = invoke(ctx, &assert_resolved, executors).await;
        let response = apply_cmd(response, &assert_resolved, ctx).await;
        let passed = response.is_real_ok
            && response
                .result
                .as_ref()
                .map(|v| v.is_truthy())
                .unwrap_or(true);
        if !passed {
            return Err(response
                .error
                .unwrap_or_else(|| "assertion failed".to_string()));
        }
    }

    if let Some(post_spec) = &resolved.post {
        let post_resolved = resolve_step(post_spec, ctx);
        let response = invoke(ctx, &post_resolved, executors).await;
        let response = apply_cmd(response, &post_resolved, ctx).await;
        if !response.is_real_ok {
            return Err(response
                .error
                .unwrap_or_else(|| "post action failed".to_string()));
        }
    }

    Ok(())
}
