//! The per-item step loop.

use error_stack::Report;
use rillflow_core::Workflow;
use rillflow_plugin::Executors;

use crate::context::{ExecutionContext, ResponseTable, StageKind};
use crate::invoker::{apply_cmd, invoke, run_substeps};
use crate::items::maybe_sleep;
use crate::resolver::resolve_step;
use crate::{ExecutionError, Result};

/// Run every configured step for every surviving item, in order.
///
/// A step failure with `continue_on_error` stops the remaining steps for
/// the current item only; the next item still runs all its steps. After
/// an item's steps complete (including the recovered path), its dedup key
/// is recorded unless the originating source asked for `force`.
pub(crate) async fn run_steps(
    ctx: &mut ExecutionContext,
    workflow: &Workflow,
    executors: &Executors,
) -> Result<()> {
    let items = ctx.items.clone();

    for (item_index, item) in items.iter().enumerate() {
        ctx.item = Some(item.clone());
        ctx.item_index = Some(item_index);
        ctx.item_key = item.unique_key.clone();
        ctx.item_source_index = item.source_index;
        ctx.item_source_options = item
            .source_index
            .and_then(|index| ctx.sources_options.get(index).cloned());
        ctx.steps = ResponseTable::new();

        if item.unique_key.is_none() || item.source_index.is_none() {
            tracing::warn!(item = item_index, "Item carries no source/key tags");
        }

        for (step_index, spec) in workflow.steps.iter().enumerate() {
            ctx.current_stage = StageKind::Step;
            let resolved = resolve_step(spec, ctx);

            let response = invoke(ctx, &resolved, executors).await;
            let response = apply_cmd(response, &resolved, ctx).await;

            let failure = if !response.is_real_ok {
                response
                    .error
                    .clone()
                    .or_else(|| Some(format!("step command exited with {:?}", response.cmd_code)))
            } else {
                run_substeps(ctx, &resolved, executors).await.err()
            };

            ctx.steps.insert(response, resolved.id.as_deref());

            match failure {
                None if resolved.if_ => {
                    maybe_sleep(resolved.sleep.or(ctx.options.sleep)).await;
                }
                None => {}
                Some(message) if resolved.continue_on_error => {
                    tracing::warn!(
                        item = item_index,
                        step = step_index,
                        %message,
                        "Step failed, skipping remaining steps for this item"
                    );
                    break;
                }
                Some(message) => {
                    return Err(Report::new(ExecutionError::Step {
                        step: step_index,
                        item: item_index,
                    })
                    .attach_printable(message));
                }
            }
        }

        record_item_key(ctx, item_index);
    }

    ctx.item = None;
    ctx.item_index = None;
    ctx.item_key = None;
    ctx.item_source_index = None;
    ctx.item_source_options = None;
    Ok(())
}

/// Remember the current item's dedup key, unless its source asked for
/// `force` or the item carries no key.
fn record_item_key(ctx: &mut ExecutionContext, item_index: usize) {
    let force = ctx
        .item_source_options
        .as_ref()
        .map(|options| options.force)
        .unwrap_or(ctx.options.force);
    if force {
        return;
    }

    match ctx.item_key.clone() {
        Some(key) => ctx.internal_state.remember(&key),
        None => {
            tracing::warn!(item = item_index, "Item has no dedup key, state tracking skipped");
        }
    }
}
