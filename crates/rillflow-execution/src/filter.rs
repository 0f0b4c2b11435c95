//! The filter stage: reduce the aggregated item list with a
//! user-supplied boolean mask.

use error_stack::Report;
use rillflow_core::{Item, Workflow};
use rillflow_plugin::Executors;

use crate::context::{ExecutionContext, StageKind};
use crate::invoker::{apply_cmd, invoke, run_substeps};
use crate::resolver::resolve_step;
use crate::{ExecutionError, Result};

/// Run the workflow's filter stage, when one is configured.
///
/// A filter that requested execution must return a boolean array exactly
/// matching the item list; anything else is fatal for the workflow even
/// under `continue_on_error`; the mask shape is validated before the
/// error policy applies.
pub(crate) async fn run_filter(
    ctx: &mut ExecutionContext,
    workflow: &Workflow,
    executors: &Executors,
) -> Result<()> {
    let Some(spec) = &workflow.filter else {
        return Ok(());
    };

    ctx.current_stage = StageKind::Filter;
    let resolved = resolve_step(spec, ctx);
    let mut response = invoke(ctx, &resolved, executors).await;
    response = apply_cmd(response, &resolved, ctx).await;

    // The mask shape is only enforced when the executor actually ran; a
    // disabled filter is a successful no-op that keeps every item.
    if resolved.if_ && resolved.wants_execution && response.ok {
        let expected = ctx.items.len();
        let mask = response
            .result
            .as_ref()
            .and_then(|r| r.as_ref().as_array())
            .filter(|mask| mask.len() == expected)
            .ok_or_else(|| Report::new(ExecutionError::FilterMask { expected }))?;

        let survivors: Vec<Item> = ctx
            .items
            .iter()
            .zip(mask.iter())
            .filter(|(_, keep)| rillflow_core::ValueRef::new((*keep).clone()).is_truthy())
            .map(|(item, _)| item.clone())
            .collect();

        tracing::debug!(before = expected, after = survivors.len(), "Filter applied");
        ctx.items = survivors;

        let items_json: Vec<serde_json::Value> = ctx.items.iter().map(Item::to_value).collect();
        response.result = Some(rillflow_core::ValueRef::new(serde_json::Value::Array(
            items_json,
        )));
    }

    let failure = if !response.is_real_ok {
        response.error.clone().or_else(|| {
            Some(format!("filter command exited with {:?}", response.cmd_code))
        })
    } else {
        run_substeps(ctx, &resolved, executors).await.err()
    };

    if let Some(message) = failure {
        ctx.filter = Some(response);
        if resolved.continue_on_error {
            tracing::warn!(%message, "Filter failed, continuing workflow");
            return Ok(());
        }
        return Err(Report::new(ExecutionError::Filter).attach_printable(message));
    }

    if resolved.if_ {
        if let Some(limit) = resolved.limit {
            ctx.items.truncate(limit);
        }
    }

    ctx.apply_response(&response);
    ctx.filter = Some(response);
    if resolved.if_ {
        crate::items::maybe_sleep(resolved.sleep.or(ctx.options.sleep)).await;
    }
    Ok(())
}
