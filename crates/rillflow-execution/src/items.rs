//! The item pipeline: turn each source's raw result into a tagged,
//! deduplicated item list and aggregate all sources into `ctx.items`.

use error_stack::Report;
use rillflow_core::{Item, ValueRef, Workflow};
use rillflow_plugin::{Executors, InvocationSpec};

use crate::context::{ExecutionContext, StageKind};
use crate::invoker::{apply_cmd, invoke, run_substeps};
use crate::resolver::{resolve_source, ResolvedSource};
use crate::{ExecutionError, Result};

/// Run every source in declaration order and aggregate their items.
///
/// A recovered failure (`continue_on_error`) stops the remaining sources
/// but lets the workflow proceed; a plain failure aborts the workflow.
pub(crate) async fn run_sources(
    ctx: &mut ExecutionContext,
    workflow: &Workflow,
    executors: &Executors,
) -> Result<()> {
    let mut aggregated: Vec<Item> = Vec::new();

    for (index, spec) in workflow.sources.iter().enumerate() {
        ctx.current_stage = StageKind::Source;
        let resolved = resolve_source(spec, ctx);
        ctx.sources_options.push(resolved.clone());

        let outcome = run_source(ctx, index, &resolved, executors).await;

        match outcome {
            Ok(items) => {
                aggregated.extend(items);
                if resolved.step.if_ {
                    maybe_sleep(resolved.step.sleep.or(ctx.options.sleep)).await;
                }
            }
            Err(message) if resolved.step.continue_on_error => {
                tracing::warn!(source = index, %message, "Source failed, continuing workflow");
                break;
            }
            Err(message) => {
                return Err(Report::new(ExecutionError::Source(index)).attach_printable(message));
            }
        }
    }

    if let Some(limit) = ctx.options.limit {
        aggregated.truncate(limit);
    }
    ctx.items = aggregated;
    Ok(())
}

/// Run one source end-to-end. Returns the source's tagged, deduplicated
/// contribution, or the failure message.
async fn run_source(
    ctx: &mut ExecutionContext,
    index: usize,
    resolved: &ResolvedSource,
    executors: &Executors,
) -> std::result::Result<Vec<Item>, String> {
    let response = invoke(ctx, &resolved.step, executors).await;

    if !response.is_real_ok {
        let message = response
            .error
            .clone()
            .unwrap_or_else(|| "source executor failed".to_string());
        ctx.sources.insert(response, resolved.step.id.as_deref());
        return Err(message);
    }

    // A disabled source contributes no items and skips the survivor
    // policy, the cmd group, and the sub-steps entirely.
    if !resolved.step.if_ {
        ctx.sources.insert(response, resolved.step.id.as_deref());
        return Ok(Vec::new());
    }

    // Item extraction and the survivor policy happen before the cmd group,
    // matching the field-group resolution order.
    let mut items = extract_items(response.result.as_ref(), resolved.items_path.as_deref());

    if resolved.reverse {
        items.reverse();
    }

    match apply_survivor_policy(ctx, resolved, items, executors).await {
        Ok(survivors) => items = survivors,
        Err(message) => {
            ctx.sources.insert(response, resolved.step.id.as_deref());
            return Err(message);
        }
    }

    let response = apply_cmd(response, &resolved.step, ctx).await;
    if !response.is_real_ok {
        let message = format!(
            "source command exited with {:?}",
            response.cmd_code
        );
        ctx.sources.insert(response, resolved.step.id.as_deref());
        return Err(message);
    }

    if let Err(message) = run_substeps(ctx, &resolved.step, executors).await {
        ctx.sources.insert(response, resolved.step.id.as_deref());
        return Err(message);
    }

    ctx.sources.insert(response, resolved.step.id.as_deref());

    let tagged: Vec<Item> = items
        .into_iter()
        .map(|payload| Item::tagged(payload, index, resolved.key.as_deref()))
        .collect();

    let kept: Vec<Item> = if resolved.force {
        tagged
    } else {
        tagged
            .into_iter()
            .filter(|item| {
                item.unique_key
                    .as_deref()
                    .map(|key| !ctx.internal_state.contains(key))
                    .unwrap_or(true)
            })
            .collect()
    };

    tracing::debug!(source = index, items = kept.len(), "Source contributed items");
    Ok(kept)
}

/// Extract the item list from a source's raw result.
///
/// A missing result, a missing path, or a non-iterable target all
/// contribute zero items without failing the stage.
pub(crate) fn extract_items(result: Option<&ValueRef>, items_path: Option<&str>) -> Vec<ValueRef> {
    let Some(result) = result else {
        return Vec::new();
    };

    let target = match items_path {
        Some(path) => match result.path(path) {
            Some(target) => target,
            None => return Vec::new(),
        },
        None => result.clone(),
    };

    match target.as_ref() {
        serde_json::Value::Array(values) => {
            values.iter().cloned().map(ValueRef::new).collect()
        }
        serde_json::Value::Null => Vec::new(),
        other => vec![ValueRef::new(other.clone())],
    }
}

/// Apply at most one of `limit` / `filter_from` / `filter_items_from`,
/// in that precedence order.
async fn apply_survivor_policy(
    ctx: &mut ExecutionContext,
    resolved: &ResolvedSource,
    mut items: Vec<ValueRef>,
    executors: &Executors,
) -> std::result::Result<Vec<ValueRef>, String> {
    if let Some(limit) = resolved.step.limit {
        items.truncate(limit);
        return Ok(items);
    }

    if let Some(name) = &resolved.filter_from {
        let mask = call_items_executor(ctx, name, &items, executors).await?;
        let serde_json::Value::Array(mask) = mask.as_ref() else {
            return Err(format!("filterFrom '{name}' did not return an array"));
        };
        if mask.len() != items.len() {
            return Err(format!(
                "filterFrom '{name}' returned {} entries for {} items",
                mask.len(),
                items.len()
            ));
        }
        let survivors = items
            .into_iter()
            .zip(mask.iter())
            .filter(|(_, keep)| ValueRef::new((*keep).clone()).is_truthy())
            .map(|(item, _)| item)
            .collect();
        return Ok(survivors);
    }

    if let Some(name) = &resolved.filter_items_from {
        let replacement = call_items_executor(ctx, name, &items, executors).await?;
        let serde_json::Value::Array(values) = replacement.as_ref() else {
            return Err(format!("filterItemsFrom '{name}' did not return an array"));
        };
        return Ok(values.iter().cloned().map(ValueRef::new).collect());
    }

    Ok(items)
}

/// Invoke a helper executor with the source's candidate items in view.
async fn call_items_executor(
    ctx: &ExecutionContext,
    name: &str,
    items: &[ValueRef],
    executors: &Executors,
) -> std::result::Result<ValueRef, String> {
    let executor = executors.get(name).map_err(|e| e.to_string())?;

    let items_json: Vec<serde_json::Value> =
        items.iter().map(|v| v.as_ref().clone()).collect();
    let mut view = ctx.stage_view();
    view.items = items_json.clone();

    let spec = InvocationSpec {
        name: name.to_string(),
        args: ValueRef::new(serde_json::Value::Array(items_json)),
        ..Default::default()
    };
    executor
        .execute(&spec, &view)
        .await
        .map_err(|e| e.to_string())
}

pub(crate) async fn maybe_sleep(seconds: Option<f64>) {
    if let Some(seconds) = seconds {
        if seconds > 0.0 {
            tokio::time::sleep(std::time::Duration::from_secs_f64(seconds)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rillflow_mock::{MockBehavior, MockExecutor};
    use rillflow_state::InMemoryStateStore;
    use serde_json::json;
    use std::sync::Arc;

    fn setup(mock: &MockExecutor) -> (ExecutionContext, Executors) {
        let ctx = ExecutionContext::new(Arc::new(InMemoryStateStore::new()));
        let mut executors = Executors::new();
        executors.register("mock", Arc::new(mock.clone())).unwrap();
        (ctx, executors)
    }

    fn workflow(yaml: &str) -> Workflow {
        Workflow::from_yaml_str(yaml).unwrap()
    }

    #[test]
    fn extraction_handles_paths_arrays_and_scalars() {
        let result = ValueRef::new(json!({"feed": {"entries": [{"a": 1}, {"a": 2}]}}));
        let items = extract_items(Some(&result), Some("feed.entries"));
        assert_eq!(items.len(), 2);

        // Missing path contributes zero items without failing.
        assert!(extract_items(Some(&result), Some("feed.nope")).is_empty());

        // A bare array is taken as-is; a scalar becomes one item.
        let array = ValueRef::new(json!([1, 2, 3]));
        assert_eq!(extract_items(Some(&array), None).len(), 3);
        let scalar = ValueRef::new(json!({"one": true}));
        assert_eq!(extract_items(Some(&scalar), None).len(), 1);

        assert!(extract_items(None, None).is_empty());
        assert!(extract_items(Some(&ValueRef::null()), None).is_empty());
    }

    #[tokio::test]
    async fn aggregation_preserves_source_order() {
        let mock = MockExecutor::new();
        mock.behavior("mock", MockBehavior::result(json!([{"a": 1}])))
            .behavior("mock", MockBehavior::result(json!([{"a": 2}, {"a": 3}])));
        let (mut ctx, executors) = setup(&mock);

        let wf = workflow("sources:\n  - use: mock\n  - use: mock\n");
        run_sources(&mut ctx, &wf, &executors).await.unwrap();

        let payloads: Vec<_> = ctx.items.iter().map(|i| i.payload.as_ref().clone()).collect();
        assert_eq!(payloads, vec![json!({"a": 1}), json!({"a": 2}), json!({"a": 3})]);
        assert_eq!(ctx.items[0].source_index, Some(0));
        assert_eq!(ctx.items[1].source_index, Some(1));
        assert_eq!(ctx.items[2].source_index, Some(1));
        assert_eq!(ctx.sources.len(), 2);
    }

    #[tokio::test]
    async fn reverse_applies_before_limit() {
        let mock = MockExecutor::new();
        mock.behavior("mock", MockBehavior::result(json!([1, 2, 3, 4])));
        let (mut ctx, executors) = setup(&mock);

        let wf = workflow("sources:\n  - use: mock\n    reverse: true\n    limit: 2\n");
        run_sources(&mut ctx, &wf, &executors).await.unwrap();

        let payloads: Vec<_> = ctx.items.iter().map(|i| i.payload.as_ref().clone()).collect();
        // Reversed first, then truncated: [4,3], not [2,1].
        assert_eq!(payloads, vec![json!(4), json!(3)]);
    }

    #[tokio::test]
    async fn seen_keys_are_filtered_unless_forced() {
        let mock = MockExecutor::new();
        mock.behavior(
            "mock",
            MockBehavior::result(json!([{"id": "old"}, {"id": "new"}])),
        );
        let (mut ctx, executors) = setup(&mock);
        ctx.internal_state.remember("old");

        let wf = workflow("sources:\n  - use: mock\n    key: id\n");
        run_sources(&mut ctx, &wf, &executors).await.unwrap();
        assert_eq!(ctx.items.len(), 1);
        assert_eq!(ctx.items[0].unique_key.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn forced_sources_keep_seen_items() {
        let mock = MockExecutor::new();
        mock.behavior(
            "mock",
            MockBehavior::result(json!([{"id": "old"}, {"id": "new"}])),
        );
        let (mut ctx, executors) = setup(&mock);
        ctx.internal_state.remember("old");

        let wf = workflow("sources:\n  - use: mock\n    key: id\n    force: true\n");
        run_sources(&mut ctx, &wf, &executors).await.unwrap();
        assert_eq!(ctx.items.len(), 2);
    }

    #[tokio::test]
    async fn filter_from_mask_selects_survivors() {
        let mock = MockExecutor::new();
        mock.behavior("mock", MockBehavior::result(json!([10, 20, 30])));
        mock.behavior("pick", MockBehavior::result(json!([true, false, true])));
        let (mut ctx, mut executors) = setup(&mock);
        executors.register("pick", Arc::new(mock.clone())).unwrap();

        let wf = workflow("sources:\n  - use: mock\n    filterFrom: pick\n");
        run_sources(&mut ctx, &wf, &executors).await.unwrap();

        let payloads: Vec<_> = ctx.items.iter().map(|i| i.payload.as_ref().clone()).collect();
        assert_eq!(payloads, vec![json!(10), json!(30)]);
    }

    #[tokio::test]
    async fn bad_mask_length_fails_the_source() {
        let mock = MockExecutor::new();
        mock.behavior("mock", MockBehavior::result(json!([10, 20])));
        mock.behavior("pick", MockBehavior::result(json!([true])));
        let (mut ctx, mut executors) = setup(&mock);
        executors.register("pick", Arc::new(mock.clone())).unwrap();

        let wf = workflow("sources:\n  - use: mock\n    filterFrom: pick\n");
        let err = run_sources(&mut ctx, &wf, &executors).await.unwrap_err();
        assert!(matches!(err.current_context(), ExecutionError::Source(0)));
    }

    #[tokio::test]
    async fn failing_source_aborts_unless_continue_on_error() {
        let mock = MockExecutor::new();
        mock.behavior("mock", MockBehavior::error("boom"))
            .behavior("mock", MockBehavior::result(json!([1])));
        let (mut ctx, executors) = setup(&mock);

        let wf = workflow("sources:\n  - use: mock\n  - use: mock\n");
        assert!(run_sources(&mut ctx, &wf, &executors).await.is_err());
    }

    #[tokio::test]
    async fn recovered_source_failure_stops_remaining_sources() {
        let mock = MockExecutor::new();
        mock.behavior("mock", MockBehavior::error("boom"))
            .behavior("mock", MockBehavior::result(json!([1])));
        let (mut ctx, executors) = setup(&mock);

        let wf = workflow(
            "sources:\n  - use: mock\n    continueOnError: true\n  - use: mock\n",
        );
        run_sources(&mut ctx, &wf, &executors).await.unwrap();

        // The second source never ran; the workflow carries on empty.
        assert!(ctx.items.is_empty());
        assert_eq!(mock.call_count("mock"), 1);
        assert!(!ctx.sources.by_index(0).unwrap().ok);
    }

    #[tokio::test]
    async fn disabled_source_is_a_full_no_op() {
        let mock = MockExecutor::new();
        let (mut ctx, executors) = setup(&mock);

        // Neither the executor, the failing cmd, nor the unregistered
        // filterFrom helper may run.
        let wf = workflow(
            "sources:\n  - use: mock\n    if: false\n    cmd: \"exit 2\"\n    filterFrom: pick\n",
        );
        run_sources(&mut ctx, &wf, &executors).await.unwrap();

        assert!(ctx.items.is_empty());
        let response = ctx.sources.by_index(0).unwrap();
        assert!(response.is_real_ok);
        assert!(response.cmd_result.is_none());
        assert_eq!(response.cmd_code, None);
        assert_eq!(mock.call_count("mock"), 0);
    }

    #[tokio::test]
    async fn workflow_limit_caps_the_aggregate() {
        let mock = MockExecutor::new();
        mock.behavior("mock", MockBehavior::result(json!([1, 2])))
            .behavior("mock", MockBehavior::result(json!([3, 4])));
        let (mut ctx, executors) = setup(&mock);
        ctx.options.limit = Some(3);

        let wf = workflow("sources:\n  - use: mock\n  - use: mock\n");
        run_sources(&mut ctx, &wf, &executors).await.unwrap();
        assert_eq!(ctx.items.len(), 3);
    }
}
