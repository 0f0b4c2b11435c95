//! Layered stage-configuration resolution.
//!
//! Raw specs stay JSON until they are needed; each field group is
//! re-evaluated against the context at the moment it is resolved, so an
//! earlier group (notably `env`) can change what a later group sees.
//! Groups resolve in a fixed order:
//!
//! 1. `[env]`
//! 2. `[if, debug]`
//! 3. `[id, from, use, args]`
//! 4. stage-specific: source `[force, items_path, key]`, `[reverse]`,
//!    `[limit, filter_from, filter_items_from]`, `[cmd]`;
//!    filter/step/post `[cmd]`, `[limit]`, `[sleep]`.

use indexmap::IndexMap;
use rillflow_core::{SourceSpec, StepSpec, ValueRef, WorkflowOptions};

use crate::context::ExecutionContext;

/// Typed, fully resolved workflow-level options.
#[derive(Debug, Clone)]
pub struct ResolvedWorkflowOptions {
    /// Run the workflow at all.
    pub if_: bool,
    /// Raise log verbosity for this workflow.
    pub debug: bool,
    /// Store namespace override.
    pub database: Option<String>,
    /// Default seconds to pause after each stage.
    pub sleep: Option<f64>,
    /// Cap on the aggregated item list.
    pub limit: Option<usize>,
    /// Bypass dedup for every source.
    pub force: bool,
}

impl Default for ResolvedWorkflowOptions {
    fn default() -> Self {
        Self {
            if_: true,
            debug: false,
            database: None,
            sleep: None,
            limit: None,
            force: false,
        }
    }
}

/// Typed, fully resolved fields of one stage invocation.
#[derive(Debug, Clone)]
pub struct ResolvedStep {
    pub id: Option<String>,
    pub from: Option<String>,
    pub use_: Option<String>,
    pub run: Option<String>,
    pub args: ValueRef,
    pub if_: bool,
    pub debug: bool,
    pub cmd: Option<String>,
    pub limit: Option<usize>,
    pub sleep: Option<f64>,
    pub continue_on_error: bool,
    pub assert: Option<StepSpec>,
    pub post: Option<StepSpec>,
    /// Whether the spec requested execution (`use`/`run` present).
    pub wants_execution: bool,
}

// A stage is enabled unless its `if` resolves false, so the default
// mirrors an absent `if`.
impl Default for ResolvedStep {
    fn default() -> Self {
        Self {
            id: None,
            from: None,
            use_: None,
            run: None,
            args: ValueRef::default(),
            if_: true,
            debug: false,
            cmd: None,
            limit: None,
            sleep: None,
            continue_on_error: false,
            assert: None,
            post: None,
            wants_execution: false,
        }
    }
}

impl ResolvedStep {
    /// The registry name this stage invokes: `use` when present, the
    /// generic script runner when only `run` is set.
    pub fn executor_name(&self) -> Option<String> {
        match (&self.use_, &self.run) {
            (Some(name), _) => Some(name.clone()),
            (None, Some(_)) => Some("run".to_string()),
            (None, None) => None,
        }
    }
}

/// A resolved source: step fields plus the item-extraction fields.
#[derive(Debug, Clone, Default)]
pub struct ResolvedSource {
    pub step: ResolvedStep,
    pub force: bool,
    pub items_path: Option<String>,
    pub key: Option<String>,
    pub reverse: bool,
    pub filter_from: Option<String>,
    pub filter_items_from: Option<String>,
}

/// Resolve the workflow root options. The env group lands in the context
/// env map first, so every later group (here and in the stages) observes
/// it.
pub(crate) fn resolve_workflow_options(
    options: &WorkflowOptions,
    ctx: &mut ExecutionContext,
) -> ResolvedWorkflowOptions {
    resolve_env_group(options.env.as_ref(), ctx);

    let if_ = opt_bool(options.if_.as_ref(), &ctx.env).unwrap_or(true);
    let debug = opt_bool(options.debug.as_ref(), &ctx.env).unwrap_or(false);

    ResolvedWorkflowOptions {
        if_,
        debug,
        database: opt_string(options.database.as_ref(), &ctx.env),
        sleep: opt_f64(options.sleep.as_ref(), &ctx.env),
        limit: opt_usize(options.limit.as_ref(), &ctx.env),
        force: opt_bool(options.force.as_ref(), &ctx.env).unwrap_or(false),
    }
}

/// Resolve a filter/step/post spec against the current context.
pub(crate) fn resolve_step(spec: &StepSpec, ctx: &mut ExecutionContext) -> ResolvedStep {
    resolve_env_group(spec.env.as_ref(), ctx);
    let (if_, debug) = resolve_condition_group(spec, ctx);
    let (id, from, use_, run, args) = resolve_identity_group(spec, ctx);

    // Stage-specific groups, in documented order.
    let cmd = opt_string(spec.cmd.as_ref(), &ctx.env);
    let limit = opt_usize(spec.limit.as_ref(), &ctx.env);
    let sleep = opt_f64(spec.sleep.as_ref(), &ctx.env);

    ResolvedStep {
        id,
        from,
        use_,
        run,
        args,
        if_,
        debug,
        cmd,
        limit,
        sleep,
        continue_on_error: opt_bool(spec.continue_on_error.as_ref(), &ctx.env).unwrap_or(false),
        assert: spec.assert.as_deref().cloned(),
        post: spec.post.as_deref().cloned(),
        wants_execution: spec.wants_execution(),
    }
}

/// Resolve a source spec. `reverse` resolves before the
/// `limit`/`filter_from` group; the item pipeline applies them in the
/// same order.
pub(crate) fn resolve_source(spec: &SourceSpec, ctx: &mut ExecutionContext) -> ResolvedSource {
    resolve_env_group(spec.step.env.as_ref(), ctx);
    let (if_, debug) = resolve_condition_group(&spec.step, ctx);
    let (id, from, use_, run, args) = resolve_identity_group(&spec.step, ctx);

    let force =
        opt_bool(spec.force.as_ref(), &ctx.env).unwrap_or(false) || ctx.options.force;
    let items_path = opt_string(spec.items_path.as_ref(), &ctx.env);
    let key = opt_string(spec.key.as_ref(), &ctx.env);

    let reverse = opt_bool(spec.reverse.as_ref(), &ctx.env).unwrap_or(false);

    let limit = opt_usize(spec.step.limit.as_ref(), &ctx.env);
    let filter_from = opt_string(spec.filter_from.as_ref(), &ctx.env);
    let filter_items_from = opt_string(spec.filter_items_from.as_ref(), &ctx.env);

    let cmd = opt_string(spec.step.cmd.as_ref(), &ctx.env);

    ResolvedSource {
        step: ResolvedStep {
            id,
            from,
            use_,
            run,
            args,
            if_,
            debug,
            cmd,
            limit,
            sleep: opt_f64(spec.step.sleep.as_ref(), &ctx.env),
            continue_on_error: opt_bool(spec.step.continue_on_error.as_ref(), &ctx.env)
                .unwrap_or(false),
            assert: spec.step.assert.as_deref().cloned(),
            post: spec.step.post.as_deref().cloned(),
            wants_execution: spec.step.wants_execution(),
        },
        force,
        items_path,
        key,
        reverse,
        filter_from,
        filter_items_from,
    }
}

/// Resolve the `[env]` group: entries substitute against the env map as
/// it stands, in declaration order, then land in the map, so later
/// entries (and later stages) observe earlier ones.
fn resolve_env_group(env: Option<&IndexMap<String, serde_json::Value>>, ctx: &mut ExecutionContext) {
    let Some(env) = env else { return };
    for (name, raw) in env {
        let value = match substitute(raw, &ctx.env) {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        ctx.env.insert(name.clone(), value);
    }
}

fn resolve_condition_group(spec: &StepSpec, ctx: &ExecutionContext) -> (bool, bool) {
    let if_ = opt_bool(spec.if_.as_ref(), &ctx.env).unwrap_or(true);
    let debug = opt_bool(spec.debug.as_ref(), &ctx.env).unwrap_or(false) || ctx.options.debug;
    (if_, debug)
}

type IdentityFields = (
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    ValueRef,
);

fn resolve_identity_group(spec: &StepSpec, ctx: &ExecutionContext) -> IdentityFields {
    let id = opt_string(spec.id.as_ref(), &ctx.env);
    let from = opt_string(spec.from.as_ref(), &ctx.env);
    let use_ = opt_string(spec.use_.as_ref(), &ctx.env);
    let run = opt_string(spec.run.as_ref(), &ctx.env);
    let args = spec
        .args
        .as_ref()
        .map(|raw| ValueRef::new(substitute(raw, &ctx.env)))
        .unwrap_or_default();
    (id, from, use_, run, args)
}

/// Replace `${NAME}` placeholders from the env map, recursively through
/// arrays and objects. Unknown names are left untouched so they stay
/// visible in logs and results.
pub(crate) fn substitute(
    value: &serde_json::Value,
    env: &IndexMap<String, String>,
) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => serde_json::Value::String(substitute_str(s, env)),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(|v| substitute(v, env)).collect())
        }
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, env)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn substitute_str(input: &str, env: &IndexMap<String, String>) -> String {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match env.get(name) {
                    Some(value) => output.push_str(value),
                    None => {
                        output.push_str("${");
                        output.push_str(name);
                        output.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                output.push_str("${");
                rest = after;
            }
        }
    }
    output.push_str(rest);
    output
}

fn opt_string(
    value: Option<&serde_json::Value>,
    env: &IndexMap<String, String>,
) -> Option<String> {
    match substitute(value?, env) {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn opt_bool(value: Option<&serde_json::Value>, env: &IndexMap<String, String>) -> Option<bool> {
    match substitute(value?, env) {
        serde_json::Value::Bool(b) => Some(b),
        serde_json::Value::String(s) => match s.as_str() {
            "true" => Some(true),
            "false" => Some(false),
            other => Some(!other.is_empty()),
        },
        serde_json::Value::Null => None,
        other => Some(ValueRef::new(other).is_truthy()),
    }
}

fn opt_usize(value: Option<&serde_json::Value>, env: &IndexMap<String, String>) -> Option<usize> {
    match substitute(value?, env) {
        serde_json::Value::Number(n) => n.as_u64().map(|n| n as usize),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn opt_f64(value: Option<&serde_json::Value>, env: &IndexMap<String, String>) -> Option<f64> {
    match substitute(value?, env) {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rillflow_core::Workflow;
    use rillflow_state::InMemoryStateStore;
    use serde_json::json;
    use std::sync::Arc;

    fn test_ctx() -> ExecutionContext {
        ExecutionContext::new(Arc::new(InMemoryStateStore::new()))
    }

    #[test]
    fn substitution_handles_embedded_and_unknown_placeholders() {
        let mut env = IndexMap::new();
        env.insert("HOST".to_string(), "example.com".to_string());

        assert_eq!(
            substitute_str("https://${HOST}/feed?x=${MISSING}", &env),
            "https://example.com/feed?x=${MISSING}"
        );
        assert_eq!(substitute_str("no placeholders", &env), "no placeholders");
        assert_eq!(substitute_str("dangling ${", &env), "dangling ${");
    }

    #[test]
    fn env_group_resolves_before_later_groups() {
        let workflow = Workflow::from_yaml_str(
            r#"
env:
  BASE: "https://example.com"
  FEED: "${BASE}/rss"
sources:
  - use: rss
    args:
      url: "${FEED}"
"#,
        )
        .unwrap();

        let mut ctx = test_ctx();
        ctx.options = resolve_workflow_options(&workflow.options, &mut ctx);
        assert_eq!(ctx.env["FEED"], "https://example.com/rss");

        let source = resolve_source(&workflow.sources[0], &mut ctx);
        assert_eq!(
            source.step.args.as_ref(),
            &json!({"url": "https://example.com/rss"})
        );
    }

    #[test]
    fn stage_env_updates_are_visible_to_its_own_later_groups() {
        let workflow = Workflow::from_yaml_str(
            r#"
sources:
  - use: fetch
    env:
      TOKEN: "secret"
    args:
      auth: "${TOKEN}"
    key: "id"
"#,
        )
        .unwrap();

        let mut ctx = test_ctx();
        let source = resolve_source(&workflow.sources[0], &mut ctx);
        assert_eq!(source.step.args.as_ref(), &json!({"auth": "secret"}));
        assert_eq!(source.key.as_deref(), Some("id"));
    }

    #[test]
    fn coercions_accept_strings_and_numbers() {
        let env = IndexMap::new();
        assert_eq!(opt_usize(Some(&json!("12")), &env), Some(12));
        assert_eq!(opt_usize(Some(&json!(12)), &env), Some(12));
        assert_eq!(opt_f64(Some(&json!("1.5")), &env), Some(1.5));
        assert_eq!(opt_bool(Some(&json!("false")), &env), Some(false));
        assert_eq!(opt_bool(Some(&json!(0)), &env), Some(false));
        assert_eq!(opt_bool(None, &env), None);
    }

    #[test]
    fn workflow_force_propagates_to_sources() {
        let workflow = Workflow::from_yaml_str(
            r#"
force: true
sources:
  - use: rss
"#,
        )
        .unwrap();

        let mut ctx = test_ctx();
        ctx.options = resolve_workflow_options(&workflow.options, &mut ctx);
        assert!(ctx.options.force);

        let source = resolve_source(&workflow.sources[0], &mut ctx);
        assert!(source.force);
    }

    #[test]
    fn executor_name_falls_back_to_run() {
        let resolved = ResolvedStep {
            run: Some("return items".to_string()),
            wants_execution: true,
            ..Default::default()
        };
        assert_eq!(resolved.executor_name().as_deref(), Some("run"));
        assert!(ResolvedStep::default().executor_name().is_none());
    }
}
