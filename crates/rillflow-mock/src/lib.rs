//! A scripted step executor for engine tests.
//!
//! Behaviors are registered per `use` name as a sequence; each invocation
//! consumes the next entry, and the final entry repeats once the script
//! is exhausted. A call log records every invocation for assertions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt as _};
use rillflow_core::ValueRef;
use rillflow_plugin::{ExecutorError, InvocationSpec, Result, StageContext, StepExecutor};

/// A scripted behavior for one invocation.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Return the given value.
    Result(ValueRef),
    /// Fail with the given message.
    Error(String),
}

impl MockBehavior {
    pub fn result(value: impl Into<ValueRef>) -> Self {
        Self::Result(value.into())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }
}

/// One recorded invocation.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub name: String,
    pub args: ValueRef,
    pub item_index: Option<usize>,
}

#[derive(Default)]
struct MockState {
    scripts: HashMap<String, Vec<MockBehavior>>,
    cursors: HashMap<String, usize>,
    calls: Vec<MockCall>,
}

/// A step executor whose responses are scripted per `use` name.
#[derive(Default, Clone)]
pub struct MockExecutor {
    state: Arc<Mutex<MockState>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a behavior to the script for `name`.
    pub fn behavior(&self, name: impl Into<String>, behavior: MockBehavior) -> &Self {
        self.state
            .lock()
            .unwrap()
            .scripts
            .entry(name.into())
            .or_default()
            .push(behavior);
        self
    }

    /// All invocations recorded so far.
    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Number of invocations recorded for `name`.
    pub fn call_count(&self, name: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|call| call.name == name)
            .count()
    }

    fn next_behavior(&self, spec: &InvocationSpec, ctx: &StageContext) -> Option<MockBehavior> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(MockCall {
            name: spec.name.clone(),
            args: spec.args.clone(),
            item_index: ctx.item_index,
        });

        let script = state.scripts.get(&spec.name)?.clone();
        if script.is_empty() {
            return None;
        }
        let cursor = state.cursors.entry(spec.name.clone()).or_insert(0);
        let behavior = script.get(*cursor).or_else(|| script.last())?.clone();
        *cursor += 1;
        Some(behavior)
    }
}

impl StepExecutor for MockExecutor {
    fn execute<'a>(
        &'a self,
        spec: &'a InvocationSpec,
        ctx: &'a StageContext,
    ) -> BoxFuture<'a, Result<ValueRef>> {
        let behavior = self.next_behavior(spec, ctx);
        let name = spec.name.clone();
        async move {
            match behavior {
                Some(MockBehavior::Result(value)) => Ok(value),
                Some(MockBehavior::Error(message)) => Err(error_stack::Report::new(
                    ExecutorError::Execution(name.clone()),
                )
                .attach_printable(message)),
                None => Err(ExecutorError::Unknown(name).into()),
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(name: &str) -> InvocationSpec {
        InvocationSpec {
            name: name.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn scripts_advance_and_last_entry_repeats() {
        let mock = MockExecutor::new();
        mock.behavior("src", MockBehavior::result(json!([1])))
            .behavior("src", MockBehavior::result(json!([2])));

        let ctx = StageContext::default();
        let first = mock.execute(&spec("src"), &ctx).await.unwrap();
        let second = mock.execute(&spec("src"), &ctx).await.unwrap();
        let third = mock.execute(&spec("src"), &ctx).await.unwrap();

        assert_eq!(first.as_ref(), &json!([1]));
        assert_eq!(second.as_ref(), &json!([2]));
        assert_eq!(third.as_ref(), &json!([2]));
        assert_eq!(mock.call_count("src"), 3);
    }

    #[tokio::test]
    async fn unscripted_names_error() {
        let mock = MockExecutor::new();
        assert!(mock
            .execute(&spec("nothing"), &StageContext::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn scripted_errors_surface() {
        let mock = MockExecutor::new();
        mock.behavior("flaky", MockBehavior::error("down"));
        let err = mock
            .execute(&spec("flaky"), &StageContext::default())
            .await
            .unwrap_err();
        assert!(format!("{err:?}").contains("down"));
    }
}
