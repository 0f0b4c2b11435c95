use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use rillflow_core::ValueRef;

use crate::{ExecutorError, Result, StageContext};

/// The resolved fields identifying and parametrizing one executor call.
#[derive(Debug, Clone, Default)]
pub struct InvocationSpec {
    /// Name of the registered executor (`use`).
    pub name: String,
    /// Module path the executor may load (`from`).
    pub from: Option<String>,
    /// Inline script body (`run`).
    pub run: Option<String>,
    /// Resolved arguments (`args`).
    pub args: ValueRef,
}

/// An opaque step executor.
///
/// The engine only requires a call that may fail and a JSON result; for
/// filter stages the result is additionally expected to be a boolean
/// array matching the item list length, but that contract is enforced by
/// the engine, not here.
pub trait StepExecutor: Send + Sync {
    fn execute<'a>(
        &'a self,
        spec: &'a InvocationSpec,
        ctx: &'a StageContext,
    ) -> BoxFuture<'a, Result<ValueRef>>;
}

/// Registry of step executors, keyed by the `use` name stages refer to.
#[derive(Default, Clone)]
pub struct Executors {
    executors: HashMap<String, Arc<dyn StepExecutor>>,
}

impl Executors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor under `name`. Names are unique.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        executor: Arc<dyn StepExecutor>,
    ) -> Result<()> {
        let name = name.into();
        error_stack::ensure!(
            !self.executors.contains_key(&name),
            ExecutorError::AlreadyRegistered(name)
        );
        self.executors.insert(name, executor);
        Ok(())
    }

    /// Look up the executor registered under `name`.
    pub fn get(&self, name: &str) -> Result<&Arc<dyn StepExecutor>> {
        self.executors
            .get(name)
            .ok_or_else(|| ExecutorError::Unknown(name.to_string()).into())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.executors.keys().map(String::as_str)
    }
}
