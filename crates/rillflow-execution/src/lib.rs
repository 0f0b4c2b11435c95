//! The rillflow workflow engine.
//!
//! A workflow run proceeds through four stages: sources produce items,
//! an optional filter reduces them, the steps run once per surviving
//! item, and an optional post action closes the run. Item dedup keys and
//! a free-form state document persist across runs through a
//! [`rillflow_state::StateStore`].

mod context;
mod dedup;
mod driver;
mod error;
mod filter;
mod invoker;
mod items;
mod resolver;
mod step_loop;

pub use context::{ExecutionContext, ResponseTable, StageKind};
pub use dedup::{InternalState, MAX_SEEN_KEYS};
pub use driver::{
    Engine, FileStoreProvider, InMemoryStoreProvider, RunSummary, StoreProvider, WorkflowFailure,
    WorkflowOutcome,
};
pub use error::{ExecutionError, Result};
pub use resolver::{ResolvedSource, ResolvedStep, ResolvedWorkflowOptions};
