//! The executor seam of rillflow.
//!
//! The engine treats a stage's actual work as an opaque call: it hands a
//! registered [`StepExecutor`] the resolved invocation fields and a
//! snapshot of the public execution context, and gets back a JSON value
//! or an error. Everything else (what the executor loads, runs, or
//! fetches) is outside the engine's concern.

mod context;
mod error;
mod executor;

pub use context::StageContext;
pub use error::{ExecutorError, Result};
pub use executor::{Executors, InvocationSpec, StepExecutor};
