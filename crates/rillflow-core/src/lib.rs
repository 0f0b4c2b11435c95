//! Core types for rillflow workflows: definitions, values, items, and
//! stage responses.

mod error;
mod item;
mod response;
mod value;
mod workflow;

pub use error::{ParseError, Result};
pub use item::{Item, SOURCE_INDEX_FIELD, UNIQUE_KEY_FIELD};
pub use response::{StageResponse, STATE_FIELD};
pub use value::ValueRef;
pub use workflow::{SourceSpec, StepSpec, Workflow, WorkflowOptions};
