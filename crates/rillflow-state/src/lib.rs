//! Persisted state stores for rillflow workflows.
//!
//! A store holds the per-workflow `state` and `internal_state` documents
//! under an explicit namespace chosen by the caller. Only the `get`/`set`
//! contract matters to the engine; the backing medium is an
//! implementation detail.

mod error;
mod file;
mod in_memory;
mod state_store;

pub use error::{Result, StateError};
pub use file::FileStateStore;
pub use in_memory::InMemoryStateStore;
pub use state_store::{StateStore, INTERNAL_STATE_KEY, STATE_KEY};
