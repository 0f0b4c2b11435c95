use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("source {0} failed")]
    Source(usize),

    #[error("filter stage failed")]
    Filter,

    #[error("filter result must be a boolean array of length {expected}")]
    FilterMask { expected: usize },

    #[error("step {step} failed for item {item}")]
    Step { step: usize, item: usize },

    #[error("post stage failed")]
    Post,

    #[error("failed to open state store for namespace '{0}'")]
    StoreOpen(String),

    #[error("failed to load persisted state")]
    StateLoad,

    #[error("failed to persist state")]
    StatePersist,

    #[error("failed to parse workflow: {}", .0.display())]
    Parse(PathBuf),

    #[error("failed to discover workflows under {}", .0.display())]
    Discover(PathBuf),
}

pub type Result<T, E = error_stack::Report<ExecutionError>> = std::result::Result<T, E>;
