use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Internal state store error")]
    Internal,

    #[error("Failed to read state file: {}", .0.display())]
    ReadFile(PathBuf),

    #[error("Failed to write state file: {}", .0.display())]
    WriteFile(PathBuf),

    #[error("State document is not valid JSON: {}", .0.display())]
    InvalidDocument(PathBuf),
}

pub type Result<T, E = error_stack::Report<StateError>> = std::result::Result<T, E>;
