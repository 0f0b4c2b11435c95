use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Failed to read workflow file: {}", .0.display())]
    ReadFile(PathBuf),
    #[error("Invalid workflow document")]
    InvalidDocument,
    #[error("Unrecognized workflow file extension: {}", .0.display())]
    UnrecognizedExtension(PathBuf),
}

pub type Result<T, E = error_stack::Report<ParseError>> = std::result::Result<T, E>;
