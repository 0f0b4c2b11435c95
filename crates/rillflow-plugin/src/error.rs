#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("no step executor registered for '{0}'")]
    Unknown(String),
    #[error("step executor '{0}' failed")]
    Execution(String),
    #[error("step executor '{0}' is already registered")]
    AlreadyRegistered(String),
}

pub type Result<T, E = error_stack::Report<ExecutorError>> = std::result::Result<T, E>;
