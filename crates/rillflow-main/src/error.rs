#[derive(Debug, thiserror::Error)]
pub enum MainError {
    #[error("Failed to register executor")]
    RegisterExecutor,
    #[error("Workflow run failed")]
    Run,
    #[error("{0} workflow(s) failed")]
    WorkflowsFailed(usize),
}

pub type Result<T, E = error_stack::Report<MainError>> = std::result::Result<T, E>;
