use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("task execution failed: {0}")]
    TaskExecutionFailed(String),

    #[error("context error: {0}")]
    ContextError(String),

    #[error("graph execution exceeded {0} steps")]
    StepLimitExceeded(usize),
}

pub type Result<T> = std::result::Result<T, GraphError>;
