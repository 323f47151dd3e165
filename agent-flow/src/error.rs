use thiserror::Error;

/// Errors raised while running a task pipeline.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Task execution failed: {0}")]
    TaskExecutionFailed(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Context error: {0}")]
    ContextError(String),

    #[error("Graph has no start task: {0}")]
    NoStartTask(String),

    #[error("Step limit of {0} exceeded")]
    StepLimitExceeded(usize),
}

pub type Result<T> = std::result::Result<T, GraphError>;
