use thiserror::Error;

/// A convenience `Result` alias using [`ConductorError`].
pub type ConductorResult<T> = Result<T, ConductorError>;

/// Top-level error type for the Conductor workspace.
///
/// Validation failures are raised at the call site and never enqueue
/// anything. I/O failures are transient: background loops log them and retry
/// on their next tick.
#[derive(Error, Debug)]
pub enum ConductorError {
    /// Unknown agent type, task kind or workflow, or a malformed spec.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A referenced task, batch, template or entry does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A task status change that would move backwards or leave a terminal state.
    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        /// Task whose transition was rejected.
        task_id: String,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// Failure to read or parse configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// The system-level guard around the lock table could not be taken.
    #[error("Lock error: {0}")]
    Lock(String),

    /// A conditional task predicate failed to evaluate.
    #[error("Condition error: {0}")]
    Condition(String),

    /// Orchestration failures that are neither validation nor I/O.
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConductorError {
    /// Whether the failure may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, ConductorError::Io(_) | ConductorError::Lock(_))
    }

    /// Whether the failure was caused by invalid input.
    pub fn is_validation(&self) -> bool {
        matches!(self, ConductorError::Validation(_))
    }
}
