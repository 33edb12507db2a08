use thiserror::Error;

/// Convenience type alias for Results with `OrchestratorError`.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Main error type for the orchestrator core.
///
/// `RateLimited` and `Transport` are the two backend-adapter failure
/// shapes the orchestrator treats differently (cooldown vs plain
/// idle-and-fail); the rest are infrastructure or scope errors.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("backend rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<std::time::Duration>,
    },

    #[error("backend transport error: {message}")]
    Transport { message: String },

    #[error("command exec failed: {command} ({message})")]
    ExecFailure { command: String, message: String },

    #[error("file write failed: {path} ({message})")]
    FileWriteFailure { path: String, message: String },

    #[error("out of scope: {0}")]
    OutOfScope(String),

    #[error("agent error: {message}")]
    Agent { message: String },

    #[error("task error: {task_id} - {message}")]
    Task { task_id: String, message: String },

    #[error("queue is full")]
    QueueFull,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl OrchestratorError {
    /// True for the two backend error kinds the RL scorer treats as
    /// transport/API problems (score 25 rather than 0 on failure).
    pub fn is_transport_like(&self) -> bool {
        matches!(
            self,
            OrchestratorError::RateLimited { .. } | OrchestratorError::Transport { .. }
        )
    }
}
