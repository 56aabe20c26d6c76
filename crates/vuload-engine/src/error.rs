use thiserror::Error;
use vuload_core::CoreError;

/// Errors that end a run before a report can be produced.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration was rejected at startup.
    #[error(transparent)]
    Config(#[from] CoreError),

    /// A background task of the run panicked or was cancelled unexpectedly.
    #[error("task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// Run state machine was driven out of order.
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: crate::orchestrator::RunState,
        to: crate::orchestrator::RunState,
    },

    /// Writing the report failed.
    #[error("report I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("report serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// True when the error comes from user-supplied configuration.
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::Config(err) if err.is_config_error())
    }
}

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
