use thiserror::Error;

/// Error type for the concord-notify crate.
///
/// None of these reach the policy engine as a failed operation; the engine
/// logs them and carries on.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NotifyError {
    #[error("dispatcher is shut down")]
    ShutDown,

    #[error("failed to spawn mailbox worker: {0}")]
    WorkerSpawnFailed(String),

    #[error("sink failed: {0}")]
    SinkFailed(String),

    #[error("listener panicked: {0}")]
    ListenerPanicked(String),

    #[error("configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type alias for concord-notify operations.
pub type NotifyResult<T> = Result<T, NotifyError>;
