//! Error types for the sandbox module.

/// Errors produced while constructing, loading or resetting a sandbox runtime.
///
/// Snippet execution itself never fails with this type; faults inside the
/// snippet are reported through [`super::ExecutionStatus`].
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("failed to start sandbox runtime: {0}")]
    Spawn(String),

    #[error("sandbox runtime is not running")]
    Dead,

    #[error("sandbox did not respond within {limit_ms}ms")]
    Timeout { limit_ms: u64 },

    #[error("sandbox protocol error: {0}")]
    Protocol(String),

    #[error("invalid sandbox configuration: {0}")]
    InvalidConfig(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for sandbox operations.
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;

/// Errors produced by the executor pool.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("no executor became available within {timeout_ms}ms")]
    Exhausted { timeout_ms: u64 },

    #[error("executor could not be constructed: {0}")]
    ExecutorUnavailable(String),

    #[error("executor pool is closed")]
    Closed,
}

/// Result type for pool operations.
pub type PoolResult<T> = std::result::Result<T, PoolError>;
