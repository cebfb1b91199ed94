//! Query-level error taxonomy.
//!
//! Only failures that end a query live here. Snippet faults are ordinary
//! execution output, verification problems are annotations, and
//! cancellation is a normal terminal state.

use serde::{Deserialize, Serialize};

use crate::llm::TransportError;
use crate::sandbox::{PoolError, SandboxError};

/// Machine-readable class of a failed query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InvalidQuery,
    Transport,
    PoolExhausted,
    ExecutorUnavailable,
    Internal,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::InvalidQuery => write!(f, "invalid_query"),
            FailureKind::Transport => write!(f, "transport"),
            FailureKind::PoolExhausted => write!(f, "pool_exhausted"),
            FailureKind::ExecutorUnavailable => write!(f, "executor_unavailable"),
            FailureKind::Internal => write!(f, "internal"),
        }
    }
}

/// Errors that terminate a query in the `Error` state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("llm transport failed: {0}")]
    Transport(#[from] TransportError),

    #[error("no executor became available within {timeout_ms}ms")]
    PoolExhausted { timeout_ms: u64 },

    #[error("executor unavailable: {0}")]
    ExecutorUnavailable(String),

    #[error("internal engine error: {0}")]
    Internal(String),
}

impl QueryError {
    pub fn kind(&self) -> FailureKind {
        match self {
            QueryError::InvalidQuery(_) => FailureKind::InvalidQuery,
            QueryError::Transport(_) => FailureKind::Transport,
            QueryError::PoolExhausted { .. } => FailureKind::PoolExhausted,
            QueryError::ExecutorUnavailable(_) => FailureKind::ExecutorUnavailable,
            QueryError::Internal(_) => FailureKind::Internal,
        }
    }
}

impl From<PoolError> for QueryError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Exhausted { timeout_ms } => QueryError::PoolExhausted { timeout_ms },
            PoolError::ExecutorUnavailable(reason) => QueryError::ExecutorUnavailable(reason),
            PoolError::Closed => QueryError::ExecutorUnavailable("executor pool is closed".into()),
        }
    }
}

impl From<SandboxError> for QueryError {
    fn from(err: SandboxError) -> Self {
        QueryError::ExecutorUnavailable(err.to_string())
    }
}
