//! The terminal artifact of one query.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::llm::Completion;
use crate::trace::Trace;
use crate::verification::{SemanticVerificationReport, VerificationReport};

use super::error::{FailureKind, QueryError};

/// Answer text returned when cancellation fired before any usable answer.
pub const INTERRUPTED_ANSWER: &str = "[interrupted]";

/// Partial answer used when the iteration limit hit without any output.
pub const NO_ANSWER: &str = "[no answer]";

/// How a query ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum QueryStatus {
    /// A final answer was produced and verified.
    Completed,
    /// The iteration limit was reached; the answer is partial.
    Truncated,
    /// The cancel signal was observed.
    Interrupted,
    /// Verification policy refused the answer.
    Rejected { reason: String },
    /// A terminal error; the answer is empty.
    Failed { kind: FailureKind, message: String },
}

impl QueryStatus {
    pub fn failed(err: &QueryError) -> Self {
        QueryStatus::Failed {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            QueryStatus::Completed => "completed",
            QueryStatus::Truncated => "truncated",
            QueryStatus::Interrupted => "interrupted",
            QueryStatus::Rejected { .. } => "rejected",
            QueryStatus::Failed { .. } => "failed",
        }
    }
}

/// Token accounting across every LLM call of a query, sub-queries included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub llm_calls: u64,
}

impl TokenUsage {
    pub fn add(&mut self, completion: &Completion) {
        self.prompt_tokens += completion.prompt_tokens;
        self.completion_tokens += completion.completion_tokens;
        self.llm_calls += 1;
    }

    pub fn merge(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.llm_calls += other.llm_calls;
    }

    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Everything a caller gets back from `query()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub answer: String,
    pub status: QueryStatus,
    pub token_usage: TokenUsage,
    pub execution_time_ms: u64,
    pub trace: Trace,
    pub verification: Option<VerificationReport>,
    pub semantic_verification: Option<SemanticVerificationReport>,
}

impl QueryResult {
    pub fn execution_time(&self) -> Duration {
        Duration::from_millis(self.execution_time_ms)
    }

    pub fn is_completed(&self) -> bool {
        self.status == QueryStatus::Completed
    }

    pub fn is_interrupted(&self) -> bool {
        self.status == QueryStatus::Interrupted
    }

    /// The failure class, when the query ended in error.
    pub fn failure(&self) -> Option<FailureKind> {
        match &self.status {
            QueryStatus::Failed { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}
