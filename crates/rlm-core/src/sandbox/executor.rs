//! The executor contract: run one snippet, report status and captured output.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::Document;

use super::error::SandboxResult;
use super::security::SecurityConfig;

/// Line prefix the model writes in a prose reply to end the loop.
///
/// Snippet output is never scanned for it: a snippet ends the loop only by
/// calling `FINAL(answer)`, which the runtime reports out of band.
pub const FINAL_ANSWER_SENTINEL: &str = "FINAL_ANSWER:";

/// How a snippet execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Ok,
    Error,
    Timeout,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Ok => write!(f, "ok"),
            ExecutionStatus::Error => write!(f, "error"),
            ExecutionStatus::Timeout => write!(f, "timeout"),
        }
    }
}

/// Result of one [`Executor::execute`] call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    /// Combined stdout/stderr, bounded by the executor's output limit.
    pub output: String,
    /// Present when a successful snippet called `FINAL(answer)`.
    pub final_answer: Option<String>,
}

impl ExecutionOutcome {
    /// Successful run without a final answer, whatever the output says.
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Ok,
            output: output.into(),
            final_answer: None,
        }
    }

    /// Successful run whose snippet called `FINAL(answer)`. A blank answer
    /// counts as absent.
    pub fn finished(output: impl Into<String>, answer: &str) -> Self {
        let answer = answer.trim();
        Self {
            status: ExecutionStatus::Ok,
            output: output.into(),
            final_answer: (!answer.is_empty()).then(|| answer.to_string()),
        }
    }

    pub fn error(output: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Error,
            output: output.into(),
            final_answer: None,
        }
    }

    pub fn timeout(output: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Timeout,
            output: output.into(),
            final_answer: None,
        }
    }
}

/// Find the first line starting with [`FINAL_ANSWER_SENTINEL`] and return
/// everything after the sentinel, trimmed. Blank answers count as absent.
pub fn extract_final_answer(output: &str) -> Option<String> {
    let mut offset = 0;
    for line in output.split_inclusive('\n') {
        let trimmed = line.trim_start();
        if trimmed.starts_with(FINAL_ANSWER_SENTINEL) {
            let lead = line.len() - trimmed.len();
            let start = offset + lead + FINAL_ANSWER_SENTINEL.len();
            let answer = output[start..].trim();
            return (!answer.is_empty()).then(|| answer.to_string());
        }
        offset += line.len();
    }
    None
}

/// Cap `text` at `max_bytes` (on a char boundary) and note what was dropped.
pub fn truncate_output(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut cut = max_bytes;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!(
        "{}\n... [output truncated: {} bytes omitted]",
        &text[..cut],
        text.len() - cut
    )
}

/// A sub-query issued from inside a running snippet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubcallRequest {
    pub question: String,
    pub context: String,
}

/// Answers sub-queries on behalf of a running snippet.
#[async_trait]
pub trait SubcallHandler: Send + Sync {
    /// Return the text handed back to the snippet. Must not fail; errors are
    /// rendered into the returned text.
    async fn handle(&self, request: SubcallRequest) -> String;
}

/// Handler for contexts where sub-queries are not wired up.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSubcalls;

#[async_trait]
impl SubcallHandler for NoSubcalls {
    async fn handle(&self, _request: SubcallRequest) -> String {
        "[sub-queries are not available here]".to_string()
    }
}

/// One isolated, stateful runtime instance.
///
/// Variables persist across `execute` calls until `reset`.
#[async_trait]
pub trait Executor: Send {
    /// Expose the query's documents to subsequent snippets.
    async fn load_documents(&mut self, documents: &[Document]) -> SandboxResult<()>;

    /// Run one snippet. Never fails across the call boundary.
    async fn execute(&mut self, code: &str, subcalls: &dyn SubcallHandler) -> ExecutionOutcome;

    /// Discard all interpreter state so the handle can serve an unrelated query.
    async fn reset(&mut self) -> SandboxResult<()>;

    /// Whether the underlying runtime can still accept work.
    fn is_alive(&self) -> bool;
}

/// Constructs executors for the pool.
#[async_trait]
pub trait ExecutorFactory: Send + Sync {
    async fn create(&self, security: &SecurityConfig) -> SandboxResult<Box<dyn Executor>>;
}
