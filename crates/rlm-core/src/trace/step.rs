//! Trace steps: one append-only record per thing that happened.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a trace step records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepKind {
    CodeGenerated,
    CodeOutput,
    SubcallRequest,
    SubcallResponse,
    FinalAnswer,
    Error,
    Verification,
    SemanticVerification,
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepKind::CodeGenerated => "CODE_GENERATED",
            StepKind::CodeOutput => "CODE_OUTPUT",
            StepKind::SubcallRequest => "SUBCALL_REQUEST",
            StepKind::SubcallResponse => "SUBCALL_RESPONSE",
            StepKind::FinalAnswer => "FINAL_ANSWER",
            StepKind::Error => "ERROR",
            StepKind::Verification => "VERIFICATION",
            StepKind::SemanticVerification => "SEMANTIC_VERIFICATION",
        };
        f.write_str(s)
    }
}

/// A single step of a query trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceStep {
    #[serde(rename = "step_type")]
    pub kind: StepKind,
    /// 1-based loop iteration; 0 for steps outside the loop.
    pub iteration: u32,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub duration_ms: u64,
}

impl TraceStep {
    pub fn new(kind: StepKind, iteration: u32, content: impl Into<String>) -> Self {
        Self {
            kind,
            iteration,
            content: content.into(),
            timestamp: Utc::now(),
            prompt_tokens: 0,
            completion_tokens: 0,
            duration_ms: 0,
        }
    }

    pub fn with_tokens(mut self, prompt_tokens: u64, completion_tokens: u64) -> Self {
        self.prompt_tokens = prompt_tokens;
        self.completion_tokens = completion_tokens;
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}
