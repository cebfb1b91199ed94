//! Engine configuration.

use serde::{Deserialize, Serialize};

use crate::verification::DEFAULT_EXCERPT_CHARS;

/// What to do with an answer whose syntactic verification failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationPolicy {
    /// Return the answer unchanged with the reports attached.
    #[default]
    Annotate,
    /// Replace the answer with a `Rejected` status. The original text stays
    /// in the trace.
    RejectInvalid,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid engine config: {0}")]
pub struct ConfigError(pub String);

/// Tunables for [`crate::engine::QueryEngine`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// LLM round-trips per frame before the answer is truncated.
    pub max_iterations: u32,
    /// Wait for a free executor before failing with `PoolExhausted`.
    pub acquire_timeout_ms: u64,
    /// Frames at this depth or deeper answer with a single LLM call.
    pub max_depth: u32,
    /// Characters of each document shown in the first prompt.
    pub preview_chars: usize,
    /// Cap on execution output fed back to the model per iteration.
    pub max_feedback_chars: usize,
    pub verification_policy: VerificationPolicy,
    /// Run the LLM-judged stage after the syntactic one.
    pub semantic_verification: bool,
    pub semantic_excerpt_chars: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            acquire_timeout_ms: 30_000,
            max_depth: 1,
            preview_chars: 500,
            max_feedback_chars: 20_000,
            verification_policy: VerificationPolicy::Annotate,
            semantic_verification: true,
            semantic_excerpt_chars: DEFAULT_EXCERPT_CHARS,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iterations == 0 {
            return Err(ConfigError("max_iterations must be at least 1".into()));
        }
        if self.max_depth == 0 {
            return Err(ConfigError("max_depth must be at least 1".into()));
        }
        if self.max_feedback_chars == 0 {
            return Err(ConfigError("max_feedback_chars must be positive".into()));
        }
        Ok(())
    }
}
