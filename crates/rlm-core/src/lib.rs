//! RLM Core Library
//!
//! A recursive document query engine: an LLM answers questions about a
//! document corpus by writing Python snippets that inspect it, run in pooled
//! sandbox executors, instead of reading the whole corpus in one prompt.
//!
//! Building blocks, leaves first:
//! - [`boundary`]: per-query random markers around untrusted text
//! - [`verification`]: citation/quote checks and LLM-judged relevance
//! - [`sandbox`]: executor contract, process driver and the executor pool
//! - [`trace`]: append-only per-frame records and their sinks
//! - [`engine`]: the iterate / execute / verify loop

pub mod boundary;
pub mod domain;
pub mod engine;
pub mod llm;
pub mod metrics;
pub mod obs;
pub mod sandbox;
pub mod telemetry;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod trace;
pub mod verification;

pub use boundary::{unwrap_last, wrap, Boundary, BOUNDARY_PREFIX};
pub use domain::{
    CancelSignal, Document, FailureKind, Query, QueryError, QueryResult, QueryStatus, TokenUsage,
    INTERRUPTED_ANSWER, NO_ANSWER,
};
pub use engine::{EngineConfig, QueryEngine, VerificationPolicy};
pub use llm::{ChatMessage, Completion, LlmTransport, Role, TransportError};
pub use sandbox::{
    ExecutionOutcome, ExecutionStatus, Executor, ExecutorFactory, ExecutorLease, ExecutorPool,
    PoolConfig, PoolError, ProcessExecutorConfig, ProcessExecutorFactory, RuntimeMode,
    SandboxError, SecurityConfig,
};
pub use trace::{
    JsonlTraceSink, MemoryTraceSink, NullTraceSink, StepKind, Trace, TraceSink, TraceStep,
};
pub use telemetry::init_tracing;
pub use verification::{
    detect_content_type, extract_citations, extract_quotes, verify_answer, ContentType,
    SemanticVerificationReport, VerificationReport,
};

/// Crate version, recorded by front-ends.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
