//! Recursive query engine.
//!
//! [`QueryEngine::query`] drives one question over a document set:
//!
//! ```text
//! Init ──► Iterating ──► Verifying ──► Done
//!              │
//!              ├──► Interrupted   (cancel signal observed between iterations)
//!              ├──► Truncated     (iteration limit reached)
//!              └──► Error         (transport, pool, executor, invalid input)
//! ```
//!
//! Each iteration asks the model for a Python snippet, runs it in a leased
//! sandbox executor and feeds the boundary-wrapped output back. Snippets may
//! call `llm_query(...)`, which runs a child frame with its own boundary and
//! trace. Every exit path releases the executor lease and produces a
//! [`QueryResult`]; panics are caught at this boundary and reported as
//! `Internal` failures.

pub mod config;
pub mod parse;
pub mod prompt;

mod frame;
mod subcall;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tracing::error;

use crate::domain::{
    CancelSignal, Document, Query, QueryError, QueryResult, QueryStatus, TokenUsage,
};
use crate::llm::LlmTransport;
use crate::metrics::METRICS;
use crate::sandbox::ExecutorPool;
use crate::trace::{NullTraceSink, StepKind, TraceHeader, TraceRecorder, TraceSink, TraceStep};

pub use config::{ConfigError, EngineConfig, VerificationPolicy};
pub use parse::{parse_response, ModelAction};
pub use subcall::SUBCALL_CONTEXT_ID;

use frame::{run_frame, EngineShared, FrameInput};

/// Entry point for answering questions over documents.
///
/// Cheap to clone; clones share the transport, pool and trace sink.
#[derive(Clone)]
pub struct QueryEngine {
    transport: Arc<dyn LlmTransport>,
    pool: Arc<ExecutorPool>,
    sink: Arc<dyn TraceSink>,
    config: EngineConfig,
}

impl QueryEngine {
    pub fn new(
        transport: Arc<dyn LlmTransport>,
        pool: Arc<ExecutorPool>,
        config: EngineConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            transport,
            pool,
            sink: Arc::new(NullTraceSink),
            config,
        })
    }

    /// Stream trace records of every query (and sub-query) to `sink`.
    pub fn with_trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ExecutorPool> {
        &self.pool
    }

    /// Answer `question` over `documents` with the configured iteration cap.
    pub async fn query(
        &self,
        documents: Vec<Document>,
        question: impl Into<String>,
        cancel: CancelSignal,
    ) -> QueryResult {
        self.run(Query::new(documents, question, cancel), self.config.max_iterations)
            .await
    }

    /// Like [`QueryEngine::query`] with a per-call iteration cap.
    pub async fn query_with_limit(
        &self,
        documents: Vec<Document>,
        question: impl Into<String>,
        cancel: CancelSignal,
        max_iterations: u32,
    ) -> QueryResult {
        self.run(Query::new(documents, question, cancel), max_iterations)
            .await
    }

    /// Run a prepared [`Query`].
    pub async fn run(&self, query: Query, max_iterations: u32) -> QueryResult {
        METRICS.inc_queries();
        let started = Instant::now();
        let question = query.question().to_string();
        let document_ids = query.document_ids();

        if max_iterations == 0 {
            let err = QueryError::InvalidQuery("max_iterations must be at least 1".into());
            return self.failed_result(&question, document_ids, err, started);
        }

        let shared = Arc::new(EngineShared {
            transport: Arc::clone(&self.transport),
            pool: Arc::clone(&self.pool),
            sink: Arc::clone(&self.sink),
            config: self.config.clone(),
        });
        let input = FrameInput {
            documents: query.shared_documents(),
            question: query.question().to_string(),
            cancel: query.cancel_signal().clone(),
            depth: 0,
            parent_id: None,
            max_iterations,
            redactors: Vec::new(),
        };

        match AssertUnwindSafe(run_frame(shared, input)).catch_unwind().await {
            Ok(outcome) => QueryResult {
                answer: outcome.answer,
                status: outcome.status,
                token_usage: outcome.usage,
                execution_time_ms: duration_ms(started.elapsed()),
                trace: outcome.trace,
                verification: outcome.verification,
                semantic_verification: outcome.semantic,
            },
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(event = "query.panicked", error = %message);
                let err = QueryError::Internal(message);
                self.failed_result(&question, document_ids, err, started)
            }
        }
    }

    /// Blocking wrapper for synchronous callers and worker threads.
    ///
    /// Builds a private current-thread runtime, so it must not be called
    /// from inside an async context.
    pub fn query_blocking(
        &self,
        documents: Vec<Document>,
        question: impl Into<String>,
        cancel: CancelSignal,
    ) -> QueryResult {
        let question = question.into();
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                let ids = documents.iter().map(|d| d.id.clone()).collect();
                let err = QueryError::Internal(format!("failed to start runtime: {e}"));
                return self.failed_result(&question, ids, err, Instant::now());
            }
        };
        runtime.block_on(self.query(documents, question, cancel))
    }

    /// Result for failures that never reached a frame.
    fn failed_result(
        &self,
        question: &str,
        document_ids: Vec<String>,
        err: QueryError,
        started: Instant,
    ) -> QueryResult {
        let header = TraceHeader::new(question, self.transport.model_name(), document_ids);
        let mut recorder = TraceRecorder::start(header, Arc::clone(&self.sink));
        recorder.record(TraceStep::new(StepKind::Error, 0, err.to_string()));
        let status = QueryStatus::failed(&err);
        let elapsed = started.elapsed();
        let trace = recorder.finish(status.clone(), 0, &TokenUsage::default(), elapsed);
        QueryResult {
            answer: String::new(),
            status,
            token_usage: TokenUsage::default(),
            execution_time_ms: duration_ms(elapsed),
            trace,
            verification: None,
            semantic_verification: None,
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    d.as_millis() as u64
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FailureKind;
    use crate::sandbox::PoolConfig;
    use crate::testing::{ScriptedExecutorFactory, ScriptedTransport};

    fn engine(transport: ScriptedTransport) -> (QueryEngine, Arc<ScriptedTransport>) {
        let transport = Arc::new(transport);
        let pool = ExecutorPool::new(
            Arc::new(ScriptedExecutorFactory::new()),
            PoolConfig {
                size: 1,
                ..PoolConfig::default()
            },
        )
        .unwrap();
        let config = EngineConfig {
            semantic_verification: false,
            ..EngineConfig::default()
        };
        let engine = QueryEngine::new(transport.clone(), Arc::new(pool), config).unwrap();
        (engine, transport)
    }

    #[test]
    fn test_invalid_config_rejected() {
        let pool = ExecutorPool::new(
            Arc::new(ScriptedExecutorFactory::new()),
            PoolConfig::default(),
        )
        .unwrap();
        let config = EngineConfig {
            max_iterations: 0,
            ..EngineConfig::default()
        };
        assert!(
            QueryEngine::new(Arc::new(ScriptedTransport::new()), Arc::new(pool), config).is_err()
        );
    }

    #[tokio::test]
    async fn test_empty_question_is_invalid() {
        let (engine, transport) = engine(ScriptedTransport::new());
        let result = engine.query(vec![], "   ", CancelSignal::new()).await;
        assert_eq!(result.failure(), Some(FailureKind::InvalidQuery));
        assert!(result.answer.is_empty());
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_zero_limit_is_invalid() {
        let (engine, _) = engine(ScriptedTransport::new());
        let result = engine
            .query_with_limit(vec![], "q", CancelSignal::new(), 0)
            .await;
        assert_eq!(result.failure(), Some(FailureKind::InvalidQuery));
        assert!(result.trace.summary.is_some());
    }

    #[test]
    fn test_query_blocking_outside_runtime() {
        let (engine, _) = engine(ScriptedTransport::new().respond("FINAL_ANSWER: done"));
        let result = engine.query_blocking(
            vec![Document::new("a.txt", "text")],
            "anything?",
            CancelSignal::new(),
        );
        assert!(result.is_completed());
        assert_eq!(result.answer, "done");
    }

    #[test]
    fn test_panic_message_formats() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "panic: boom");
    }
}
