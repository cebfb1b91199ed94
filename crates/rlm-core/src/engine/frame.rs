//! One query frame: the iterate / execute / verify loop.
//!
//! A frame owns its boundary, its trace recorder and (for iterating frames)
//! one executor lease. Sub-queries issued by a snippet run as child frames
//! through [`FrameSubcalls`]; frames at `max_depth` or deeper answer with a
//! single LLM call and never lease an executor, so a pool of size one
//! cannot deadlock on recursion.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tracing::{warn, Instrument};
use uuid::Uuid;

use crate::boundary::{strip_markers, Boundary};
use crate::domain::{
    CancelSignal, Document, QueryError, QueryStatus, TokenUsage, INTERRUPTED_ANSWER, NO_ANSWER,
};
use crate::llm::{ChatMessage, LlmTransport};
use crate::metrics::METRICS;
use crate::obs::{
    emit_execution, emit_iteration, emit_query_finished, emit_query_started, emit_verified,
    query_span,
};
use crate::sandbox::{ExecutorLease, ExecutorPool};
use crate::trace::{StepKind, Trace, TraceHeader, TraceRecorder, TraceSink, TraceStep};
use crate::verification::{
    verify_answer, SemanticVerificationReport, SemanticVerifier, VerificationReport,
};

use super::config::{EngineConfig, VerificationPolicy};
use super::parse::{parse_response, ModelAction};
use super::prompt;
use super::subcall::FrameSubcalls;

/// Collaborators shared by every frame of one query tree.
pub(crate) struct EngineShared {
    pub transport: Arc<dyn LlmTransport>,
    pub pool: Arc<ExecutorPool>,
    pub sink: Arc<dyn TraceSink>,
    pub config: EngineConfig,
}

pub(crate) struct FrameInput {
    pub documents: Arc<[Document]>,
    pub question: String,
    pub cancel: CancelSignal,
    pub depth: u32,
    pub parent_id: Option<Uuid>,
    pub max_iterations: u32,
    /// Ancestor boundaries. A snippet can pass their tokens into a
    /// sub-query, so this frame's trace scrubs them too.
    pub redactors: Vec<Boundary>,
}

pub(crate) struct FrameOutcome {
    pub answer: String,
    pub status: QueryStatus,
    pub usage: TokenUsage,
    pub trace: Trace,
    /// Absent when the frame failed before generating one.
    pub boundary: Option<Boundary>,
    pub verification: Option<VerificationReport>,
    pub semantic: Option<SemanticVerificationReport>,
}

enum Exit {
    Final(String),
    Interrupted,
    Truncated,
    Failed(QueryError),
}

/// Run a frame to completion. Boxed so frames can recurse through
/// sub-query handlers.
pub(crate) fn run_frame(
    shared: Arc<EngineShared>,
    input: FrameInput,
) -> BoxFuture<'static, FrameOutcome> {
    Box::pin(async move {
        let mut header = TraceHeader::new(
            input.question.clone(),
            shared.transport.model_name(),
            input.documents.iter().map(|d| d.id.clone()).collect(),
        );
        if let Some(parent_id) = input.parent_id {
            header = header.child_of(parent_id, input.depth);
        }
        let span = query_span(&header.query_id.to_string(), input.depth);
        let frame = Frame::new(shared, input, header);
        frame.run().instrument(span).await
    })
}

struct Frame {
    shared: Arc<EngineShared>,
    input: FrameInput,
    recorder: TraceRecorder,
    usage: TokenUsage,
    started: Instant,
}

impl Frame {
    fn new(shared: Arc<EngineShared>, input: FrameInput, header: TraceHeader) -> Self {
        let recorder = TraceRecorder::start_redacted(
            header,
            Arc::clone(&shared.sink),
            input.redactors.clone(),
        );
        Self {
            shared,
            input,
            recorder,
            usage: TokenUsage::default(),
            started: Instant::now(),
        }
    }

    fn is_leaf(&self) -> bool {
        self.input.depth > 0 && self.input.depth >= self.shared.config.max_depth
    }

    async fn run(mut self) -> FrameOutcome {
        emit_query_started(
            &self.recorder.query_id().to_string(),
            self.input.documents.len(),
            self.input.max_iterations,
        );

        if self.input.question.trim().is_empty() {
            let err = QueryError::InvalidQuery("question must not be empty".into());
            return self.fail(err, 0, None);
        }
        if self.input.cancel.is_cancelled() {
            return self.finish(
                INTERRUPTED_ANSWER.to_string(),
                QueryStatus::Interrupted,
                0,
                None,
            );
        }

        let boundary = Boundary::generate();
        self.recorder.redact_with(&boundary);

        if self.is_leaf() {
            self.run_leaf(boundary).await
        } else {
            self.run_loop(boundary).await
        }
    }

    async fn run_leaf(mut self, boundary: Boundary) -> FrameOutcome {
        let messages = [
            ChatMessage::system(prompt::leaf_system_prompt()),
            ChatMessage::user(prompt::leaf_user(
                &self.input.question,
                &self.input.documents,
                &boundary,
                self.shared.config.max_feedback_chars,
            )),
        ];
        let call_started = Instant::now();
        match self.shared.transport.complete(&messages).await {
            Ok(completion) => {
                self.usage.add(&completion);
                emit_iteration(1, "leaf", completion.prompt_tokens, completion.completion_tokens);
                self.recorder.record(
                    TraceStep::new(StepKind::FinalAnswer, 1, completion.content.clone())
                        .with_tokens(completion.prompt_tokens, completion.completion_tokens)
                        .with_duration_ms(elapsed_ms(call_started)),
                );
                let answer = completion.content.trim().to_string();
                self.finish(answer, QueryStatus::Completed, 1, Some(boundary))
            }
            Err(e) => self.fail(e.into(), 1, Some(boundary)),
        }
    }

    async fn run_loop(mut self, boundary: Boundary) -> FrameOutcome {
        let config = self.shared.config.clone();
        let max_iterations = self.input.max_iterations;

        let mut lease: Option<ExecutorLease> = None;
        if let Err(e) = self.live_lease(&mut lease).await {
            return self.fail(e, 0, Some(boundary));
        }

        let mut lineage = self.input.redactors.clone();
        lineage.push(boundary.clone());
        let subcalls = FrameSubcalls::new(
            Arc::clone(&self.shared),
            self.recorder.query_id(),
            self.input.depth + 1,
            Arc::clone(&self.input.documents),
            self.input.cancel.clone(),
            lineage,
        );
        let mut child_boundaries: Vec<Boundary> = Vec::new();

        let mut messages = vec![
            ChatMessage::system(prompt::system_prompt(max_iterations)),
            ChatMessage::user(prompt::initial_user(
                &self.input.question,
                &self.input.documents,
                &boundary,
                config.preview_chars,
            )),
        ];
        let mut last_output: Option<String> = None;
        let mut iteration: u32 = 0;

        let exit = loop {
            if self.input.cancel.is_cancelled() {
                break Exit::Interrupted;
            }
            if iteration >= max_iterations {
                break Exit::Truncated;
            }
            iteration += 1;
            METRICS.inc_iterations();

            let call_started = Instant::now();
            let completion = match self.shared.transport.complete(&messages).await {
                Ok(c) => c,
                Err(e) => break Exit::Failed(e.into()),
            };
            self.usage.add(&completion);
            let call_ms = elapsed_ms(call_started);

            let action = parse_response(&completion.content);
            emit_iteration(
                iteration,
                action.label(),
                completion.prompt_tokens,
                completion.completion_tokens,
            );

            let code = match action {
                ModelAction::Final(answer) => {
                    self.recorder.record(
                        TraceStep::new(StepKind::FinalAnswer, iteration, answer.clone())
                            .with_tokens(completion.prompt_tokens, completion.completion_tokens)
                            .with_duration_ms(call_ms),
                    );
                    break Exit::Final(answer);
                }
                ModelAction::Neither => {
                    self.recorder.record(
                        TraceStep::new(
                            StepKind::Error,
                            iteration,
                            format!(
                                "response had neither code nor a final answer:\n{}",
                                completion.content
                            ),
                        )
                        .with_tokens(completion.prompt_tokens, completion.completion_tokens)
                        .with_duration_ms(call_ms),
                    );
                    messages.push(ChatMessage::assistant(completion.content));
                    messages.push(ChatMessage::user(prompt::NUDGE));
                    continue;
                }
                ModelAction::Code(code) => code,
            };

            self.recorder.record(
                TraceStep::new(StepKind::CodeGenerated, iteration, code.clone())
                    .with_tokens(completion.prompt_tokens, completion.completion_tokens)
                    .with_duration_ms(call_ms),
            );
            messages.push(ChatMessage::assistant(completion.content));

            let executor = match self.live_lease(&mut lease).await {
                Ok(executor) => executor,
                Err(e) => break Exit::Failed(e),
            };
            let exec_started = Instant::now();
            let outcome = executor.execute(&code, &subcalls).await;
            let exec_ms = elapsed_ms(exec_started);
            METRICS.inc_executions();

            for done in subcalls.drain() {
                self.recorder.redact_with(&done.boundary);
                self.recorder.record(TraceStep::new(
                    StepKind::SubcallRequest,
                    iteration,
                    format!(
                        "question: {}\ncontext: {} chars",
                        done.request.question,
                        done.request.context.chars().count()
                    ),
                ));
                self.recorder.record(
                    TraceStep::new(
                        StepKind::SubcallResponse,
                        iteration,
                        format!("[{}] {}", done.status.label(), done.answer),
                    )
                    .with_tokens(done.usage.prompt_tokens, done.usage.completion_tokens),
                );
                self.usage.merge(&done.usage);
                self.recorder.attach(done.trace);
                child_boundaries.push(done.boundary);
            }

            self.recorder.record(
                TraceStep::new(
                    StepKind::CodeOutput,
                    iteration,
                    format!("[{}]\n{}", outcome.status, outcome.output),
                )
                .with_duration_ms(exec_ms),
            );
            emit_execution(iteration, &outcome.status.to_string(), outcome.output.len(), exec_ms);

            if let Some(answer) = outcome.final_answer {
                self.recorder
                    .record(TraceStep::new(StepKind::FinalAnswer, iteration, answer.clone()));
                break Exit::Final(answer);
            }
            if !outcome.output.trim().is_empty() {
                last_output = Some(outcome.output.trim().to_string());
            }
            messages.push(ChatMessage::user(prompt::execution_feedback(
                &outcome,
                &boundary,
                config.max_feedback_chars,
                iteration,
                max_iterations,
            )));
        };

        // The executor goes back to the pool before verification starts.
        if let Some(lease) = lease.take() {
            lease.release();
        }

        let unwrap_children = |text: String| {
            child_boundaries
                .iter()
                .fold(text, |acc, b| strip_markers(&acc, b))
        };

        match exit {
            Exit::Final(answer) => {
                let answer = unwrap_children(answer);
                self.verify_and_finish(answer, iteration, boundary).await
            }
            // Exploration output is not an answer; only truncation salvages it.
            Exit::Interrupted => self.finish(
                INTERRUPTED_ANSWER.to_string(),
                QueryStatus::Interrupted,
                iteration,
                Some(boundary),
            ),
            Exit::Truncated => {
                let answer = last_output
                    .map(unwrap_children)
                    .unwrap_or_else(|| NO_ANSWER.to_string());
                self.finish(answer, QueryStatus::Truncated, iteration, Some(boundary))
            }
            Exit::Failed(err) => self.fail(err, iteration, Some(boundary)),
        }
    }

    /// Make sure `slot` holds a lease on a live executor with the frame's
    /// documents loaded, leasing a fresh one when the current runtime died.
    async fn live_lease<'a>(
        &self,
        slot: &'a mut Option<ExecutorLease>,
    ) -> Result<&'a mut ExecutorLease, QueryError> {
        if !matches!(slot, Some(lease) if lease.is_alive()) {
            if slot.take().is_some() {
                warn!(event = "query.executor_lost", "executor died mid-query; leasing another");
            }
            let timeout = Duration::from_millis(self.shared.config.acquire_timeout_ms);
            let mut lease = self.shared.pool.acquire(timeout).await?;
            lease.load_documents(&self.input.documents).await?;
            *slot = Some(lease);
        }
        slot.as_mut()
            .ok_or_else(|| QueryError::Internal("executor lease missing".into()))
    }

    async fn verify_and_finish(
        mut self,
        answer: String,
        iterations: u32,
        boundary: Boundary,
    ) -> FrameOutcome {
        if self.input.depth > 0 {
            return self.finish(answer, QueryStatus::Completed, iterations, Some(boundary));
        }

        let documents = Arc::clone(&self.input.documents);
        let report = verify_answer(&answer, &documents);
        self.recorder.record(TraceStep::new(
            StepKind::Verification,
            iterations,
            serde_json::to_string(&report).unwrap_or_else(|_| report.summary()),
        ));

        let semantic = if self.shared.config.semantic_verification {
            let started = Instant::now();
            let verifier = SemanticVerifier::new(Arc::clone(&self.shared.transport))
                .with_excerpt_chars(self.shared.config.semantic_excerpt_chars);
            let (semantic, usage) = verifier.verify(&answer, &report, &documents, &boundary).await;
            self.usage.merge(&usage);
            self.recorder.record(
                TraceStep::new(
                    StepKind::SemanticVerification,
                    iterations,
                    serde_json::to_string(&semantic).unwrap_or_else(|_| semantic.summary()),
                )
                .with_tokens(usage.prompt_tokens, usage.completion_tokens)
                .with_duration_ms(elapsed_ms(started)),
            );
            Some(semantic)
        } else {
            None
        };

        emit_verified(
            report.all_valid,
            report.citations.len(),
            report.quotes.len(),
            semantic.as_ref().map_or(0, |s| s.findings.len()),
        );

        let (answer, status) = match self.shared.config.verification_policy {
            VerificationPolicy::RejectInvalid if !report.all_valid => (
                String::new(),
                QueryStatus::Rejected {
                    reason: format!(
                        "{} citation(s) or quote(s) not found in the source documents",
                        report.invalid_count()
                    ),
                },
            ),
            _ => (answer, QueryStatus::Completed),
        };

        let mut outcome = self.finish(answer, status, iterations, Some(boundary));
        outcome.verification = Some(report);
        outcome.semantic = semantic;
        outcome
    }

    fn fail(mut self, err: QueryError, iterations: u32, boundary: Option<Boundary>) -> FrameOutcome {
        warn!(event = "query.failed", kind = %err.kind(), error = %err);
        self.recorder
            .record(TraceStep::new(StepKind::Error, iterations, err.to_string()));
        self.finish(String::new(), QueryStatus::failed(&err), iterations, boundary)
    }

    fn finish(
        self,
        answer: String,
        status: QueryStatus,
        iterations: u32,
        boundary: Option<Boundary>,
    ) -> FrameOutcome {
        let elapsed = self.started.elapsed();
        let query_id = self.recorder.query_id().to_string();
        let trace = self
            .recorder
            .finish(status.clone(), iterations, &self.usage, elapsed);
        emit_query_finished(&query_id, status.label(), iterations, elapsed.as_millis() as u64);
        FrameOutcome {
            answer,
            status,
            usage: self.usage,
            trace,
            boundary,
            verification: None,
            semantic: None,
        }
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}
