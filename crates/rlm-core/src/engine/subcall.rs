//! Bridges `llm_query(...)` calls from a running snippet to child frames.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use uuid::Uuid;

use crate::boundary::{wrap, Boundary};
use crate::domain::{CancelSignal, Document, QueryStatus, TokenUsage, INTERRUPTED_ANSWER};
use crate::metrics::METRICS;
use crate::obs::emit_subcall;
use crate::sandbox::{SubcallHandler, SubcallRequest};
use crate::trace::Trace;

use super::frame::{run_frame, EngineShared, FrameInput};

/// Document id given to an explicit sub-query context.
pub const SUBCALL_CONTEXT_ID: &str = "subcall_context";

/// A sub-query that ran during the current snippet.
pub(crate) struct CompletedSubcall {
    pub request: SubcallRequest,
    pub answer: String,
    pub status: QueryStatus,
    pub usage: TokenUsage,
    pub trace: Trace,
    /// The child's boundary; its markers appear in the reply handed to the
    /// snippet.
    pub boundary: Boundary,
}

pub(crate) struct FrameSubcalls {
    shared: Arc<EngineShared>,
    parent_id: Uuid,
    child_depth: u32,
    documents: Arc<[Document]>,
    cancel: CancelSignal,
    /// The parent's boundary and everything it inherited.
    lineage: Vec<Boundary>,
    completed: Mutex<Vec<CompletedSubcall>>,
}

impl FrameSubcalls {
    pub fn new(
        shared: Arc<EngineShared>,
        parent_id: Uuid,
        child_depth: u32,
        documents: Arc<[Document]>,
        cancel: CancelSignal,
        lineage: Vec<Boundary>,
    ) -> Self {
        Self {
            shared,
            parent_id,
            child_depth,
            documents,
            cancel,
            lineage,
            completed: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<CompletedSubcall>> {
        self.completed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take every sub-query finished since the last drain, in call order.
    pub fn drain(&self) -> Vec<CompletedSubcall> {
        std::mem::take(&mut *self.lock())
    }

    /// An empty context means "the parent's documents".
    fn documents_for(&self, context: &str) -> Arc<[Document]> {
        if context.trim().is_empty() {
            Arc::clone(&self.documents)
        } else {
            Arc::from(vec![Document::new(SUBCALL_CONTEXT_ID, context)])
        }
    }
}

/// Text handed back to the snippet for a finished child frame.
fn reply_for(answer: &str, status: &QueryStatus, boundary: &Boundary) -> String {
    match status {
        QueryStatus::Completed | QueryStatus::Truncated => wrap(answer, boundary),
        QueryStatus::Interrupted => INTERRUPTED_ANSWER.to_string(),
        QueryStatus::Rejected { reason } => format!("[sub-query rejected: {reason}]"),
        QueryStatus::Failed { message, .. } => format!("[sub-query failed: {message}]"),
    }
}

#[async_trait]
impl SubcallHandler for FrameSubcalls {
    async fn handle(&self, request: SubcallRequest) -> String {
        METRICS.inc_subcalls();
        let input = FrameInput {
            documents: self.documents_for(&request.context),
            question: request.question.clone(),
            cancel: self.cancel.clone(),
            depth: self.child_depth,
            parent_id: Some(self.parent_id),
            max_iterations: self.shared.config.max_iterations,
            redactors: self.lineage.clone(),
        };
        let outcome = run_frame(Arc::clone(&self.shared), input).await;
        emit_subcall(
            &self.parent_id.to_string(),
            &outcome.trace.header.query_id.to_string(),
            self.child_depth,
        );

        // A child that failed before generating a boundary never wraps.
        let boundary = outcome.boundary.unwrap_or_else(Boundary::generate);
        let reply = reply_for(&outcome.answer, &outcome.status, &boundary);
        self.lock().push(CompletedSubcall {
            request,
            answer: outcome.answer,
            status: outcome.status,
            usage: outcome.usage,
            trace: outcome.trace,
            boundary,
        });
        reply
    }
}
