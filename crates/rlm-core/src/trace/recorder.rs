//! Per-frame trace recording.
//!
//! A [`TraceRecorder`] owns the in-memory [`Trace`] of one query frame and
//! mirrors every record to the shared [`TraceSink`] as it is appended. Once
//! [`TraceRecorder::finish`] runs the trace is sealed: the summary carries a
//! SHA-256 digest over the serialized steps.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::boundary::Boundary;
use crate::domain::{QueryStatus, TokenUsage};
use crate::obs::emit_trace_write_error;

use super::sink::{TraceRecord, TraceSink};
use super::step::{StepKind, TraceStep};

/// Identity and inputs of one query frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceHeader {
    pub query_id: Uuid,
    /// Frame that issued this sub-query, if any.
    pub parent_id: Option<Uuid>,
    pub depth: u32,
    pub question: String,
    pub model: String,
    pub document_ids: Vec<String>,
    pub started_at: DateTime<Utc>,
}

impl TraceHeader {
    pub fn new(
        question: impl Into<String>,
        model: impl Into<String>,
        document_ids: Vec<String>,
    ) -> Self {
        Self {
            query_id: Uuid::new_v4(),
            parent_id: None,
            depth: 0,
            question: question.into(),
            model: model.into(),
            document_ids,
            started_at: Utc::now(),
        }
    }

    pub fn child_of(mut self, parent_id: Uuid, depth: u32) -> Self {
        self.parent_id = Some(parent_id);
        self.depth = depth;
        self
    }
}

/// Totals written when a frame reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceSummary {
    pub query_id: Uuid,
    pub status: QueryStatus,
    pub total_iterations: u32,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub duration_ms: u64,
    /// SHA-256 hex of the JSON-serialized step list.
    pub steps_digest: String,
    pub finished_at: DateTime<Utc>,
}

/// The complete record of one query frame and the sub-queries it spawned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    pub header: TraceHeader,
    pub steps: Vec<TraceStep>,
    pub summary: Option<TraceSummary>,
    pub subtraces: Vec<Trace>,
}

impl Trace {
    /// LLM round-trips taken by this frame's loop (0 until finished).
    pub fn total_iterations(&self) -> u32 {
        self.summary.as_ref().map_or(0, |s| s.total_iterations)
    }

    pub fn steps_of(&self, kind: StepKind) -> impl Iterator<Item = &TraceStep> {
        self.steps.iter().filter(move |s| s.kind == kind)
    }

    /// Recompute the step digest and compare it with the summary.
    pub fn verify_digest(&self) -> bool {
        self.summary
            .as_ref()
            .is_some_and(|s| s.steps_digest == steps_digest(&self.steps))
    }
}

fn steps_digest(steps: &[TraceStep]) -> String {
    let bytes = serde_json::to_vec(steps).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

/// Builds one frame's [`Trace`] and streams it to a sink.
pub struct TraceRecorder {
    trace: Trace,
    sink: Arc<dyn TraceSink>,
    redactors: Vec<Boundary>,
}

impl TraceRecorder {
    /// Start a trace and write its header record.
    pub fn start(header: TraceHeader, sink: Arc<dyn TraceSink>) -> Self {
        Self::start_redacted(header, sink, Vec::new())
    }

    /// Like [`TraceRecorder::start`], scrubbing `redactors` from the header
    /// question and from every step.
    pub fn start_redacted(
        mut header: TraceHeader,
        sink: Arc<dyn TraceSink>,
        redactors: Vec<Boundary>,
    ) -> Self {
        for boundary in &redactors {
            header.question = boundary.redact(&header.question);
        }
        let recorder = Self {
            trace: Trace {
                header,
                steps: Vec::new(),
                summary: None,
                subtraces: Vec::new(),
            },
            sink,
            redactors,
        };
        recorder.emit(&TraceRecord::Header(recorder.trace.header.clone()));
        recorder
    }

    pub fn query_id(&self) -> Uuid {
        self.trace.header.query_id
    }

    pub fn depth(&self) -> u32 {
        self.trace.header.depth
    }

    /// Scrub this boundary's token from every step recorded from now on.
    pub fn redact_with(&mut self, boundary: &Boundary) {
        if !self.redactors.contains(boundary) {
            self.redactors.push(boundary.clone());
        }
    }

    pub fn record(&mut self, mut step: TraceStep) {
        for boundary in &self.redactors {
            step.content = boundary.redact(&step.content);
        }
        self.emit(&TraceRecord::Step {
            query_id: self.trace.header.query_id,
            step: step.clone(),
        });
        self.trace.steps.push(step);
    }

    /// Keep a finished sub-query trace under this one.
    pub fn attach(&mut self, child: Trace) {
        self.trace.subtraces.push(child);
    }

    pub fn steps(&self) -> &[TraceStep] {
        &self.trace.steps
    }

    /// Seal the trace and write its summary record.
    pub fn finish(
        mut self,
        status: QueryStatus,
        total_iterations: u32,
        usage: &TokenUsage,
        elapsed: Duration,
    ) -> Trace {
        let summary = TraceSummary {
            query_id: self.trace.header.query_id,
            status,
            total_iterations,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            duration_ms: elapsed.as_millis() as u64,
            steps_digest: steps_digest(&self.trace.steps),
            finished_at: Utc::now(),
        };
        self.emit(&TraceRecord::Summary(summary.clone()));
        self.trace.summary = Some(summary);
        self.trace
    }

    fn emit(&self, record: &TraceRecord) {
        if let Err(e) = self.sink.write(record) {
            emit_trace_write_error(&self.trace.header.query_id.to_string(), &e);
        }
    }
}
