//! Structured observability hooks for the query lifecycle.
//!
//! Events are emitted at `info!` level (filter with `RUST_LOG`). Document
//! text, prompts and boundary tokens are never logged; only ids, sizes and
//! counters.

use tracing::{info, warn, Span};

/// Span tagging everything a query frame logs with its id and depth.
///
/// Attach it with `tracing::Instrument` rather than entering it, since
/// frames suspend across awaits.
pub fn query_span(query_id: &str, depth: u32) -> Span {
    tracing::info_span!("rlm.query", query_id = %query_id, depth = depth)
}

/// Emit event: a query frame started.
pub fn emit_query_started(query_id: &str, documents: usize, max_iterations: u32) {
    info!(
        event = "query.started",
        query_id = %query_id,
        documents = documents,
        max_iterations = max_iterations,
    );
}

/// Emit event: one iteration's LLM round-trip finished.
pub fn emit_iteration(iteration: u32, action: &str, prompt_tokens: u64, completion_tokens: u64) {
    info!(
        event = "query.iteration",
        iteration = iteration,
        action = %action,
        prompt_tokens = prompt_tokens,
        completion_tokens = completion_tokens,
    );
}

/// Emit event: a snippet finished executing.
pub fn emit_execution(iteration: u32, status: &str, output_bytes: usize, duration_ms: u64) {
    info!(
        event = "query.execution",
        iteration = iteration,
        status = %status,
        output_bytes = output_bytes,
        duration_ms = duration_ms,
    );
}

/// Emit event: a snippet spawned a sub-query.
pub fn emit_subcall(parent_id: &str, child_id: &str, depth: u32) {
    info!(event = "query.subcall", parent_id = %parent_id, child_id = %child_id, depth = depth);
}

/// Emit event: verification finished.
pub fn emit_verified(all_valid: bool, citations: usize, quotes: usize, findings: usize) {
    info!(
        event = "query.verified",
        all_valid = all_valid,
        citations = citations,
        quotes = quotes,
        findings = findings,
    );
}

/// Emit event: a query frame reached a terminal state.
pub fn emit_query_finished(query_id: &str, status: &str, iterations: u32, duration_ms: u64) {
    info!(
        event = "query.finished",
        query_id = %query_id,
        status = %status,
        iterations = iterations,
        duration_ms = duration_ms,
    );
}

/// Emit event: the trace sink rejected a record (warning level).
pub fn emit_trace_write_error(query_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "trace.write_error", query_id = %query_id, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[traced_test]
    #[test]
    fn test_query_lifecycle_events_logged() {
        emit_query_started("q-1", 3, 20);
        emit_query_finished("q-1", "completed", 2, 15);
        assert!(logs_contain("query.started"));
        assert!(logs_contain("query.finished"));
    }

    #[traced_test]
    #[test]
    fn test_trace_write_error_is_warning() {
        emit_trace_write_error("q-2", &"disk full");
        assert!(logs_contain("disk full"));
    }

    #[test]
    fn test_query_span_create() {
        let span = query_span("q-3", 0);
        let _entered = span.enter();
    }
}
