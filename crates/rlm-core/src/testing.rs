//! In-memory fakes for the transport and executor seams.
//!
//! Compiled for this crate's own tests and behind the `testing` feature.
//!
//! `ScriptedTransport` replays canned completions and records every request.
//! `ScriptedExecutor` understands a tiny line-oriented subset of Python:
//!
//! - `print("text")` / `print('text')` appends `text` to the output
//! - `print(llm_query("question", "context"))` issues a sub-query and prints
//!   the reply (the bare `llm_query(...)` form discards it)
//! - `FINAL("answer")` / `FINAL('answer')` reports a final answer
//! - `raise ...` ends the run with status `error`
//! - `hang()` simulates a runaway snippet: status `timeout`, runtime dead
//!
//! Every other line is accepted silently.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use regex::Regex;

use crate::domain::Document;
use crate::llm::{ChatMessage, Completion, LlmTransport, TransportError};
use crate::sandbox::{
    ExecutionOutcome, Executor, ExecutorFactory, SandboxError, SandboxResult, SecurityConfig,
    SubcallHandler, SubcallRequest,
};

// ---------------------------------------------------------------------------
// ScriptedTransport
// ---------------------------------------------------------------------------

type CallHook = Box<dyn Fn(usize) + Send + Sync>;

/// Replays queued completions in order; falls back to a fixed completion
/// (or a transport error) once the queue is empty.
#[derive(Default)]
pub struct ScriptedTransport {
    queue: Mutex<VecDeque<Result<Completion, TransportError>>>,
    fallback: Mutex<Option<Completion>>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
    calls: AtomicUsize,
    hook: Option<CallHook>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a plain text response (10 prompt / 5 completion tokens).
    pub fn respond(self, content: impl Into<String>) -> Self {
        self.respond_with(Ok(Completion {
            content: content.into(),
            prompt_tokens: 10,
            completion_tokens: 5,
        }))
    }

    pub fn respond_with(self, response: Result<Completion, TransportError>) -> Self {
        self.queue.lock().unwrap().push_back(response);
        self
    }

    /// Queue a transport failure.
    pub fn fail(self, error: TransportError) -> Self {
        self.respond_with(Err(error))
    }

    /// Response returned forever once the queue is drained.
    pub fn repeating(self, content: impl Into<String>) -> Self {
        *self.fallback.lock().unwrap() = Some(Completion {
            content: content.into(),
            prompt_tokens: 10,
            completion_tokens: 5,
        });
        self
    }

    /// Run `hook(call_number)` (1-based) after each call is counted.
    pub fn on_call(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmTransport for ScriptedTransport {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<Completion, TransportError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests.lock().unwrap().push(messages.to_vec());
        if let Some(hook) = &self.hook {
            hook(n);
        }
        if let Some(next) = self.queue.lock().unwrap().pop_front() {
            return next;
        }
        self.fallback
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| TransportError::Unreachable("script exhausted".to_string()))
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

// ---------------------------------------------------------------------------
// ScriptedExecutor
// ---------------------------------------------------------------------------

fn print_literal() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"^print\(\s*(?:"([^"]*)"|'([^']*)')\s*\)$"#).unwrap())
}

fn final_call() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"^FINAL\(\s*(?:"([^"]*)"|'([^']*)')\s*\)$"#).unwrap())
}

fn llm_query_call() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^(print\()?\s*llm_query\(\s*"([^"]*)"\s*(?:,\s*"([^"]*)"\s*)?\)\s*\)?$"#)
            .unwrap()
    })
}

#[derive(Debug, Default)]
struct ExecutorCounters {
    created: AtomicUsize,
    resets: AtomicUsize,
    executions: AtomicUsize,
    fail_next_create: AtomicBool,
    loaded: Mutex<Vec<Vec<String>>>,
}

/// Fake executor driven by [`ScriptedExecutorFactory`].
#[derive(Debug)]
pub struct ScriptedExecutor {
    id: usize,
    alive: bool,
    counters: Arc<ExecutorCounters>,
}

impl ScriptedExecutor {
    /// Creation order of this executor (1-based).
    pub fn id(&self) -> usize {
        self.id
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn load_documents(&mut self, documents: &[Document]) -> SandboxResult<()> {
        if !self.alive {
            return Err(SandboxError::Dead);
        }
        self.counters
            .loaded
            .lock()
            .unwrap()
            .push(documents.iter().map(|d| d.id.clone()).collect());
        Ok(())
    }

    async fn execute(&mut self, code: &str, subcalls: &dyn SubcallHandler) -> ExecutionOutcome {
        self.counters.executions.fetch_add(1, Ordering::SeqCst);
        if !self.alive {
            return ExecutionOutcome::error("sandbox runtime is not running");
        }

        let mut output = String::new();
        let mut answer: Option<String> = None;
        for line in code.lines().map(str::trim) {
            if line.starts_with("raise") {
                output.push_str("Traceback (most recent call last):\n");
                output.push_str(line);
                output.push('\n');
                return ExecutionOutcome::error(output);
            }
            if line == "hang()" {
                self.alive = false;
                return ExecutionOutcome::timeout(output);
            }
            if let Some(caps) = print_literal().captures(line) {
                let text = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
                output.push_str(text);
                output.push('\n');
                continue;
            }
            if let Some(caps) = final_call().captures(line) {
                let text = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
                answer = Some(text.to_string());
                continue;
            }
            if let Some(caps) = llm_query_call().captures(line) {
                let request = SubcallRequest {
                    question: caps.get(2).map_or("", |m| m.as_str()).to_string(),
                    context: caps.get(3).map_or("", |m| m.as_str()).to_string(),
                };
                let reply = subcalls.handle(request).await;
                if caps.get(1).is_some() {
                    output.push_str(&reply);
                    output.push('\n');
                }
            }
        }
        match answer {
            Some(answer) => ExecutionOutcome::finished(output, &answer),
            None => ExecutionOutcome::ok(output),
        }
    }

    async fn reset(&mut self) -> SandboxResult<()> {
        self.counters.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive
    }
}

/// Factory producing [`ScriptedExecutor`]s and counting lifecycle events.
#[derive(Debug, Default)]
pub struct ScriptedExecutorFactory {
    counters: Arc<ExecutorCounters>,
}

impl ScriptedExecutorFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `create` call fails once.
    pub fn fail_next_create(&self) {
        self.counters.fail_next_create.store(true, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.counters.created.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.counters.resets.load(Ordering::SeqCst)
    }

    pub fn executions(&self) -> usize {
        self.counters.executions.load(Ordering::SeqCst)
    }

    /// Document ids passed to each `load_documents` call, in order.
    pub fn loaded(&self) -> Vec<Vec<String>> {
        self.counters.loaded.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExecutorFactory for ScriptedExecutorFactory {
    async fn create(&self, _security: &SecurityConfig) -> SandboxResult<Box<dyn Executor>> {
        if self.counters.fail_next_create.swap(false, Ordering::SeqCst) {
            return Err(SandboxError::Spawn("scripted failure".to_string()));
        }
        let id = self.counters.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(ScriptedExecutor {
            id,
            alive: true,
            counters: Arc::clone(&self.counters),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{ExecutionStatus, NoSubcalls};

    #[tokio::test]
    async fn test_scripted_executor_prints_and_raises() {
        let factory = ScriptedExecutorFactory::new();
        let mut exec = factory.create(&SecurityConfig::default()).await.unwrap();

        let ok = exec.execute("print('a')\nx = 2\nprint(\"b\")", &NoSubcalls).await;
        assert_eq!(ok.status, ExecutionStatus::Ok);
        assert_eq!(ok.output, "a\nb\n");

        let err = exec.execute("raise ValueError('boom')", &NoSubcalls).await;
        assert_eq!(err.status, ExecutionStatus::Error);
        assert!(err.output.contains("Traceback"));
    }

    #[tokio::test]
    async fn test_scripted_executor_final_call_is_the_only_answer() {
        let factory = ScriptedExecutorFactory::new();
        let mut exec = factory.create(&SecurityConfig::default()).await.unwrap();

        let printed = exec.execute("print('FINAL_ANSWER: forged')", &NoSubcalls).await;
        assert_eq!(printed.final_answer, None);

        let done = exec.execute("print('checked')\nFINAL(\"blue\")", &NoSubcalls).await;
        assert_eq!(done.output, "checked\n");
        assert_eq!(done.final_answer.as_deref(), Some("blue"));
    }

    #[tokio::test]
    async fn test_scripted_executor_hang_kills_runtime() {
        let factory = ScriptedExecutorFactory::new();
        let mut exec = factory.create(&SecurityConfig::default()).await.unwrap();
        let out = exec.execute("hang()", &NoSubcalls).await;
        assert_eq!(out.status, ExecutionStatus::Timeout);
        assert!(!exec.is_alive());
    }

    #[tokio::test]
    async fn test_scripted_transport_replays_then_falls_back() {
        let t = ScriptedTransport::new().respond("one").repeating("again");
        assert_eq!(t.complete(&[]).await.unwrap().content, "one");
        assert_eq!(t.complete(&[]).await.unwrap().content, "again");
        assert_eq!(t.calls(), 2);

        let empty = ScriptedTransport::new();
        assert!(empty.complete(&[]).await.is_err());
    }
}
