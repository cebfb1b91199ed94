//! Process-backed executor: a persistent Python driver speaking JSON lines.
//!
//! The driver runs either inside a named container (`docker run --rm -i
//! --name rlm-<uuid>` plus the pool's [`SecurityConfig`] flags) or, for local
//! development, as a plain `python3` child. Interpreter state lives in the
//! driver, so variables persist across snippets until a `reset` request.
//!
//! Protocol (one JSON object per line):
//!
//! | direction | message |
//! |-----------|---------|
//! | host → driver | `{"op":"load","documents":[{"id":..,"text":..}]}` |
//! | host → driver | `{"op":"exec","code":..}` |
//! | host → driver | `{"op":"reset"}` |
//! | host → driver | `{"op":"subcall_result","result":..}` |
//! | driver → host | `{"type":"ready"}` |
//! | driver → host | `{"type":"result","ok":bool,"output":..,"final_answer":..}` |
//! | driver → host | `{"type":"subcall","question":..,"context":..}` |
//!
//! `final_answer` is set only by a `FINAL(answer)` call inside the snippet;
//! printed text never becomes an answer. The driver caps captured output at
//! `max_output_bytes` characters before sending it, and the host refuses any
//! line longer than `max_message_bytes`.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::Document;

use super::error::{SandboxError, SandboxResult};
use super::executor::{
    truncate_output, ExecutionOutcome, Executor, ExecutorFactory, SubcallHandler, SubcallRequest,
};
use super::security::SecurityConfig;

/// Python source of the in-sandbox driver. `sys.argv[1]` is the output cap.
const DRIVER_SOURCE: &str = r#"
import contextlib, io, json, sys, traceback

_out = sys.stdout
_in = sys.stdin
_LIMIT = int(sys.argv[1]) if len(sys.argv) > 1 else 65536

def _send(msg):
    _out.write(json.dumps(msg) + "\n")
    _out.flush()

class _Capture(io.TextIOBase):
    def __init__(self):
        self.parts = []
        self.kept = 0
        self.dropped = 0

    def writable(self):
        return True

    def write(self, s):
        s = str(s)
        room = max(_LIMIT - self.kept, 0)
        if room:
            head = s[:room]
            self.parts.append(head)
            self.kept += len(head)
        self.dropped += max(len(s) - room, 0)
        return len(s)

    def getvalue(self):
        text = "".join(self.parts)
        if self.dropped:
            text += "\n... [output truncated: %d characters omitted]" % self.dropped
        return text

_final = []

def FINAL(answer):
    _final[:] = [str(answer)[:_LIMIT]]

def llm_query(question, context=""):
    _send({"type": "subcall", "question": str(question), "context": str(context)})
    line = _in.readline()
    if not line:
        raise SystemExit(0)
    return json.loads(line).get("result", "")

def _fresh():
    return {"__name__": "__sandbox__", "llm_query": llm_query, "FINAL": FINAL,
            "documents": [], "context": []}

ns = _fresh()
_send({"type": "ready"})
while True:
    line = _in.readline()
    if not line:
        break
    try:
        req = json.loads(line)
    except ValueError:
        _send({"type": "result", "ok": False, "output": "malformed request"})
        continue
    op = req.get("op")
    if op == "load":
        docs = req.get("documents", [])
        ns["documents"] = docs
        ns["context"] = [d.get("text", "") for d in docs]
        _send({"type": "result", "ok": True, "output": ""})
    elif op == "reset":
        ns = _fresh()
        _send({"type": "result", "ok": True, "output": ""})
    elif op == "exec":
        buf = _Capture()
        ok = True
        del _final[:]
        with contextlib.redirect_stdout(buf), contextlib.redirect_stderr(buf):
            try:
                exec(compile(req.get("code", ""), "<snippet>", "exec"), ns)
            except BaseException:
                ok = False
                traceback.print_exc()
        answer = _final[0] if ok and _final else None
        _send({"type": "result", "ok": ok, "output": buf.getvalue(), "final_answer": answer})
    else:
        _send({"type": "result", "ok": False, "output": "unknown op"})
"#;

/// Where the driver process runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RuntimeMode {
    /// Inside a container started with the pool's security flags.
    Container {
        /// Container CLI (`docker`, `podman`).
        engine: String,
        image: String,
        /// e.g. `512m`; passed as `--memory`.
        memory_limit: Option<String>,
        /// e.g. `1.0`; passed as `--cpus`.
        cpus: Option<String>,
    },
    /// Directly on the host. No isolation; development only.
    Local { python: String },
}

impl Default for RuntimeMode {
    fn default() -> Self {
        RuntimeMode::Container {
            engine: "docker".to_string(),
            image: "python:3.12-slim".to_string(),
            memory_limit: Some("512m".to_string()),
            cpus: Some("1.0".to_string()),
        }
    }
}

/// Settings for [`ProcessExecutor`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessExecutorConfig {
    pub runtime: RuntimeMode,
    /// Wall-clock limit for one snippet (milliseconds), sub-queries
    /// included. A snippet that exceeds it kills the runtime.
    pub exec_timeout_ms: u64,
    /// Limit for driver startup and control requests (milliseconds).
    pub startup_timeout_ms: u64,
    /// Cap on captured output per snippet.
    pub max_output_bytes: usize,
    /// Longest driver line the host will read. A longer one kills the
    /// runtime.
    pub max_message_bytes: usize,
}

impl Default for ProcessExecutorConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeMode::default(),
            exec_timeout_ms: 30_000,
            startup_timeout_ms: 60_000,
            max_output_bytes: 64 * 1024,
            max_message_bytes: 16 * 1024 * 1024,
        }
    }
}

impl ProcessExecutorConfig {
    pub fn validate(&self) -> SandboxResult<()> {
        if self.exec_timeout_ms == 0 {
            return Err(SandboxError::InvalidConfig(
                "exec_timeout_ms must be positive".to_string(),
            ));
        }
        if self.max_output_bytes == 0 {
            return Err(SandboxError::InvalidConfig(
                "max_output_bytes must be positive".to_string(),
            ));
        }
        if self.max_message_bytes < self.max_output_bytes {
            return Err(SandboxError::InvalidConfig(
                "max_message_bytes must be at least max_output_bytes".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the command line that launches the driver, plus the handle of
    /// the container it will start, if any.
    fn command(&self, security: &SecurityConfig) -> (Command, Option<ContainerHandle>) {
        let limit = self.max_output_bytes.to_string();
        match &self.runtime {
            RuntimeMode::Container {
                engine,
                image,
                memory_limit,
                cpus,
            } => {
                let handle = ContainerHandle::new(engine);
                let mut cmd = Command::new(engine);
                cmd.args(["run", "--rm", "-i", "--name", handle.name.as_str()]);
                cmd.args(security.container_args());
                if let Some(memory) = memory_limit {
                    cmd.arg("--memory").arg(memory);
                }
                if let Some(cpus) = cpus {
                    cmd.arg("--cpus").arg(cpus);
                }
                cmd.arg(image)
                    .args(["python3", "-u", "-c", DRIVER_SOURCE, limit.as_str()]);
                (cmd, Some(handle))
            }
            RuntimeMode::Local { python } => {
                let mut cmd = Command::new(python);
                cmd.args(["-u", "-c", DRIVER_SOURCE, limit.as_str()]);
                (cmd, None)
            }
        }
    }
}

/// A container started under a known name.
///
/// Killing the `run` client does not stop the container, so cleanup goes
/// through the engine by name.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ContainerHandle {
    engine: String,
    name: String,
}

impl ContainerHandle {
    fn new(engine: &str) -> Self {
        Self {
            engine: engine.to_string(),
            name: format!("rlm-{}", Uuid::new_v4().simple()),
        }
    }

    fn kill_args(&self) -> [&str; 2] {
        ["kill", self.name.as_str()]
    }

    fn remove_args(&self) -> [&str; 3] {
        ["rm", "-f", self.name.as_str()]
    }

    /// `kill`, then `rm -f` in case `--rm` never fired.
    async fn stop(&self) {
        let kill = self.kill_args();
        let remove = self.remove_args();
        for args in [&kill[..], &remove[..]] {
            let status = Command::new(&self.engine)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            match status {
                Ok(status) if status.success() => {}
                Ok(status) => debug!(container = %self.name, op = args[0], %status, "container cleanup step failed"),
                Err(e) => debug!(container = %self.name, op = args[0], error = %e, "container cleanup step failed"),
            }
        }
    }

    /// Cleanup from `Drop`, where nothing can be awaited.
    fn stop_detached(self) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { self.stop().await });
            }
            Err(_) => {
                let spawned = std::process::Command::new(&self.engine)
                    .args(self.remove_args())
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .spawn();
                if let Err(e) = spawned {
                    warn!(container = %self.name, error = %e, "could not remove sandbox container");
                }
            }
        }
    }
}

/// The driver's report for one request.
#[derive(Debug, Deserialize)]
struct DriverReply {
    ok: bool,
    #[serde(default)]
    output: String,
    #[serde(default)]
    final_answer: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum DriverMessage {
    Ready,
    Result(DriverReply),
    Subcall { question: String, context: String },
}

/// An absolute point in time plus the limit it was derived from.
#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    limit_ms: u64,
}

impl Deadline {
    fn after(limit_ms: u64) -> Self {
        Self {
            at: Instant::now() + Duration::from_millis(limit_ms),
            limit_ms,
        }
    }

    fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    fn timeout(&self) -> SandboxError {
        SandboxError::Timeout {
            limit_ms: self.limit_ms,
        }
    }
}

/// Read one `\n`-terminated line of at most `max_bytes`; `None` at end of
/// stream.
async fn read_bounded_line<R>(reader: &mut R, max_bytes: usize) -> SandboxResult<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let read = (&mut *reader)
        .take(max_bytes as u64 + 1)
        .read_until(b'\n', &mut line)
        .await?;
    if read == 0 {
        return Ok(None);
    }
    if line.last() == Some(&b'\n') {
        line.pop();
    } else if line.len() > max_bytes {
        return Err(SandboxError::Protocol(format!(
            "driver message exceeds {max_bytes} bytes"
        )));
    }
    String::from_utf8(line)
        .map(Some)
        .map_err(|e| SandboxError::Protocol(format!("driver line is not UTF-8: {e}")))
}

/// Host side of the JSON-lines conversation with one driver.
struct DriverChannel<W, R> {
    writer: W,
    reader: R,
    max_message_bytes: usize,
}

impl<W, R> DriverChannel<W, R>
where
    W: AsyncWrite + Unpin,
    R: AsyncBufRead + Unpin,
{
    async fn send(&mut self, message: &serde_json::Value) -> SandboxResult<()> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn recv(&mut self, deadline: Deadline) -> SandboxResult<DriverMessage> {
        let read = read_bounded_line(&mut self.reader, self.max_message_bytes);
        let line = match tokio::time::timeout_at(deadline.at, read).await {
            Ok(line) => line?.ok_or(SandboxError::Dead)?,
            Err(_) => return Err(deadline.timeout()),
        };
        serde_json::from_str(&line)
            .map_err(|e| SandboxError::Protocol(format!("undecodable driver line: {e}")))
    }

    /// Run one snippet, answering its sub-queries, until the driver reports
    /// a result. Time spent in sub-queries counts against `deadline`.
    async fn exchange(
        &mut self,
        code: &str,
        subcalls: &dyn SubcallHandler,
        deadline: Deadline,
    ) -> SandboxResult<DriverReply> {
        self.send(&json!({ "op": "exec", "code": code })).await?;
        loop {
            match self.recv(deadline).await? {
                DriverMessage::Result(reply) => return Ok(reply),
                DriverMessage::Subcall { question, context } => {
                    let reply = subcalls.handle(SubcallRequest { question, context }).await;
                    if deadline.expired() {
                        return Err(deadline.timeout());
                    }
                    self.send(&json!({ "op": "subcall_result", "result": reply }))
                        .await?;
                }
                DriverMessage::Ready => continue,
            }
        }
    }
}

/// Executor backed by one long-lived driver process.
pub struct ProcessExecutor {
    child: Child,
    channel: DriverChannel<ChildStdin, BufReader<ChildStdout>>,
    /// Present until the container has been stopped.
    container: Option<ContainerHandle>,
    alive: bool,
    config: ProcessExecutorConfig,
}

impl ProcessExecutor {
    /// Launch the driver and wait for its `ready` line.
    pub async fn spawn(
        config: ProcessExecutorConfig,
        security: &SecurityConfig,
    ) -> SandboxResult<Self> {
        config.validate()?;
        let (mut command, container) = config.command(security);
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::Spawn(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::Spawn("driver stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Spawn("driver stdout unavailable".to_string()))?;

        let mut executor = Self {
            child,
            channel: DriverChannel {
                writer: stdin,
                reader: BufReader::new(stdout),
                max_message_bytes: config.max_message_bytes,
            },
            container,
            alive: true,
            config,
        };

        let startup = Deadline::after(executor.config.startup_timeout_ms);
        match executor.channel.recv(startup).await {
            Ok(DriverMessage::Ready) => {
                debug!(
                    pid = ?executor.child.id(),
                    container = ?executor.container.as_ref().map(|c| &c.name),
                    "sandbox driver ready"
                );
                Ok(executor)
            }
            Ok(other) => {
                executor.kill().await;
                Err(SandboxError::Protocol(format!(
                    "expected ready, got {other:?}"
                )))
            }
            Err(e) => {
                executor.kill().await;
                Err(e)
            }
        }
    }

    /// Send a control request and wait for its `result`.
    async fn control(&mut self, message: serde_json::Value) -> SandboxResult<()> {
        if !self.alive {
            return Err(SandboxError::Dead);
        }
        let deadline = Deadline::after(self.config.startup_timeout_ms);
        let channel = &mut self.channel;
        let reply = async {
            channel.send(&message).await?;
            channel.recv(deadline).await
        }
        .await;
        match reply {
            Ok(DriverMessage::Result(reply)) if reply.ok => Ok(()),
            Ok(DriverMessage::Result(reply)) => Err(SandboxError::Protocol(reply.output)),
            Ok(other) => Err(SandboxError::Protocol(format!(
                "unexpected driver message {other:?}"
            ))),
            Err(e) => {
                self.kill().await;
                Err(e)
            }
        }
    }

    async fn kill(&mut self) {
        self.alive = false;
        if let Err(e) = self.child.kill().await {
            debug!(error = %e, "sandbox driver already gone");
        }
        if let Some(container) = self.container.take() {
            container.stop().await;
        }
    }

    fn bounded(&self, output: &str) -> String {
        truncate_output(output, self.config.max_output_bytes)
    }
}

impl Drop for ProcessExecutor {
    fn drop(&mut self) {
        if let Some(container) = self.container.take() {
            container.stop_detached();
        }
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    async fn load_documents(&mut self, documents: &[Document]) -> SandboxResult<()> {
        self.control(json!({ "op": "load", "documents": documents }))
            .await
    }

    async fn execute(&mut self, code: &str, subcalls: &dyn SubcallHandler) -> ExecutionOutcome {
        if !self.alive {
            return ExecutionOutcome::error("sandbox runtime is not running");
        }

        let deadline = Deadline::after(self.config.exec_timeout_ms);
        match self.channel.exchange(code, subcalls, deadline).await {
            Ok(reply) => {
                let output = self.bounded(&reply.output);
                match (reply.ok, reply.final_answer) {
                    (true, Some(answer)) => ExecutionOutcome::finished(output, &answer),
                    (true, None) => ExecutionOutcome::ok(output),
                    (false, _) => ExecutionOutcome::error(output),
                }
            }
            Err(SandboxError::Timeout { limit_ms }) => {
                warn!(limit_ms, "snippet exceeded execution timeout; killing runtime");
                self.kill().await;
                ExecutionOutcome::timeout(format!(
                    "execution timed out after {limit_ms}ms; interpreter state was lost"
                ))
            }
            Err(e) => {
                self.kill().await;
                ExecutionOutcome::error(format!("sandbox failure: {e}"))
            }
        }
    }

    async fn reset(&mut self) -> SandboxResult<()> {
        self.control(json!({ "op": "reset" })).await
    }

    fn is_alive(&self) -> bool {
        self.alive
    }
}

/// Builds [`ProcessExecutor`]s for the pool.
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutorFactory {
    config: ProcessExecutorConfig,
}

impl ProcessExecutorFactory {
    pub fn new(config: ProcessExecutorConfig) -> Self {
        if matches!(config.runtime, RuntimeMode::Local { .. }) {
            warn!("local runtime selected: snippets run without container isolation");
        }
        Self { config }
    }
}

#[async_trait]
impl ExecutorFactory for ProcessExecutorFactory {
    async fn create(&self, security: &SecurityConfig) -> SandboxResult<Box<dyn Executor>> {
        let executor = ProcessExecutor::spawn(self.config.clone(), security).await?;
        Ok(Box::new(executor))
    }
}
