//! RLM - recursive document query CLI
//!
//! The `rlm` command answers questions over a set of text files by letting a
//! model write Python that inspects them in a sandbox.
//!
//! ## Commands
//!
//! - `query`: run a question over files (Ctrl-C cancels between iterations)
//! - `verify`: check an answer's citations and quotes against files, no LLM
//! - `detect`: report whether a file set is code or general text

mod ratelimit;
mod transport;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rlm_core::metrics::METRICS;
use rlm_core::{
    detect_content_type, verify_answer, CancelSignal, Document, EngineConfig, ExecutorPool,
    JsonlTraceSink, PoolConfig, ProcessExecutorConfig, ProcessExecutorFactory, QueryEngine,
    QueryResult, QueryStatus, RuntimeMode,
};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};

use transport::{HttpTransport, HttpTransportConfig};

#[derive(Parser)]
#[command(name = "rlm")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Recursive document query engine", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a question over one or more text files
    Query {
        /// The question to answer
        question: String,

        /// Documents to query, in citation order ([Doc 0] is the first)
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Engine configuration (JSON); unset fields keep their defaults
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the iteration cap for this query
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Append trace records to this JSON-lines file
        #[arg(long)]
        trace: Option<PathBuf>,

        /// Number of sandbox executors
        #[arg(long, default_value = "2")]
        pool_size: usize,

        /// Run snippets with this local interpreter instead of a container (no isolation)
        #[arg(long)]
        local_python: Option<String>,

        /// Container image for the sandbox
        #[arg(long, default_value = "python:3.12-slim")]
        image: String,

        /// Chat-completions API root
        #[arg(long, env = "RLM_API_BASE", default_value = "https://api.openai.com/v1")]
        api_base: String,

        /// API key sent as a bearer token
        #[arg(long, env = "RLM_API_KEY", hide_env_values = true)]
        api_key: Option<String>,

        /// Model name
        #[arg(long, env = "RLM_MODEL", default_value = "gpt-4o-mini")]
        model: String,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Check an answer's [Doc N] citations and quotes against files
    Verify {
        /// Answer text, or `@path` to read it from a file
        answer: String,

        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Classify a file set as code or general text
    Detect {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

/// Options for `rlm query`, gathered from flags.
struct QueryArgs {
    question: String,
    files: Vec<PathBuf>,
    config: Option<PathBuf>,
    max_iterations: Option<u32>,
    trace: Option<PathBuf>,
    pool_size: usize,
    runtime: RuntimeMode,
    transport: HttpTransportConfig,
    format: OutputFormat,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    rlm_core::init_tracing(cli.json, level);

    let outcome = match cli.command {
        Commands::Query {
            question,
            files,
            config,
            max_iterations,
            trace,
            pool_size,
            local_python,
            image,
            api_base,
            api_key,
            model,
            format,
        } => {
            let args = QueryArgs {
                question,
                files,
                config,
                max_iterations,
                trace,
                pool_size,
                runtime: runtime_mode(local_python, image),
                transport: HttpTransportConfig {
                    base_url: api_base,
                    model,
                    api_key,
                    ..HttpTransportConfig::default()
                },
                format,
            };
            cmd_query(args).await
        }
        Commands::Verify {
            answer,
            files,
            format,
        } => cmd_verify(&answer, &files, format),
        Commands::Detect { files } => cmd_detect(&files),
    };

    METRICS.flush();
    outcome
}

fn runtime_mode(local_python: Option<String>, image: String) -> RuntimeMode {
    match local_python {
        Some(python) => RuntimeMode::Local { python },
        None => match RuntimeMode::default() {
            RuntimeMode::Container {
                engine,
                memory_limit,
                cpus,
                ..
            } => RuntimeMode::Container {
                engine,
                image,
                memory_limit,
                cpus,
            },
            local => local,
        },
    }
}

async fn cmd_query(args: QueryArgs) -> Result<()> {
    let documents = load_documents(&args.files)?;

    let mut config = match &args.config {
        Some(path) => read_json_file::<EngineConfig>(path)?,
        None => EngineConfig::default(),
    };
    if let Some(n) = args.max_iterations {
        config.max_iterations = n;
    }

    let transport = HttpTransport::new(args.transport).context("Failed to build HTTP client")?;
    let factory = ProcessExecutorFactory::new(ProcessExecutorConfig {
        runtime: args.runtime,
        ..ProcessExecutorConfig::default()
    });
    let pool = ExecutorPool::new(
        Arc::new(factory),
        PoolConfig {
            size: args.pool_size,
            acquire_timeout_ms: config.acquire_timeout_ms,
            ..PoolConfig::default()
        },
    )
    .context("Invalid executor pool settings")?;

    let mut engine = QueryEngine::new(Arc::new(transport), Arc::new(pool), config)
        .context("Invalid engine configuration")?;
    if let Some(path) = &args.trace {
        let sink = JsonlTraceSink::open(path)
            .with_context(|| format!("Failed to open trace file: {:?}", path))?;
        engine = engine.with_trace_sink(Arc::new(sink));
    }

    let cancel = CancelSignal::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(event = "cli.interrupt", "interrupt received, stopping after this iteration");
            on_interrupt.cancel();
        }
    });

    info!(
        event = "cli.query",
        documents = documents.len(),
        "running query"
    );
    let result = engine.query(documents, args.question, cancel).await;

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        OutputFormat::Text => println!("{}", render_result_text(&result)),
    }

    if let QueryStatus::Failed { message, .. } = &result.status {
        anyhow::bail!("query failed: {message}");
    }
    Ok(())
}

fn cmd_verify(answer: &str, files: &[PathBuf], format: OutputFormat) -> Result<()> {
    let answer = match answer.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read answer file: {path}"))?,
        None => answer.to_string(),
    };
    let documents = load_documents(files)?;
    let report = verify_answer(&answer, &documents);

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => {
            println!("{}", report.summary());
            for c in &report.citations {
                let mark = if c.found { "ok" } else { "MISSING" };
                println!("  [Doc {}] {mark}", c.doc_index);
            }
            for q in &report.quotes {
                let location = match q.doc_index {
                    Some(idx) => format!("Doc {idx}"),
                    None => "not found".to_string(),
                };
                println!("  \"{}\" -> {location}", truncate(&q.text, 60));
            }
        }
    }
    Ok(())
}

fn cmd_detect(files: &[PathBuf]) -> Result<()> {
    let names: Vec<String> = files.iter().map(|p| p.display().to_string()).collect();
    println!("{}", detect_content_type(&names));
    Ok(())
}

/// Read files as documents; the id is the path as given.
fn load_documents(files: &[PathBuf]) -> Result<Vec<Document>> {
    files
        .iter()
        .map(|path| {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read document: {:?}", path))?;
            Ok(Document::new(path.display().to_string(), text))
        })
        .collect()
}

fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read JSON file: {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid JSON in {:?}", path))
}

fn render_result_text(result: &QueryResult) -> String {
    let mut out = String::new();
    if !result.answer.is_empty() {
        out.push_str(&result.answer);
        out.push_str("\n\n");
    }
    out.push_str(&format!(
        "status: {}\niterations: {}\ntokens: {} prompt / {} completion\ntime: {} ms",
        result.status.label(),
        result.trace.total_iterations(),
        result.token_usage.prompt_tokens,
        result.token_usage.completion_tokens,
        result.execution_time_ms
    ));
    match &result.status {
        QueryStatus::Rejected { reason } => out.push_str(&format!("\nrejected: {reason}")),
        QueryStatus::Failed { message, .. } => out.push_str(&format!("\nerror: {message}")),
        _ => {}
    }
    if let Some(report) = &result.verification {
        out.push_str(&format!("\nverification: {}", report.summary()));
    }
    if let Some(semantic) = &result.semantic_verification {
        out.push_str(&format!("\nsemantic: {}", semantic.summary()));
    }
    out
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_chars).collect();
        format!("{head}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_query() {
        let cli = Cli::try_parse_from([
            "rlm",
            "--verbose",
            "query",
            "what color is the sky?",
            "a.txt",
            "b.txt",
            "--local-python",
            "python3",
            "--max-iterations",
            "5",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Query {
                question,
                files,
                local_python,
                max_iterations,
                format,
                ..
            } => {
                assert_eq!(question, "what color is the sky?");
                assert_eq!(files.len(), 2);
                assert_eq!(local_python.as_deref(), Some("python3"));
                assert_eq!(max_iterations, Some(5));
                assert_eq!(format, OutputFormat::Text);
            }
            _ => panic!("expected query command"),
        }
    }

    #[test]
    fn test_query_requires_files() {
        assert!(Cli::try_parse_from(["rlm", "query", "q"]).is_err());
    }

    #[test]
    fn test_runtime_mode_selection() {
        assert_eq!(
            runtime_mode(Some("python3".into()), "ignored".into()),
            RuntimeMode::Local {
                python: "python3".into()
            }
        );
        match runtime_mode(None, "custom:latest".into()) {
            RuntimeMode::Container { image, .. } => assert_eq!(image, "custom:latest"),
            other => panic!("unexpected runtime {other:?}"),
        }
    }

    #[test]
    fn test_load_documents_uses_paths_as_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "The sky is blue.").unwrap();

        let docs = load_documents(&[path.clone()]).unwrap();
        assert_eq!(docs[0].id, path.display().to_string());
        assert_eq!(docs[0].text, "The sky is blue.");

        assert!(load_documents(&[dir.path().join("missing.txt")]).is_err());
    }

    #[test]
    fn test_engine_config_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{"max_iterations": 4}"#).unwrap();

        let config: EngineConfig = read_json_file(&path).unwrap();
        assert_eq!(config.max_iterations, 4);
        assert_eq!(config.max_depth, EngineConfig::default().max_depth);
    }

    #[test]
    fn test_verify_reads_answer_file() {
        let dir = tempfile::tempdir().unwrap();
        let doc = dir.path().join("doc.txt");
        std::fs::write(&doc, "The sky is blue.").unwrap();
        let answer = dir.path().join("answer.txt");
        std::fs::write(&answer, "The sky is blue. [Doc 0]").unwrap();

        let arg = format!("@{}", answer.display());
        assert!(cmd_verify(&arg, &[doc], OutputFormat::Json).is_ok());
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghij", 3), "abc...");
    }
}
