//! Trace sinks: where header/step/summary records go as they happen.
//!
//! [`JsonlTraceSink`] writes one JSON object per line, each tagged with
//! `"type": "header" | "step" | "summary"`, for external viewers to tail.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::recorder::{TraceHeader, TraceSummary};
use super::step::TraceStep;

/// Errors produced while persisting trace records.
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for trace persistence.
pub type TraceResult<T> = std::result::Result<T, TraceError>;

/// One line of the trace log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceRecord {
    Header(TraceHeader),
    Step {
        query_id: Uuid,
        #[serde(flatten)]
        step: TraceStep,
    },
    Summary(TraceSummary),
}

/// Destination for trace records. Shared by every frame of a query tree.
pub trait TraceSink: Send + Sync {
    fn write(&self, record: &TraceRecord) -> TraceResult<()>;
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTraceSink;

impl TraceSink for NullTraceSink {
    fn write(&self, _record: &TraceRecord) -> TraceResult<()> {
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Keeps records in memory, in write order.
#[derive(Debug, Default)]
pub struct MemoryTraceSink {
    records: Mutex<Vec<TraceRecord>>,
}

impl MemoryTraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TraceRecord> {
        lock(&self.records).clone()
    }
}

impl TraceSink for MemoryTraceSink {
    fn write(&self, record: &TraceRecord) -> TraceResult<()> {
        lock(&self.records).push(record.clone());
        Ok(())
    }
}

/// Appends records to a file as JSON lines, flushing after each one.
#[derive(Debug)]
pub struct JsonlTraceSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlTraceSink {
    /// Open (creating or appending to) `path`.
    pub fn open(path: impl AsRef<Path>) -> TraceResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TraceSink for JsonlTraceSink {
    fn write(&self, record: &TraceRecord) -> TraceResult<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut writer = lock(&self.writer);
        writer.write_all(&line)?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::step::StepKind;
    use tempfile::tempdir;

    #[test]
    fn test_step_record_is_flat_and_tagged() {
        let record = TraceRecord::Step {
            query_id: Uuid::nil(),
            step: TraceStep::new(StepKind::CodeOutput, 2, "ok"),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "step");
        assert_eq!(json["step_type"], "CODE_OUTPUT");
        assert_eq!(json["iteration"], 2);
    }

    #[test]
    fn test_jsonl_sink_appends_lines() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("traces").join("q.jsonl");
        let sink = JsonlTraceSink::open(&path).expect("open");

        for i in 1..=3 {
            sink.write(&TraceRecord::Step {
                query_id: Uuid::nil(),
                step: TraceStep::new(StepKind::CodeGenerated, i, format!("step {i}")),
            })
            .expect("write");
        }

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        let last: serde_json::Value = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(last["content"], "step 3");
    }

    #[test]
    fn test_memory_sink_keeps_order() {
        let sink = MemoryTraceSink::new();
        for i in 0..2 {
            sink.write(&TraceRecord::Step {
                query_id: Uuid::nil(),
                step: TraceStep::new(StepKind::Error, i, "x"),
            })
            .unwrap();
        }
        let records = sink.records();
        assert_eq!(records.len(), 2);
    }
}
