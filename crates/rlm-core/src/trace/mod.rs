//! Query traces: append-only, per-frame records for audit and replay.
//!
//! - [`step`]    : `StepKind` and `TraceStep`
//! - [`recorder`]: `TraceRecorder`, `Trace`, header and summary
//! - [`sink`]    : `TraceSink` implementations (JSON lines, memory, null)

pub mod recorder;
pub mod sink;
pub mod step;

pub use recorder::{Trace, TraceHeader, TraceRecorder, TraceSummary};
pub use sink::{
    JsonlTraceSink, MemoryTraceSink, NullTraceSink, TraceError, TraceRecord, TraceResult,
    TraceSink,
};
pub use step::{StepKind, TraceStep};
