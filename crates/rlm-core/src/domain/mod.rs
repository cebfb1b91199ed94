//! Domain types shared by the engine and its callers.

pub mod error;
pub mod query;
pub mod result;

pub use error::{FailureKind, QueryError};
pub use query::{CancelSignal, Document, Query};
pub use result::{QueryResult, QueryStatus, TokenUsage, INTERRUPTED_ANSWER, NO_ANSWER};
