//! Query inputs: documents, the question and the cancellation signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// One source document. `id` doubles as its title and filename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub text: String,
}

impl Document {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
        }
    }
}

/// Cooperative cancellation flag shared between a caller and an engine.
///
/// Clones observe the same flag. The engine polls it only between
/// iterations, so an in-flight LLM call or execution always completes.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    flag: Arc<AtomicBool>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// A question over an ordered document set.
#[derive(Debug, Clone)]
pub struct Query {
    documents: Arc<[Document]>,
    question: String,
    cancel: CancelSignal,
}

impl Query {
    pub fn new(documents: Vec<Document>, question: impl Into<String>, cancel: CancelSignal) -> Self {
        Self {
            documents: documents.into(),
            question: question.into(),
            cancel,
        }
    }

    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    pub fn question(&self) -> &str {
        &self.question
    }

    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    pub(crate) fn shared_documents(&self) -> Arc<[Document]> {
        Arc::clone(&self.documents)
    }

    pub fn document_ids(&self) -> Vec<String> {
        self.documents.iter().map(|d| d.id.clone()).collect()
    }
}
