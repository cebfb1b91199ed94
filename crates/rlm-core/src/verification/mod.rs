//! Post-hoc answer verification.
//!
//! The syntactic pass ([`verify_answer`]) is a pure text scan: citations must
//! name an existing document and quotes must appear verbatim in one. The
//! semantic pass ([`SemanticVerifier`]) asks the model whether the confirmed
//! citations actually support their sentences. Neither pass ever blocks an
//! answer on its own; the engine's policy decides what a failure means.

pub mod content_type;
pub mod semantic;
pub mod syntactic;

pub use content_type::{detect_content_type, ContentType};
pub use semantic::{
    build_claims, Claim, Confidence, FindingVerification, SemanticVerificationReport,
    SemanticVerifier, DEFAULT_EXCERPT_CHARS,
};
pub use syntactic::{
    extract_citations, extract_quotes, verify_answer, Citation, Quote, VerificationReport,
    MIN_QUOTE_CHARS,
};
