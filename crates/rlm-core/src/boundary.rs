//! Boundary defense: per-query random tokens that structurally mark untrusted text.
//!
//! Every string that originates outside the engine's own prompt templates is
//! wrapped between `<token>_BEGIN` and `<token>_END` before it is concatenated
//! into a prompt. The token carries 128 bits from the OS CSPRNG, so content
//! authored before the token existed cannot contain a genuine closing marker:
//! the *last* `<token>_END` in a string is always the real one.
//!
//! A [`Boundary`] deliberately does not implement `Serialize`; it must never
//! reach a persisted trace. Use [`Boundary::redact`] on anything that does.

use rand::rngs::OsRng;
use rand::RngCore;

/// Fixed marker prefix for every boundary token.
pub const BOUNDARY_PREFIX: &str = "RLM_BOUNDARY_";

/// Placeholder substituted for the token by [`Boundary::redact`].
pub const REDACTED_BOUNDARY: &str = "[BOUNDARY]";

const BEGIN_SUFFIX: &str = "_BEGIN";
const END_SUFFIX: &str = "_END";

/// A single-use boundary token: `RLM_BOUNDARY_` + 32 lowercase hex chars.
#[derive(Clone, PartialEq, Eq)]
pub struct Boundary {
    token: String,
}

impl Boundary {
    /// Generate a fresh boundary from 128 bits of OS randomness.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        Self {
            token: format!("{BOUNDARY_PREFIX}{}", hex::encode(bytes)),
        }
    }

    /// The full token, prefix included.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// The random hex portion (always 32 chars).
    pub fn hex(&self) -> &str {
        &self.token[BOUNDARY_PREFIX.len()..]
    }

    /// Opening marker: `<token>_BEGIN`.
    pub fn begin_marker(&self) -> String {
        format!("{}{BEGIN_SUFFIX}", self.token)
    }

    /// Closing marker: `<token>_END`.
    pub fn end_marker(&self) -> String {
        format!("{}{END_SUFFIX}", self.token)
    }

    /// Replace every occurrence of the token with [`REDACTED_BOUNDARY`].
    pub fn redact(&self, text: &str) -> String {
        text.replace(&self.token, REDACTED_BOUNDARY)
    }
}

// Debug must not leak the token into logs.
impl std::fmt::Debug for Boundary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Boundary").field("token", &REDACTED_BOUNDARY).finish()
    }
}

/// Wrap untrusted `content` between the boundary's begin and end markers.
pub fn wrap(content: &str, boundary: &Boundary) -> String {
    let begin = boundary.begin_marker();
    let end = boundary.end_marker();
    let mut out = String::with_capacity(content.len() + begin.len() + end.len() + 2);
    out.push_str(&begin);
    out.push('\n');
    out.push_str(content);
    out.push('\n');
    out.push_str(&end);
    out
}

/// Recover the original content from a wrapped string.
///
/// The opening marker is located at its first occurrence and the closing
/// marker at its last, so forged `_END` markers inside the content (of this
/// or any other boundary) stay part of the recovered text.
pub fn unwrap_last<'a>(wrapped: &'a str, boundary: &Boundary) -> Option<&'a str> {
    let begin = boundary.begin_marker();
    let end = boundary.end_marker();

    let start = wrapped.find(&begin)? + begin.len();
    let stop = wrapped.rfind(&end)?;
    if stop < start {
        return None;
    }

    let inner = &wrapped[start..stop];
    let inner = inner.strip_prefix('\n').unwrap_or(inner);
    Some(inner.strip_suffix('\n').unwrap_or(inner))
}

/// Remove every begin/end marker of `boundary` from `text`, together with
/// the newline [`wrap`] placed next to it.
pub fn strip_markers(text: &str, boundary: &Boundary) -> String {
    let begin = boundary.begin_marker();
    let end = boundary.end_marker();
    text.replace(&format!("{begin}\n"), "")
        .replace(&format!("\n{end}"), "")
        .replace(&begin, "")
        .replace(&end, "")
}
