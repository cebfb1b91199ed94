//! Classify a model response as code to run, a final answer, or neither.

use crate::sandbox::extract_final_answer;

const FENCE: &str = "```";
const CODE_TAGS: &[&str] = &["", "python", "py", "python3"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelAction {
    /// Concatenated body of every Python code block.
    Code(String),
    /// A `FINAL_ANSWER:` line outside any code block.
    Final(String),
    Neither,
}

impl ModelAction {
    pub fn label(&self) -> &'static str {
        match self {
            ModelAction::Code(_) => "code",
            ModelAction::Final(_) => "final",
            ModelAction::Neither => "neither",
        }
    }
}

/// Split `text` into fenced Python blocks and the prose around them.
fn split_fences(text: &str) -> (Vec<&str>, String) {
    let mut blocks = Vec::new();
    let mut prose = String::new();
    let mut rest = text;

    while let Some(open) = rest.find(FENCE) {
        prose.push_str(&rest[..open]);
        let after = &rest[open + FENCE.len()..];
        let Some(line_end) = after.find('\n') else {
            rest = "";
            break;
        };
        let tag = after[..line_end].trim();
        let body = &after[line_end + 1..];
        let (inner, remainder) = match body.find(FENCE) {
            Some(close) => (&body[..close], &body[close + FENCE.len()..]),
            None => (body, ""),
        };
        if CODE_TAGS.iter().any(|t| t.eq_ignore_ascii_case(tag)) {
            if !inner.trim().is_empty() {
                blocks.push(inner.trim_end());
            }
        } else {
            prose.push_str(inner);
        }
        rest = remainder;
    }
    prose.push_str(rest);
    (blocks, prose)
}

/// Code wins over a prose final answer: the answer may depend on output the
/// model has not seen yet.
pub fn parse_response(text: &str) -> ModelAction {
    let (blocks, prose) = split_fences(text);
    if !blocks.is_empty() {
        return ModelAction::Code(blocks.join("\n"));
    }
    match extract_final_answer(&prose) {
        Some(answer) => ModelAction::Final(answer),
        None => ModelAction::Neither,
    }
}
