//! Deterministic citation and quote checks against the source documents.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::Document;

/// Quotes shorter than this many characters are ignored.
pub const MIN_QUOTE_CHARS: usize = 10;

// `[Doc N]`, `[Document N]`, `Doc **N**`, `Doc N`, `Document N`.
const DOC_CITATION: &str = r"(?i:\bdoc(?:ument)?)\s*\*{0,2}\s*(\d+)\s*\*{0,2}";
// `context[N]`, `documents[N]`.
const INDEX_CITATION: &str = r"\b(?:context|documents)\[\s*(\d+)\s*\]";
const QUOTED: &str = r#""([^"\n]+)"|`([^`\n]+)`"#;

struct Patterns {
    citation: Regex,
    quote: Regex,
}

impl Patterns {
    fn compile() -> Result<Self, regex::Error> {
        Ok(Self {
            citation: Regex::new(&format!("{DOC_CITATION}|{INDEX_CITATION}"))?,
            quote: Regex::new(QUOTED)?,
        })
    }
}

fn patterns() -> Option<&'static Patterns> {
    static PATTERNS: OnceLock<Result<Patterns, regex::Error>> = OnceLock::new();
    PATTERNS.get_or_init(Patterns::compile).as_ref().ok()
}

/// Document indices cited in `text`, in first-appearance order, de-duplicated.
pub fn extract_citations(text: &str) -> Vec<usize> {
    let Some(p) = patterns() else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    p.citation
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)))
        .filter_map(|m| m.as_str().parse::<usize>().ok())
        .filter(|idx| seen.insert(*idx))
        .collect()
}

/// Spans in double quotes or backticks of at least [`MIN_QUOTE_CHARS`]
/// characters, in first-appearance order, de-duplicated.
pub fn extract_quotes(text: &str) -> Vec<String> {
    let Some(p) = patterns() else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    p.quote
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)))
        .map(|m| m.as_str().to_string())
        .filter(|q| q.chars().count() >= MIN_QUOTE_CHARS)
        .filter(|q| seen.insert(q.clone()))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub doc_index: usize,
    pub found: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub text: String,
    /// First document containing the quote verbatim.
    pub doc_index: Option<usize>,
    pub found: bool,
}

/// Outcome of the syntactic pass over one answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub citations: Vec<Citation>,
    pub quotes: Vec<Quote>,
    pub all_valid: bool,
}

impl VerificationReport {
    /// Indices of citations that resolved to a document.
    pub fn valid_citations(&self) -> impl Iterator<Item = usize> + '_ {
        self.citations.iter().filter(|c| c.found).map(|c| c.doc_index)
    }

    pub fn invalid_count(&self) -> usize {
        self.citations.iter().filter(|c| !c.found).count()
            + self.quotes.iter().filter(|q| !q.found).count()
    }

    /// Human-readable one-liner for trace steps.
    pub fn summary(&self) -> String {
        format!(
            "citations {}/{} found, quotes {}/{} found, all_valid={}",
            self.citations.iter().filter(|c| c.found).count(),
            self.citations.len(),
            self.quotes.iter().filter(|q| q.found).count(),
            self.quotes.len(),
            self.all_valid
        )
    }
}

/// Check every citation and quote in `answer` against `documents`.
pub fn verify_answer(answer: &str, documents: &[Document]) -> VerificationReport {
    let citations: Vec<Citation> = extract_citations(answer)
        .into_iter()
        .map(|doc_index| Citation {
            doc_index,
            found: doc_index < documents.len(),
        })
        .collect();

    let quotes: Vec<Quote> = extract_quotes(answer)
        .into_iter()
        .map(|text| {
            let doc_index = documents.iter().position(|d| d.text.contains(&text));
            Quote {
                found: doc_index.is_some(),
                doc_index,
                text,
            }
        })
        .collect();

    let all_valid = citations.iter().all(|c| c.found) && quotes.iter().all(|q| q.found);
    VerificationReport {
        citations,
        quotes,
        all_valid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patterns_compile() {
        assert!(Patterns::compile().is_ok());
    }

    #[test]
    fn test_extract_citations_mixed_forms() {
        assert_eq!(extract_citations("Doc **3** and context[7]"), vec![3, 7]);
        assert_eq!(
            extract_citations("[Doc 1], [Document 2], Document 1, documents[4], doc 2"),
            vec![1, 2, 4]
        );
    }

    #[test]
    fn test_extract_citations_deduplicates_recurring() {
        assert_eq!(
            extract_citations("Doc **3** and context[7]; again Doc 3 and context[7]"),
            vec![3, 7]
        );
        assert!(extract_citations("no references at all").is_empty());
    }

    #[test]
    fn test_extract_quotes_min_length() {
        let text = r#"He said "hello world example" and `x = 1` is short"#;
        assert_eq!(extract_quotes(text), vec!["hello world example"]);
    }

    #[test]
    fn test_extract_quotes_backticks_and_dedup() {
        let text = "`fn main() {}` then \"fn main() {}\" again `fn main() {}`";
        assert_eq!(extract_quotes(text), vec!["fn main() {}"]);
    }

    #[test]
    fn test_verify_answer_all_valid() {
        let docs = vec![Document::new("sky.txt", "The sky is blue.")];
        let report = verify_answer("The sky is blue. [Doc 0]", &docs);
        assert_eq!(
            report.citations,
            vec![Citation {
                doc_index: 0,
                found: true
            }]
        );
        assert!(report.all_valid);
    }

    #[test]
    fn test_verify_answer_flags_missing_items() {
        let docs = vec![
            Document::new("a.txt", "alpha beta gamma"),
            Document::new("b.txt", "the quick brown fox jumps"),
        ];
        let report = verify_answer(
            r#"See [Doc 5]; "the quick brown fox" and "not in any document""#,
            &docs,
        );
        assert!(!report.all_valid);
        assert_eq!(report.invalid_count(), 2);
        assert_eq!(report.quotes[0].doc_index, Some(1));
        assert!(report.quotes[0].found);
        assert!(!report.quotes[1].found);
        assert_eq!(report.valid_citations().count(), 0);
    }

    #[test]
    fn test_verify_answer_without_items_is_valid() {
        let report = verify_answer("plain answer", &[]);
        assert!(report.all_valid);
        assert!(report.summary().contains("all_valid=true"));
    }
}
