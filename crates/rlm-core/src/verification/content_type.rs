//! Classify a document set as source code or general prose.

use std::path::Path;

use serde::{Deserialize, Serialize};

const CODE_EXTENSIONS: &[&str] = &[
    "py", "rs", "js", "jsx", "ts", "tsx", "go", "java", "kt", "scala", "c", "h", "cc", "cpp",
    "hpp", "cs", "rb", "php", "swift", "m", "sh", "bash", "zsh", "sql", "lua", "pl", "r", "hs",
    "ml", "ex", "exs", "erl", "clj", "dart", "zig", "nix", "toml", "yaml", "yml",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Code,
    General,
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContentType::Code => write!(f, "code"),
            ContentType::General => write!(f, "general"),
        }
    }
}

fn is_code_file(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            CODE_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
}

/// `Code` iff recognized code files are a strict majority of `names`.
pub fn detect_content_type<S: AsRef<str>>(names: &[S]) -> ContentType {
    let code = names.iter().filter(|n| is_code_file(n.as_ref())).count();
    if code * 2 > names.len() {
        ContentType::Code
    } else {
        ContentType::General
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_majority() {
        assert_eq!(
            detect_content_type(&["a.py", "b.rs", "c.md"]),
            ContentType::Code
        );
    }

    #[test]
    fn test_general_documents() {
        assert_eq!(detect_content_type(&["a.md", "b.txt"]), ContentType::General);
        let empty: [&str; 0] = [];
        assert_eq!(detect_content_type(&empty), ContentType::General);
    }

    #[test]
    fn test_tie_is_not_majority() {
        assert_eq!(
            detect_content_type(&["main.rs", "README.md"]),
            ContentType::General
        );
    }

    #[test]
    fn test_extension_matching() {
        assert!(is_code_file("src/Lib.RS"));
        assert!(!is_code_file("Makefile"));
        assert!(!is_code_file("notes.py.txt"));
        assert_eq!(ContentType::Code.to_string(), "code");
    }
}
