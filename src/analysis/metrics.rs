//! Purely local per-file metrics.
//!
//! No LLM involvement: the static analyzer reads each analyzable file once
//! and produces the [`FileSummary`] that drives rule-based findings, cluster
//! building, and deep-dive selection.

use serde::{Deserialize, Serialize};

use crate::chunking::semantic::language_key;

/// Decision keywords counted toward heuristic cyclomatic complexity.
const DECISION_KEYWORDS: &[&str] = &[
    "if ", "if(", "else if", "elif ", "for ", "for(", "foreach", "while ", "while(", "case ",
    "catch ", "catch(", "when ", "rescue ",
];

/// Local metrics for one analyzable file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSummary {
    /// Path relative to the extraction root
    pub relative_path: String,
    /// Language key
    pub language: String,
    /// Non-blank, non-comment lines
    pub loc: usize,
    /// Raw line count
    pub total_lines: usize,
    /// Heuristic cyclomatic complexity over the whole file
    pub complexity: u32,
    /// Type declarations found
    pub type_count: usize,
    /// Method/function declarations found
    pub method_count: usize,
    /// Tag carried over from the router's risk filter
    pub is_high_risk: bool,
    /// File-level embedding, when the indexing phase produced one
    pub embedding: Option<Vec<f32>>,
}

/// Computes one [`FileSummary`] per file; no I/O of its own.
pub struct StaticAnalyzer;

impl StaticAnalyzer {
    /// Create an analyzer.
    pub fn new() -> Self {
        Self
    }

    /// Summarize one file's content.
    pub fn summarize(&self, relative_path: &str, content: &str) -> FileSummary {
        let mut loc = 0usize;
        let mut total_lines = 0usize;
        let mut complexity = 1u32;
        let mut type_count = 0usize;
        let mut method_count = 0usize;

        let mut in_block_comment = false;
        for line in content.lines() {
            total_lines += 1;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            if in_block_comment {
                if trimmed.contains("*/") {
                    in_block_comment = false;
                }
                continue;
            }
            if trimmed.starts_with("/*") {
                in_block_comment = !trimmed.contains("*/");
                continue;
            }
            if trimmed.starts_with("//") || trimmed.starts_with('#') || trimmed.starts_with('*') {
                continue;
            }

            loc += 1;
            complexity += decision_points(trimmed);
            if is_type_declaration(trimmed) {
                type_count += 1;
            }
            if is_method_declaration(trimmed) {
                method_count += 1;
            }
        }

        FileSummary {
            relative_path: relative_path.to_string(),
            language: language_key(relative_path),
            loc,
            total_lines,
            complexity,
            type_count,
            method_count,
            is_high_risk: false,
            embedding: None,
        }
    }
}

impl Default for StaticAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

fn decision_points(line: &str) -> u32 {
    let mut points = 0u32;
    for keyword in DECISION_KEYWORDS {
        points += line.matches(keyword).count() as u32;
    }
    points += line.matches("&&").count() as u32;
    points += line.matches("||").count() as u32;
    points
}

fn is_type_declaration(line: &str) -> bool {
    let words: Vec<&str> = line
        .split(|c: char| c.is_whitespace() || c == '{' || c == '(' || c == ':' || c == '<')
        .filter(|w| !w.is_empty())
        .collect();
    words.iter().enumerate().any(|(i, w)| {
        matches!(*w, "class" | "struct" | "interface" | "record" | "enum" | "trait")
            && words.get(i + 1).is_some()
    })
}

fn is_method_declaration(line: &str) -> bool {
    let trimmed = line.trim_start();
    let keyword_start = ["def ", "fn ", "func ", "function ", "sub "]
        .iter()
        .any(|k| {
            trimmed.starts_with(k)
                || trimmed.contains(&format!(" {k}"))
                || trimmed.contains(&format!("pub {k}"))
        });
    if keyword_start {
        return true;
    }
    // C-family method shape: modifiers, a name with parameters, then a body
    // opener on the same line.
    trimmed.contains('(')
        && trimmed.ends_with('{')
        && !trimmed.starts_with("if")
        && !trimmed.starts_with("for")
        && !trimmed.starts_with("while")
        && !trimmed.starts_with("switch")
        && !trimmed.starts_with("catch")
        && !trimmed.starts_with("return")
}
