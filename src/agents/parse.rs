//! Parsing of LLM responses into findings.
//!
//! LLM output arrives contaminated: markdown fences, leading prose, trailing
//! commentary. The extractor locates the outermost balanced `[ ... ]` while
//! respecting string literals and escapes, then each element deserializes
//! leniently — unknown fields ignored, common key aliases accepted, unknown
//! enum strings normalized downstream.

use tracing::debug;

use crate::core::entities::AgentFinding;

/// Minimum confidence for a finding with neither a file nor a symbol anchor.
pub const ANCHORLESS_CONFIDENCE_FLOOR: f64 = 0.3;

/// Extract the outermost balanced JSON array from contaminated text.
pub fn extract_json_array(raw: &str) -> Option<&str> {
    let bytes = raw.as_bytes();
    let start = raw.find('[')?;

    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match byte {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'[' if !in_string => depth += 1,
            b']' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse an LLM response into findings, applying the anchorless-confidence
/// drop rule. Malformed elements are skipped, never fatal.
pub fn parse_findings(raw: &str) -> Vec<AgentFinding> {
    let Some(array_text) = extract_json_array(raw) else {
        debug!("no JSON array found in LLM response");
        return Vec::new();
    };

    let Ok(values) = serde_json::from_str::<Vec<serde_json::Value>>(array_text) else {
        debug!("extracted array failed to parse");
        return Vec::new();
    };

    let mut findings = Vec::new();
    for value in values {
        let Ok(finding) = serde_json::from_value::<AgentFinding>(value) else {
            continue;
        };
        if should_keep(&finding) {
            findings.push(finding);
        }
    }
    findings
}

/// Keep rule: an anchorless, low-confidence finding carries no evidence.
fn should_keep(finding: &AgentFinding) -> bool {
    let anchored = finding.file_path.as_deref().is_some_and(|p| !p.is_empty())
        || finding.symbol.as_deref().is_some_and(|s| !s.is_empty());
    anchored || finding.confidence >= ANCHORLESS_CONFIDENCE_FLOOR
}

/// Extract a deduplicated list of recommendation strings from a response
/// that may be a bare string array or an object array with a `text` field.
pub fn parse_recommendations(raw: &str) -> Vec<String> {
    let Some(array_text) = extract_json_array(raw) else {
        return Vec::new();
    };
    let Ok(values) = serde_json::from_str::<Vec<serde_json::Value>>(array_text) else {
        return Vec::new();
    };

    let mut seen = std::collections::HashSet::new();
    values
        .into_iter()
        .filter_map(|value| match value {
            serde_json::Value::String(s) => Some(s),
            serde_json::Value::Object(map) => map
                .get("text")
                .or_else(|| map.get("recommendation"))
                .and_then(|v| v.as_str())
                .map(str::to_string),
            _ => None,
        })
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && seen.insert(s.clone()))
        .collect()
}
