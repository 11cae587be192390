//! Finding aggregation and report synthesis.
//!
//! Turns noisy per-agent findings into one stable report: empty findings
//! are dropped with a recorded reason, fingerprint groups are optionally
//! consolidated by one LLM call each, the merge rules are deterministic, an
//! evidence gate drops unanchored guesses, and the health score is a pure
//! function of the surviving severity counts. Every LLM step has a
//! non-LLM fallback; aggregation itself never fails on LLM trouble.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agents::llm::ChatClient;
use crate::agents::orchestrator::AgentResponse;
use crate::agents::parse::{parse_findings, parse_recommendations};
use crate::core::entities::{AgentFinding, Category, Report, ReviewFinding, Severity};
use crate::core::errors::Result;
use crate::report::score::{assessment_phrase, health_score};
use crate::storage::records::ReportStore;

/// Confidence above which a merged group escalates to High severity.
const ESCALATION_CONFIDENCE: f64 = 0.85;

/// Number of High members that escalates a merged group.
const ESCALATION_HIGH_MEMBERS: usize = 2;

/// Skipped entries shown in the summary.
const MAX_SKIPPED_LISTED: usize = 20;

/// Aggregates agent responses into a persisted report.
pub struct ReportAggregator {
    chat: Arc<dyn ChatClient>,
    store: Arc<dyn ReportStore>,
}

impl ReportAggregator {
    /// Create an aggregator over a chat client and report store.
    pub fn new(chat: Arc<dyn ChatClient>, store: Arc<dyn ReportStore>) -> Self {
        Self { chat, store }
    }

    /// Run the full aggregation procedure and persist the report.
    pub async fn aggregate(
        &self,
        project_id: Uuid,
        responses: &[AgentResponse],
        duration_ms: u64,
    ) -> Result<Report> {
        // Step 1: drop findings without a description, keeping the reason.
        let mut skipped: Vec<String> = Vec::new();
        let mut usable: Vec<AgentFinding> = Vec::new();
        for response in responses {
            for finding in &response.findings {
                if finding.description.trim().is_empty() {
                    skipped.push(format!(
                        "{}: finding without description ({})",
                        response.agent,
                        finding.file_path.as_deref().unwrap_or("no file")
                    ));
                } else {
                    usable.push(finding.clone());
                }
            }
        }

        // Step 2: fingerprint grouping with optional LLM consolidation.
        let mut groups: BTreeMap<String, Vec<AgentFinding>> = BTreeMap::new();
        for finding in usable {
            groups.entry(finding.fingerprint()).or_default().push(finding);
        }
        let mut merged: Vec<AgentFinding> = Vec::new();
        for (fingerprint, members) in groups {
            let members = self.synthesize_group(&fingerprint, members).await;
            if let Some(candidate) = merge_group(members) {
                merged.push(candidate);
            }
        }

        // Step 5: normalize to closed enums, re-dedup, and order.
        let report_id = Uuid::new_v4();
        let mut findings = materialize(project_id, report_id, merged);
        findings.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| a.file_path.cmp(&b.file_path))
        });

        let high = count(&findings, Severity::High);
        let medium = count(&findings, Severity::Medium);
        let low = count(&findings, Severity::Low);
        let score = health_score(high, medium, low);

        // Step 6: cross-file narrative with a heuristic fallback.
        let narrative = self.narrative(&findings).await;

        // Step 8: recommendations, preferring LLM-supplied ones.
        let recommendations = self
            .llm_recommendations(&findings)
            .await
            .unwrap_or_else(|| {
                let mut seen = std::collections::HashSet::new();
                responses
                    .iter()
                    .flat_map(|r| r.recommendations.iter())
                    .map(|r| r.trim().to_string())
                    .filter(|r| !r.is_empty() && seen.insert(r.clone()))
                    .take(10)
                    .collect()
            });

        // Step 7: assemble the summary.
        let summary = build_summary(&narrative, score, &findings, responses, &skipped);

        // Step 10: persist report and findings together.
        let mut report = Report::new(project_id, summary, recommendations, score, duration_ms);
        report.id = report_id;
        report.record_counts(&findings);

        self.store.persist(report.clone(), findings).await?;
        info!(project = %project_id, score, "report persisted");
        Ok(report)
    }

    /// One LLM call per multi-member group; pass-through on any failure.
    async fn synthesize_group(
        &self,
        fingerprint: &str,
        members: Vec<AgentFinding>,
    ) -> Vec<AgentFinding> {
        if members.len() < 2 {
            return members;
        }

        let serialized = match serde_json::to_string_pretty(&members) {
            Ok(s) => s,
            Err(_) => return members,
        };
        let prompt = format!(
            "Multiple reviewers reported overlapping findings (fingerprint \
             '{fingerprint}'). Rewrite them into ONE consolidated finding.\n\
             Return ONLY a JSON array with a single element carrying: \
             file_path, symbol, category, severity, description, explanation, \
             suggested_fix, confidence.\n\n{serialized}"
        );

        match self.chat.complete(&prompt, "finding-synthesis").await {
            Ok(response) => {
                let parsed = parse_findings(&response);
                if parsed.is_empty() {
                    members
                } else {
                    parsed
                }
            }
            Err(err) => {
                warn!("group synthesis failed, passing through originals: {err}");
                members
            }
        }
    }

    async fn narrative(&self, findings: &[ReviewFinding]) -> String {
        if findings.is_empty() {
            return "No significant findings were identified.".to_string();
        }

        let digest = findings
            .iter()
            .take(15)
            .map(|f| {
                format!(
                    "- [{}] {} ({})",
                    f.severity.as_str(),
                    f.description.lines().next().unwrap_or(""),
                    f.file_path.as_deref().unwrap_or("project-wide")
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            "Write a short narrative (3-5 sentences, plain prose, no lists) \
             connecting these review findings into a coherent picture of the \
             codebase:\n{digest}"
        );

        match self.chat.complete(&prompt, "report-narrative").await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            _ => heuristic_narrative(findings),
        }
    }

    async fn llm_recommendations(&self, findings: &[ReviewFinding]) -> Option<Vec<String>> {
        if findings.is_empty() {
            return None;
        }
        let digest = findings
            .iter()
            .take(15)
            .map(|f| format!("- [{}] {}", f.severity.as_str(), f.description.lines().next().unwrap_or("")))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Given these review findings, return ONLY a JSON array of up to \
             ten short, actionable recommendation strings, most important \
             first:\n{digest}"
        );

        match self.chat.complete(&prompt, "report-recommendations").await {
            Ok(response) => {
                let recommendations: Vec<String> =
                    parse_recommendations(&response).into_iter().take(10).collect();
                if recommendations.is_empty() {
                    None
                } else {
                    Some(recommendations)
                }
            }
            Err(err) => {
                warn!("recommendation synthesis failed: {err}");
                None
            }
        }
    }
}

/// Steps 3 and 4: deterministic merge plus the evidence gate.
fn merge_group(members: Vec<AgentFinding>) -> Option<AgentFinding> {
    if members.is_empty() {
        return None;
    }

    let severities: Vec<Severity> = members
        .iter()
        .map(|m| Severity::from_loose(&m.severity))
        .collect();
    let mut severity = severities.iter().copied().max().unwrap_or(Severity::Info);

    // Corroboration-based escalation; a lone finding never escalates
    // itself, however confident.
    if members.len() >= 2 {
        let high_members = severities.iter().filter(|s| **s == Severity::High).count();
        let avg_confidence =
            members.iter().map(|m| m.confidence).sum::<f64>() / members.len() as f64;
        if high_members >= ESCALATION_HIGH_MEMBERS || avg_confidence > ESCALATION_CONFIDENCE {
            severity = severity.max(Severity::High);
        }
    }

    let confidence = members
        .iter()
        .map(|m| m.confidence)
        .fold(0.0f64, f64::max);

    let file_path = unique_value(members.iter().map(|m| m.file_path.as_deref()));
    let symbol = unique_value(members.iter().map(|m| m.symbol.as_deref()));

    let description = members
        .iter()
        .map(|m| m.description.as_str())
        .collect::<Vec<_>>()
        .join("\n---\n");
    let explanation = members
        .iter()
        .map(|m| m.explanation.as_str())
        .filter(|e| !e.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");
    let suggested_fix = members
        .iter()
        .map(|m| m.suggested_fix.as_str())
        .find(|f| !f.is_empty())
        .unwrap_or("")
        .to_string();

    let start_line = members.iter().filter_map(|m| m.start_line).min();
    let end_line = members.iter().filter_map(|m| m.end_line).max();

    let candidate = AgentFinding {
        id: Some(Uuid::new_v4()),
        file_path,
        symbol,
        start_line,
        end_line,
        category: members[0].category.clone(),
        severity: severity.as_str().to_string(),
        description,
        explanation,
        suggested_fix,
        fixed_snippet: members.iter().find_map(|m| m.fixed_snippet.clone()),
        original_snippet: members.iter().find_map(|m| m.original_snippet.clone()),
        confidence,
    };

    // Evidence gate: no file anchor and no confident explanation means the
    // candidate carries nothing a reader could verify.
    let gated = candidate.file_path.is_none()
        && (candidate.explanation.is_empty() || candidate.confidence < 0.3);
    if gated {
        debug!("evidence gate dropped candidate: {}", candidate.description);
        None
    } else {
        Some(candidate)
    }
}

/// Step 5: closed enums and final fingerprint dedup.
fn materialize(
    project_id: Uuid,
    report_id: Uuid,
    merged: Vec<AgentFinding>,
) -> Vec<ReviewFinding> {
    let mut by_fingerprint: BTreeMap<(String, String, Category), ReviewFinding> = BTreeMap::new();

    for finding in merged {
        let category = Category::from_loose(&finding.category);
        let severity = Severity::from_loose(&finding.severity);
        let key = (
            finding.symbol.clone().unwrap_or_default(),
            finding.file_path.clone().unwrap_or_default(),
            category,
        );

        let review = ReviewFinding {
            id: finding.id.unwrap_or_else(Uuid::new_v4),
            project_id,
            report_id,
            file_path: finding.file_path,
            symbol: finding.symbol,
            start_line: finding.start_line,
            end_line: finding.end_line,
            category,
            severity,
            description: finding.description,
            explanation: finding.explanation,
            suggested_fix: finding.suggested_fix,
            confidence: finding.confidence.clamp(0.0, 1.0),
        };

        // LLM consolidation can collapse distinct groups onto one
        // fingerprint; keep the more severe candidate.
        let keep_new = by_fingerprint
            .get(&key)
            .map(|existing| existing.severity < review.severity)
            .unwrap_or(true);
        if keep_new {
            by_fingerprint.insert(key, review);
        }
    }

    by_fingerprint.into_values().collect()
}

/// An anchor survives the merge only when every member agrees on it.
fn unique_value<'a>(values: impl Iterator<Item = Option<&'a str>>) -> Option<String> {
    let mut unique: Option<&str> = None;
    for value in values {
        match (value, unique) {
            (None, _) | (Some(""), _) => return None,
            (Some(v), None) => unique = Some(v),
            (Some(v), Some(seen)) if v != seen => return None,
            _ => {}
        }
    }
    unique.map(str::to_string)
}

fn count(findings: &[ReviewFinding], severity: Severity) -> usize {
    findings.iter().filter(|f| f.severity == severity).count()
}

fn heuristic_narrative(findings: &[ReviewFinding]) -> String {
    let mut categories: BTreeMap<&str, usize> = BTreeMap::new();
    for finding in findings {
        *categories.entry(finding.category.as_str()).or_default() += 1;
    }
    let dominant = categories
        .iter()
        .max_by_key(|(_, count)| **count)
        .map(|(category, _)| *category)
        .unwrap_or("CodeQuality");

    format!(
        "The review surfaced {} findings across {} categories, concentrated in {}.",
        findings.len(),
        categories.len(),
        dominant
    )
}

fn build_summary(
    narrative: &str,
    score: u8,
    findings: &[ReviewFinding],
    responses: &[AgentResponse],
    skipped: &[String],
) -> String {
    let mut summary = String::new();
    summary.push_str(narrative);
    summary.push_str("\n\n");
    summary.push_str(&format!(
        "Overall assessment: {} (health score {score}/100).\n",
        assessment_phrase(score)
    ));
    summary.push_str(&format!(
        "Severity counts: {} critical, {} high, {} medium, {} low, {} info.\n",
        count(findings, Severity::Critical),
        count(findings, Severity::High),
        count(findings, Severity::Medium),
        count(findings, Severity::Low),
        count(findings, Severity::Info),
    ));

    summary.push_str("\nAgent summaries:\n");
    for response in responses {
        summary.push_str(&format!(
            "- {}: {} findings in {} ms{}\n",
            response.agent,
            response.findings.len(),
            response.elapsed_ms,
            if response.failed { " (failed)" } else { "" }
        ));
    }

    if !skipped.is_empty() {
        summary.push_str("\nNot reviewed:\n");
        for entry in skipped.iter().take(MAX_SKIPPED_LISTED) {
            summary.push_str(&format!("- {entry}\n"));
        }
        if skipped.len() > MAX_SKIPPED_LISTED {
            summary.push_str(&format!(
                "- ... and {} more\n",
                skipped.len() - MAX_SKIPPED_LISTED
            ));
        }
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::records::InMemoryStores;
    use async_trait::async_trait;

    struct EchoChat;

    #[async_trait]
    impl ChatClient for EchoChat {
        async fn complete(&self, _prompt: &str, label: &str) -> Result<String> {
            match label {
                "report-narrative" => Ok("A concise narrative.".to_string()),
                "report-recommendations" => {
                    Ok(r#"["Fix the injection", "Add tests"]"#.to_string())
                }
                _ => Ok("[]".to_string()),
            }
        }
    }

    struct DeadChat;

    #[async_trait]
    impl ChatClient for DeadChat {
        async fn complete(&self, _prompt: &str, _label: &str) -> Result<String> {
            Err(crate::core::errors::ArchrevError::transient(
                "Chat.Unavailable",
                "down",
            ))
        }
    }

    fn finding(
        file: Option<&str>,
        severity: &str,
        category: &str,
        description: &str,
        confidence: f64,
    ) -> AgentFinding {
        AgentFinding {
            file_path: file.map(str::to_string),
            severity: severity.to_string(),
            category: category.to_string(),
            description: description.to_string(),
            explanation: "because".to_string(),
            confidence,
            ..AgentFinding::default()
        }
    }

    fn response(agent: &str, findings: Vec<AgentFinding>) -> AgentResponse {
        AgentResponse {
            agent: agent.to_string(),
            findings,
            recommendations: vec![format!("{agent} recommendation")],
            elapsed_ms: 5,
            failed: false,
        }
    }

    #[tokio::test]
    async fn test_merge_same_fingerprint() {
        let store = Arc::new(InMemoryStores::new());
        let aggregator = ReportAggregator::new(Arc::new(DeadChat), store.clone());
        let project_id = Uuid::new_v4();

        let responses = vec![
            response(
                "Security",
                vec![finding(Some("src/a.cs"), "High", "Security", "SQLi one", 0.7)],
            ),
            response(
                "CodeQuality",
                vec![finding(Some("src/a.cs"), "High", "Security", "SQLi two", 0.9)],
            ),
        ];

        let report = aggregator.aggregate(project_id, &responses, 42).await.unwrap();
        let (_, findings) = store.get_by_project(project_id).await.unwrap().unwrap();

        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::High);
        assert!(findings[0].description.contains("\n---\n"));
        assert!((findings[0].confidence - 0.9).abs() < 1e-9);
        assert_eq!(report.high_count, 1);
        assert_eq!(report.health_score, 90);
    }

    #[tokio::test]
    async fn test_escalation_on_confidence() {
        let store = Arc::new(InMemoryStores::new());
        let aggregator = ReportAggregator::new(Arc::new(DeadChat), store.clone());
        let project_id = Uuid::new_v4();

        let responses = vec![response(
            "CodeQuality",
            vec![
                finding(Some("src/b.cs"), "Medium", "CodeQuality", "dup one", 0.9),
                finding(Some("src/b.cs"), "Medium", "CodeQuality", "dup two", 0.9),
            ],
        )];

        aggregator.aggregate(project_id, &responses, 1).await.unwrap();
        let (_, findings) = store.get_by_project(project_id).await.unwrap().unwrap();
        // Average confidence 0.9 escalates the merged Medium to High.
        assert_eq!(findings[0].severity, Severity::High);
    }

    #[test]
    fn test_unique_value_requires_full_agreement() {
        let agreed = unique_value([Some("src/a.cs"), Some("src/a.cs")].into_iter());
        assert_eq!(agreed.as_deref(), Some("src/a.cs"));

        let disagreed = unique_value([Some("src/a.cs"), Some("src/b.cs")].into_iter());
        assert!(disagreed.is_none());

        let partial = unique_value([Some("src/a.cs"), None].into_iter());
        assert!(partial.is_none());

        let empty = unique_value([Some("src/a.cs"), Some("")].into_iter());
        assert!(empty.is_none());

        assert!(unique_value(std::iter::empty::<Option<&str>>()).is_none());
    }

    #[tokio::test]
    async fn test_evidence_gate_drops_unanchored() {
        let store = Arc::new(InMemoryStores::new());
        let aggregator = ReportAggregator::new(Arc::new(DeadChat), store.clone());
        let project_id = Uuid::new_v4();

        let mut weak = finding(None, "Low", "CodeQuality", "a hunch", 0.2);
        weak.explanation = String::new();
        let responses = vec![response("CodeQuality", vec![weak])];

        aggregator.aggregate(project_id, &responses, 1).await.unwrap();
        let (report, findings) = store.get_by_project(project_id).await.unwrap().unwrap();
        assert!(findings.is_empty());
        assert_eq!(report.health_score, 100);
    }

    #[tokio::test]
    async fn test_empty_description_skipped_and_listed() {
        let store = Arc::new(InMemoryStores::new());
        let aggregator = ReportAggregator::new(Arc::new(DeadChat), store.clone());
        let project_id = Uuid::new_v4();

        let responses = vec![response(
            "Security",
            vec![finding(Some("src/a.cs"), "High", "Security", "  ", 0.9)],
        )];

        let report = aggregator.aggregate(project_id, &responses, 1).await.unwrap();
        assert!(report.summary.contains("Not reviewed:"));
        assert!(report.summary.contains("finding without description"));
    }

    #[tokio::test]
    async fn test_llm_recommendations_preferred() {
        let store = Arc::new(InMemoryStores::new());
        let aggregator = ReportAggregator::new(Arc::new(EchoChat), store.clone());
        let project_id = Uuid::new_v4();

        let responses = vec![response(
            "Security",
            vec![finding(Some("src/a.cs"), "High", "Security", "SQLi", 0.9)],
        )];

        let report = aggregator.aggregate(project_id, &responses, 1).await.unwrap();
        assert_eq!(report.recommendations[0], "Fix the injection");
        assert!(report.summary.starts_with("A concise narrative."));
    }

    #[tokio::test]
    async fn test_agent_recommendations_fallback() {
        let store = Arc::new(InMemoryStores::new());
        let aggregator = ReportAggregator::new(Arc::new(DeadChat), store.clone());
        let project_id = Uuid::new_v4();

        let responses = vec![
            response(
                "Security",
                vec![finding(Some("src/a.cs"), "High", "Security", "SQLi", 0.9)],
            ),
            response("Structure", vec![]),
        ];

        let report = aggregator.aggregate(project_id, &responses, 1).await.unwrap();
        assert!(report
            .recommendations
            .contains(&"Security recommendation".to_string()));
        assert!(report
            .recommendations
            .contains(&"Structure recommendation".to_string()));
    }

    #[tokio::test]
    async fn test_no_duplicate_fingerprints_persisted() {
        let store = Arc::new(InMemoryStores::new());
        let aggregator = ReportAggregator::new(Arc::new(DeadChat), store.clone());
        let project_id = Uuid::new_v4();

        let responses = vec![response(
            "Security",
            vec![
                finding(Some("src/a.cs"), "High", "Security", "one", 0.9),
                finding(Some("src/a.cs"), "Low", "Security", "two", 0.5),
                finding(Some("src/b.cs"), "Low", "CodeQuality", "three", 0.5),
            ],
        )];

        aggregator.aggregate(project_id, &responses, 1).await.unwrap();
        let (_, findings) = store.get_by_project(project_id).await.unwrap().unwrap();

        let mut fingerprints = std::collections::HashSet::new();
        for finding in &findings {
            let key = (
                finding.symbol.clone().unwrap_or_default(),
                finding.file_path.clone().unwrap_or_default(),
                finding.category,
            );
            assert!(fingerprints.insert(key), "duplicate fingerprint persisted");
        }
    }

    #[tokio::test]
    async fn test_findings_sorted_by_severity_then_path() {
        let store = Arc::new(InMemoryStores::new());
        let aggregator = ReportAggregator::new(Arc::new(DeadChat), store.clone());
        let project_id = Uuid::new_v4();

        let responses = vec![response(
            "Security",
            vec![
                finding(Some("src/z.cs"), "Low", "CodeQuality", "low one", 0.5),
                finding(Some("src/a.cs"), "High", "Security", "high one", 0.7),
                finding(Some("src/b.cs"), "Low", "Testing", "low two", 0.5),
            ],
        )];

        aggregator.aggregate(project_id, &responses, 1).await.unwrap();
        let (_, findings) = store.get_by_project(project_id).await.unwrap().unwrap();

        assert_eq!(findings[0].severity, Severity::High);
        assert!(findings[1].severity <= findings[0].severity);
    }
}
