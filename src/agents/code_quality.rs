//! Code quality agent.
//!
//! Four phases: rule-based findings straight from the static metrics,
//! cluster construction, one bounded-parallel LLM call per cluster, and an
//! optional deep dive over the handful of highest-complexity files. A
//! deep-dive timeout degrades to a manual-review finding instead of failing
//! the agent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::agents::llm::ChatClient;
use crate::agents::orchestrator::{AgentContext, AgentOutcome, AnalysisAgent};
use crate::agents::parse::parse_findings;
use crate::analysis::clusters::ClusterBuilder;
use crate::analysis::metrics::FileSummary;
use crate::core::config::AnalysisConfig;
use crate::core::entities::{AgentFinding, AnalysisCluster};
use crate::core::errors::Result;
use crate::ingest::archive::read_text_lossy;

/// Upper bound on deep-dive files per run.
const MAX_DEEP_DIVE_FILES: usize = 5;

/// Upper bound on characters of one file sent to a deep dive.
const MAX_DEEP_DIVE_CHARS: usize = 12_000;

/// Static-rule thresholds; cluster/deep-dive selection uses the config.
const RULE_COMPLEXITY_HIGH: u32 = 30;
const RULE_COMPLEXITY_MEDIUM: u32 = 20;
const RULE_LONG_FILE_LINES: usize = 500;
const RULE_METHOD_COUNT: usize = 20;

/// Metrics-driven and LLM-driven code quality agent.
pub struct CodeQualityAgent {
    chat: Arc<dyn ChatClient>,
    config: AnalysisConfig,
}

impl CodeQualityAgent {
    /// Create the agent over a chat client and analysis settings.
    pub fn new(chat: Arc<dyn ChatClient>, config: AnalysisConfig) -> Self {
        Self { chat, config }
    }

    /// Phase 1: rule-based findings from the static metrics.
    fn static_findings(&self, summaries: &[FileSummary]) -> Vec<AgentFinding> {
        let mut findings = Vec::new();
        for summary in summaries {
            if summary.complexity >= RULE_COMPLEXITY_MEDIUM {
                let severity = if summary.complexity >= RULE_COMPLEXITY_HIGH {
                    "High"
                } else {
                    "Medium"
                };
                findings.push(rule_finding(
                    &summary.relative_path,
                    "Complexity",
                    severity,
                    format!(
                        "High cyclomatic complexity ({})",
                        summary.complexity
                    ),
                    "Deeply branched code is hard to test and reason about.",
                    "Extract decision-heavy sections into focused functions.",
                ));
            }
            if summary.total_lines >= RULE_LONG_FILE_LINES {
                findings.push(rule_finding(
                    &summary.relative_path,
                    "Maintainability",
                    "Medium",
                    format!("Long file ({} lines)", summary.total_lines),
                    "Large files accumulate unrelated responsibilities.",
                    "Split the file along its distinct responsibilities.",
                ));
            }
            if summary.method_count >= RULE_METHOD_COUNT {
                findings.push(rule_finding(
                    &summary.relative_path,
                    "CodeQuality",
                    "Low",
                    format!("Many methods in one file ({})", summary.method_count),
                    "A wide interface in one place usually hides more than one abstraction.",
                    "Group related methods into cohesive types.",
                ));
            }
        }
        findings
    }

    /// Phase 3: one LLM call per cluster, bounded-parallel.
    async fn cluster_findings(
        &self,
        ctx: &AgentContext<'_>,
        clusters: &[AnalysisCluster],
    ) -> Vec<AgentFinding> {
        let summaries = ctx.summaries;
        let results: Vec<Vec<AgentFinding>> = stream::iter(clusters.to_vec())
            .map(|cluster: AnalysisCluster| {
                let chat = Arc::clone(&self.chat);
                let theme = cluster.theme.clone();
                let mut prompt = cluster_prompt(&cluster, summaries);
                // Small files ride along verbatim; chunked files are reachable
                // through retrieval instead.
                prompt.push_str(&direct_excerpts(ctx, &cluster));
                async move {
                    match chat.complete(&prompt, "cluster-analysis").await {
                        Ok(response) => parse_findings(&response),
                        Err(err) => {
                            warn!(theme = %theme, "cluster analysis failed: {err}");
                            Vec::new()
                        }
                    }
                }
            })
            .buffer_unordered(self.config.max_parallel_llm_calls)
            .collect()
            .await;

        results.into_iter().flatten().collect()
    }

    /// Phase 4: deep dive into the highest-complexity files.
    async fn deep_dive_findings(&self, ctx: &AgentContext<'_>) -> Vec<AgentFinding> {
        let builder = ClusterBuilder::new(
            self.config.max_cluster_size,
            self.config.cluster_similarity_threshold,
        );
        let candidates = builder.detect_high_priority_files(
            ctx.summaries,
            self.config.deep_dive_complexity_threshold,
            self.config.deep_dive_line_count_threshold,
        );

        let mut findings = Vec::new();
        for summary in candidates.into_iter().take(MAX_DEEP_DIVE_FILES) {
            if ctx.cancel.is_cancelled() {
                break;
            }
            let Ok(content) = read_text_lossy(&ctx.working_dir.join(&summary.relative_path))
            else {
                continue;
            };
            let excerpt: String = content.chars().take(MAX_DEEP_DIVE_CHARS).collect();
            let mut prompt = deep_dive_prompt(summary, &excerpt);
            if let Some(retriever) = ctx.retriever {
                let query = format!("{} {}", summary.relative_path, summary.language);
                let hits = retriever.related(&query, ctx.cancel).await;
                prompt.push_str(&crate::agents::retrieval::Retriever::render_context(&hits));
            }

            let budget = Duration::from_secs(self.config.deep_dive_timeout_seconds);
            match tokio::time::timeout(budget, self.chat.complete(&prompt, "deep-dive")).await {
                Ok(Ok(response)) => {
                    let mut parsed = parse_findings(&response);
                    for finding in &mut parsed {
                        finding
                            .file_path
                            .get_or_insert_with(|| summary.relative_path.clone());
                    }
                    findings.extend(parsed);
                }
                Ok(Err(err)) => {
                    warn!(file = %summary.relative_path, "deep dive failed: {err}");
                    findings.push(manual_review_finding(summary));
                }
                Err(_) => {
                    warn!(
                        file = %summary.relative_path,
                        "deep dive exceeded {}s budget", budget.as_secs()
                    );
                    findings.push(manual_review_finding(summary));
                }
            }
        }
        findings
    }
}

#[async_trait]
impl AnalysisAgent for CodeQualityAgent {
    fn name(&self) -> &'static str {
        "CodeQuality"
    }

    async fn analyze(&self, ctx: &AgentContext<'_>) -> Result<AgentOutcome> {
        let mut findings = self.static_findings(ctx.summaries);
        debug!(count = findings.len(), "static rule findings");

        let builder = ClusterBuilder::new(
            self.config.max_cluster_size,
            self.config.cluster_similarity_threshold,
        );
        let clusters = builder.build(ctx.summaries);

        findings.extend(self.cluster_findings(ctx, &clusters).await);
        findings.extend(self.deep_dive_findings(ctx).await);

        Ok(AgentOutcome {
            findings,
            recommendations: Vec::new(),
        })
    }
}

fn rule_finding(
    path: &str,
    category: &str,
    severity: &str,
    description: String,
    explanation: &str,
    fix: &str,
) -> AgentFinding {
    AgentFinding {
        id: Some(Uuid::new_v4()),
        file_path: Some(path.to_string()),
        category: category.to_string(),
        severity: severity.to_string(),
        description,
        explanation: explanation.to_string(),
        suggested_fix: fix.to_string(),
        confidence: 0.95,
        ..AgentFinding::default()
    }
}

fn manual_review_finding(summary: &FileSummary) -> AgentFinding {
    AgentFinding {
        id: Some(Uuid::new_v4()),
        file_path: Some(summary.relative_path.clone()),
        category: "CodeQuality".to_string(),
        severity: "Medium".to_string(),
        description: "Manual review required".to_string(),
        explanation: format!(
            "Automated deep dive of {} (complexity {}) did not complete.",
            summary.relative_path, summary.complexity
        ),
        suggested_fix: "Review this file by hand; it exceeded the automated analysis budget."
            .to_string(),
        confidence: 1.0,
        ..AgentFinding::default()
    }
}

/// Bytes of one direct-send file included verbatim in a cluster prompt.
const MAX_DIRECT_EXCERPT_CHARS: usize = 2_000;

/// Full text of up to two direct-routed member files, verbatim.
fn direct_excerpts(ctx: &AgentContext<'_>, cluster: &AnalysisCluster) -> String {
    let mut section = String::new();
    let direct_members = ctx
        .plans
        .iter()
        .filter(|p| {
            p.decision == crate::ingest::router::RouteDecision::DirectSend
                && cluster.files.contains(&p.relative_path)
        })
        .take(2);

    for plan in direct_members {
        let Ok(content) = read_text_lossy(&ctx.working_dir.join(&plan.relative_path)) else {
            continue;
        };
        let excerpt: String = content.chars().take(MAX_DIRECT_EXCERPT_CHARS).collect();
        section.push_str(&format!("\nFull text of {}:\n```\n{excerpt}\n```\n", plan.relative_path));
    }
    section
}

/// Compact cluster summary: top files by complexity and size plus
/// aggregates, bounded so the prompt stays small.
fn cluster_prompt(cluster: &AnalysisCluster, summaries: &[FileSummary]) -> String {
    let mut members: Vec<&FileSummary> = summaries
        .iter()
        .filter(|s| cluster.files.contains(&s.relative_path))
        .collect();
    members.sort_by(|a, b| b.complexity.cmp(&a.complexity).then(b.loc.cmp(&a.loc)));

    let mut lines = String::new();
    for member in members.iter().take(5) {
        lines.push_str(&format!(
            "- {} ({} LOC, complexity {}, {} methods)\n",
            member.relative_path, member.loc, member.complexity, member.method_count
        ));
    }

    format!(
        "Review a cluster of related {} files themed '{}' \
         ({} files, {} total LOC, average complexity {:.1}, risk {:?}).\n\
         Representative files:\n{lines}\n\
         Return ONLY a JSON array of findings with fields: file_path, symbol, \
         category, severity (Critical|High|Medium|Low|Info), description, \
         explanation, suggested_fix, confidence (0..1). Return [] when the \
         cluster looks healthy.",
        cluster.primary_language,
        cluster.theme,
        cluster.files.len(),
        cluster.total_loc,
        cluster.avg_complexity,
        cluster.risk,
    )
}

fn deep_dive_prompt(summary: &FileSummary, excerpt: &str) -> String {
    format!(
        "Deep-dive review of {} ({} LOC, complexity {}).\n\
         Return ONLY a JSON array of findings with fields: file_path, symbol, \
         start_line, end_line, category, severity, description, explanation, \
         suggested_fix, confidence (0..1).\n\n```\n{excerpt}\n```",
        summary.relative_path, summary.loc, summary.complexity
    )
}
