//! Architecture advisor agent.
//!
//! Gathers project-wide facts — language mix, size, directory themes,
//! routing outcome — and asks the LLM for pattern-level recommendations
//! against a fixed JSON-array schema. Produces both findings and the
//! report-level recommendation list.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::agents::llm::ChatClient;
use crate::agents::orchestrator::{AgentContext, AgentOutcome, AnalysisAgent};
use crate::agents::parse::{parse_findings, parse_recommendations};
use crate::core::errors::Result;

/// LLM-backed architecture advisor.
pub struct ArchitectureAdvisorAgent {
    chat: Arc<dyn ChatClient>,
}

impl ArchitectureAdvisorAgent {
    /// Create the agent over a chat client.
    pub fn new(chat: Arc<dyn ChatClient>) -> Self {
        Self { chat }
    }

    fn gather_facts(&self, ctx: &AgentContext<'_>) -> String {
        let total_loc: usize = ctx.summaries.iter().map(|s| s.loc).sum();
        let analyzed = ctx.plans.iter().filter(|p| p.decision.is_analyzed()).count();

        let mut languages: BTreeMap<&str, usize> = BTreeMap::new();
        for summary in ctx.summaries {
            *languages.entry(summary.language.as_str()).or_default() += 1;
        }
        let language_mix = languages
            .iter()
            .map(|(language, count)| format!("{language}: {count}"))
            .collect::<Vec<_>>()
            .join(", ");

        let mut directories: BTreeMap<String, usize> = BTreeMap::new();
        for summary in ctx.summaries {
            let theme = summary
                .relative_path
                .rsplit_once('/')
                .map(|(dir, _)| dir.to_string())
                .unwrap_or_else(|| "(root)".to_string());
            *directories.entry(theme).or_default() += 1;
        }
        let mut top_dirs: Vec<(String, usize)> = directories.into_iter().collect();
        top_dirs.sort_by(|a, b| b.1.cmp(&a.1));
        let layout = top_dirs
            .iter()
            .take(10)
            .map(|(dir, count)| format!("{dir} ({count} files)"))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "Analyzed files: {analyzed}\n\
             Total LOC: {total_loc}\n\
             Languages: {language_mix}\n\
             Layout: {layout}"
        )
    }
}

#[async_trait]
impl AnalysisAgent for ArchitectureAdvisorAgent {
    fn name(&self) -> &'static str {
        "ArchitectureAdvisor"
    }

    async fn analyze(&self, ctx: &AgentContext<'_>) -> Result<AgentOutcome> {
        let facts = self.gather_facts(ctx);
        debug!("advisor facts gathered");

        let prompt = format!(
            "You are an architecture advisor reviewing a codebase.\n\
             Facts:\n{facts}\n\n\
             Return ONLY a JSON array. Each element must have exactly these \
             fields: category (Architecture|Structure|Maintainability|\
             BestPractice), severity (High|Medium|Low|Info), description, \
             explanation, suggested_fix, confidence (0..1). Recommend \
             pattern-level improvements, not line edits. Return [] when the \
             architecture needs no changes.",
        );

        let response = self.chat.complete(&prompt, "architecture-advisor").await?;
        let mut findings = parse_findings(&response);
        for finding in &mut findings {
            if finding.category.is_empty() {
                finding.category = "Architecture".to_string();
            }
        }
        let recommendations = findings
            .iter()
            .filter(|f| !f.suggested_fix.is_empty())
            .map(|f| f.suggested_fix.clone())
            .chain(parse_recommendations(&response))
            .collect();

        Ok(AgentOutcome {
            findings,
            recommendations,
        })
    }
}
