//! Serial agent orchestration.
//!
//! Agents run one after another; the order is an implementation detail and
//! nothing downstream may depend on it. A failing agent costs the run
//! exactly one synthetic Info finding — the pipeline always reaches the
//! aggregator with whatever the other agents produced.

use std::path::Path;
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agents::retrieval::Retriever;
use crate::analysis::metrics::FileSummary;
use crate::core::entities::AgentFinding;
use crate::core::errors::Result;
use crate::ingest::router::FileAnalysisPlan;

/// Everything an agent may look at during one run.
pub struct AgentContext<'a> {
    /// Project under analysis
    pub project_id: Uuid,
    /// Extraction root
    pub working_dir: &'a Path,
    /// Routing decisions for every file
    pub plans: &'a [FileAnalysisPlan],
    /// Static metrics for every analyzed file
    pub summaries: &'a [FileSummary],
    /// Similarity retriever over the project's indexed chunks, when the
    /// indexing phase produced any
    pub retriever: Option<&'a Retriever>,
    /// Job cancellation signal
    pub cancel: &'a CancellationToken,
}

/// What one agent produced.
#[derive(Debug, Default)]
pub struct AgentOutcome {
    /// Findings, still in loose form
    pub findings: Vec<AgentFinding>,
    /// Agent-level recommendations for the report
    pub recommendations: Vec<String>,
}

/// One analysis agent.
#[async_trait]
pub trait AnalysisAgent: Send + Sync {
    /// Stable agent name used in summaries and logging.
    fn name(&self) -> &'static str;

    /// Run the agent over the project.
    async fn analyze(&self, ctx: &AgentContext<'_>) -> Result<AgentOutcome>;
}

/// Per-agent result as handed to the aggregator.
#[derive(Debug)]
pub struct AgentResponse {
    /// Agent name
    pub agent: String,
    /// Findings (one synthetic entry when the agent failed)
    pub findings: Vec<AgentFinding>,
    /// Agent recommendations
    pub recommendations: Vec<String>,
    /// Wall-clock duration
    pub elapsed_ms: u64,
    /// Whether the agent failed
    pub failed: bool,
}

/// Runs the configured agents serially and collects their responses.
pub struct AgentOrchestrator {
    agents: Vec<Box<dyn AnalysisAgent>>,
}

impl AgentOrchestrator {
    /// Create an orchestrator over a fixed agent set.
    pub fn new(agents: Vec<Box<dyn AnalysisAgent>>) -> Self {
        Self { agents }
    }

    /// Run every agent; failures degrade, they never abort.
    pub async fn run(&self, ctx: &AgentContext<'_>) -> Vec<AgentResponse> {
        let mut responses = Vec::with_capacity(self.agents.len());

        for agent in &self.agents {
            let started = Instant::now();
            let response = match agent.analyze(ctx).await {
                Ok(outcome) => {
                    info!(
                        agent = agent.name(),
                        findings = outcome.findings.len(),
                        "agent completed"
                    );
                    AgentResponse {
                        agent: agent.name().to_string(),
                        findings: outcome.findings,
                        recommendations: outcome.recommendations,
                        elapsed_ms: started.elapsed().as_millis() as u64,
                        failed: false,
                    }
                }
                Err(err) => {
                    warn!(agent = agent.name(), "agent failed: {err}");
                    AgentResponse {
                        agent: agent.name().to_string(),
                        findings: vec![failure_finding(agent.name(), &err)],
                        recommendations: Vec::new(),
                        elapsed_ms: started.elapsed().as_millis() as u64,
                        failed: true,
                    }
                }
            };
            responses.push(response);
        }

        responses
    }
}

/// The canonical representation of an agent failure: one Info finding.
fn failure_finding(agent: &str, err: &crate::core::errors::ArchrevError) -> AgentFinding {
    AgentFinding {
        id: Some(Uuid::new_v4()),
        category: "Other".to_string(),
        severity: "Info".to_string(),
        description: format!("Agent failed: {agent}"),
        explanation: err.to_string(),
        confidence: 1.0,
        ..AgentFinding::default()
    }
}
