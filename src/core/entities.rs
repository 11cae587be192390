//! Core domain entities and their lifecycle invariants.
//!
//! The project status machine only moves forward (`Created -> FilesReady ->
//! Queued -> Analyzing -> Completed | Failed`); the administrative reset is
//! the single sanctioned backward edge. Findings exist in two forms: the
//! loose [`AgentFinding`] emitted by agents and LLM parsing, and the
//! persisted [`ReviewFinding`] with closed severity/category enums.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::errors::{ArchrevError, Result};

/// Project lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProjectStatus {
    /// Row exists, nothing uploaded yet
    Created,
    /// Archive stored and file records ingested
    FilesReady,
    /// Analysis command accepted, waiting for a worker
    Queued,
    /// A worker is driving the pipeline
    Analyzing,
    /// Report persisted
    Completed,
    /// Terminal failure; `error_message` carries the code
    Failed,
}

impl ProjectStatus {
    /// Whether `self -> to` is a legal forward transition.
    pub fn can_transition(self, to: ProjectStatus) -> bool {
        use ProjectStatus::*;
        matches!(
            (self, to),
            (Created, FilesReady)
                | (FilesReady, Queued)
                | (Queued, Analyzing)
                | (Analyzing, Completed)
                | (Analyzing, Failed)
                | (Queued, Failed)
        )
    }

    /// Whether the administrative reset applies from this status.
    pub fn can_reset(self) -> bool {
        use ProjectStatus::*;
        matches!(self, Analyzing | Queued | Failed)
    }

    /// Human-readable name used in error messages and events.
    pub fn as_str(self) -> &'static str {
        match self {
            ProjectStatus::Created => "Created",
            ProjectStatus::FilesReady => "FilesReady",
            ProjectStatus::Queued => "Queued",
            ProjectStatus::Analyzing => "Analyzing",
            ProjectStatus::Completed => "Completed",
            ProjectStatus::Failed => "Failed",
        }
    }
}

/// Where a project's source tree came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProjectOrigin {
    /// Uploaded archive; the blob key points at the zip
    Archive,
    /// Cloned from a remote repository before ingestion
    RemoteUrl(String),
}

/// A repository under review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    /// Opaque identity
    pub id: Uuid,
    /// Display name
    pub name: String,
    /// Archive or remote origin
    pub origin: ProjectOrigin,
    /// Blob storage pointer for the stored archive
    pub storage_key: String,
    /// Lifecycle status
    pub status: ProjectStatus,
    /// Owning credential
    pub api_key_id: Uuid,
    /// Number of analyzable files ingested
    pub file_count: usize,
    /// Aggregate lines of code
    pub total_loc: usize,
    /// Terminal failure code, when status is `Failed`
    pub error_message: Option<String>,
    /// Row creation time
    pub created_at: DateTime<Utc>,
    /// Last status change
    pub updated_at: DateTime<Utc>,
    /// When analysis began
    pub analysis_started_at: Option<DateTime<Utc>>,
    /// When analysis finished, in success or failure
    pub analysis_finished_at: Option<DateTime<Utc>>,
}

impl Project {
    /// Create a fresh project record around a stored archive.
    pub fn new(name: impl Into<String>, storage_key: impl Into<String>, api_key_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            origin: ProjectOrigin::Archive,
            storage_key: storage_key.into(),
            status: ProjectStatus::Created,
            api_key_id,
            file_count: 0,
            total_loc: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
            analysis_started_at: None,
            analysis_finished_at: None,
        }
    }

    /// Move to `to`, enforcing the forward-only machine.
    pub fn transition(&mut self, to: ProjectStatus) -> Result<()> {
        if !self.status.can_transition(to) {
            return Err(ArchrevError::invalid_transition(
                self.status.as_str(),
                to.as_str(),
            ));
        }
        self.status = to;
        self.updated_at = Utc::now();
        match to {
            ProjectStatus::Analyzing => self.analysis_started_at = Some(self.updated_at),
            ProjectStatus::Completed | ProjectStatus::Failed => {
                self.analysis_finished_at = Some(self.updated_at);
            }
            _ => {}
        }
        Ok(())
    }

    /// Administrative reset back to `FilesReady`.
    pub fn reset(&mut self) -> Result<()> {
        if !self.status.can_reset() {
            return Err(ArchrevError::invalid_transition(
                self.status.as_str(),
                ProjectStatus::FilesReady.as_str(),
            ));
        }
        self.status = ProjectStatus::FilesReady;
        self.error_message = None;
        self.analysis_started_at = None;
        self.analysis_finished_at = None;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record a terminal failure with its stable code.
    pub fn fail(&mut self, code: impl Into<String>) {
        self.status = ProjectStatus::Failed;
        self.error_message = Some(code.into());
        let now = Utc::now();
        self.updated_at = now;
        self.analysis_finished_at = Some(now);
    }
}

/// One analyzable file inside a project; immutable after ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    /// Identity
    pub id: Uuid,
    /// Owning project
    pub project_id: Uuid,
    /// Path relative to the extraction root
    pub relative_path: String,
    /// Lower-cased extension including the dot
    pub extension: String,
    /// Size in bytes
    pub size_bytes: u64,
    /// Hex content hash
    pub content_hash: String,
    /// Lines of code (non-blank, non-comment heuristic)
    pub loc: usize,
    /// Heuristic cyclomatic complexity
    pub complexity: u32,
}

/// Closed severity scale for persisted findings.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Severity {
    /// Informational only
    Info,
    /// Worth fixing eventually
    Low,
    /// Should be scheduled
    Medium,
    /// Should be fixed soon
    High,
    /// Drop everything
    Critical,
}

impl Severity {
    /// Parse a loose LLM-supplied string; unknown values map to `Info`.
    pub fn from_loose(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "critical" | "blocker" => Severity::Critical,
            "high" | "major" => Severity::High,
            "medium" | "moderate" => Severity::Medium,
            "low" | "minor" => Severity::Low,
            _ => Severity::Info,
        }
    }

    /// Display name matching the persisted representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "Critical",
            Severity::High => "High",
            Severity::Medium => "Medium",
            Severity::Low => "Low",
            Severity::Info => "Info",
        }
    }
}

/// Closed category set for persisted findings.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Category {
    /// System-level design concerns
    Architecture,
    /// Vulnerabilities and insecure handling
    Security,
    /// Hot paths and resource usage
    Performance,
    /// Long-term upkeep burden
    Maintainability,
    /// Local code smells
    CodeQuality,
    /// Test coverage and quality
    Testing,
    /// Missing or stale documentation
    Documentation,
    /// Idiom and convention deviations
    BestPractice,
    /// Cognitive and cyclomatic load
    Complexity,
    /// Repository layout concerns
    Structure,
    /// Anything else
    Other,
}

impl Category {
    /// Parse a loose LLM-supplied string; unknown values map to `CodeQuality`.
    pub fn from_loose(value: &str) -> Self {
        match value
            .trim()
            .to_ascii_lowercase()
            .replace([' ', '-', '_'], "")
            .as_str()
        {
            "architecture" => Category::Architecture,
            "security" => Category::Security,
            "performance" | "perf" => Category::Performance,
            "maintainability" => Category::Maintainability,
            "codequality" | "quality" => Category::CodeQuality,
            "testing" | "test" | "tests" => Category::Testing,
            "documentation" | "docs" => Category::Documentation,
            "bestpractice" | "bestpractices" => Category::BestPractice,
            "complexity" => Category::Complexity,
            "structure" => Category::Structure,
            "other" => Category::Other,
            _ => Category::CodeQuality,
        }
    }

    /// Display name matching the persisted representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Architecture => "Architecture",
            Category::Security => "Security",
            Category::Performance => "Performance",
            Category::Maintainability => "Maintainability",
            Category::CodeQuality => "CodeQuality",
            Category::Testing => "Testing",
            Category::Documentation => "Documentation",
            Category::BestPractice => "BestPractice",
            Category::Complexity => "Complexity",
            Category::Structure => "Structure",
            Category::Other => "Other",
        }
    }
}

/// Risk level attached to an analysis cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RiskLevel {
    /// Routine code
    Low,
    /// Some elevated signals
    Medium,
    /// Multiple elevated signals
    High,
    /// Hot spot
    Critical,
}

/// Intermediate finding as emitted by agents and LLM parsing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentFinding {
    /// Identity for tracing through the aggregator
    #[serde(default)]
    pub id: Option<Uuid>,
    /// File anchor, when the agent had one
    #[serde(default, alias = "filePath", alias = "file")]
    pub file_path: Option<String>,
    /// Symbol anchor (type or member name)
    #[serde(default)]
    pub symbol: Option<String>,
    /// Start line of the affected range
    #[serde(default, alias = "startLine", alias = "line")]
    pub start_line: Option<usize>,
    /// End line of the affected range
    #[serde(default, alias = "endLine")]
    pub end_line: Option<usize>,
    /// Loose category string, normalized at persistence
    #[serde(default)]
    pub category: String,
    /// Loose severity string, normalized at persistence
    #[serde(default)]
    pub severity: String,
    /// What is wrong
    #[serde(default)]
    pub description: String,
    /// Why it matters
    #[serde(default)]
    pub explanation: String,
    /// How to fix it
    #[serde(default, alias = "suggestedFix", alias = "fix")]
    pub suggested_fix: String,
    /// Proposed replacement snippet
    #[serde(default, alias = "fixedSnippet")]
    pub fixed_snippet: Option<String>,
    /// Offending snippet
    #[serde(default, alias = "originalSnippet")]
    pub original_snippet: Option<String>,
    /// Agent confidence in [0, 1]
    #[serde(default)]
    pub confidence: f64,
}

impl AgentFinding {
    /// Dedup/merge fingerprint: `(symbol|"") | (file_path|"") | (category|"")`.
    pub fn fingerprint(&self) -> String {
        format!(
            "{}|{}|{}",
            self.symbol.as_deref().unwrap_or(""),
            self.file_path.as_deref().unwrap_or(""),
            self.category
        )
    }
}

/// Persisted finding with closed enums and report linkage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewFinding {
    /// Identity
    pub id: Uuid,
    /// Owning project
    pub project_id: Uuid,
    /// Owning report
    pub report_id: Uuid,
    /// File anchor
    pub file_path: Option<String>,
    /// Symbol anchor
    pub symbol: Option<String>,
    /// Start line of the affected range
    pub start_line: Option<usize>,
    /// End line of the affected range
    pub end_line: Option<usize>,
    /// Closed category
    pub category: Category,
    /// Closed severity
    pub severity: Severity,
    /// What is wrong
    pub description: String,
    /// Why it matters
    pub explanation: String,
    /// How to fix it
    pub suggested_fix: String,
    /// Confidence in [0, 1]
    pub confidence: f64,
}

/// A set of related files analyzed as one LLM call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisCluster {
    /// Theme name, e.g. a shared directory
    pub theme: String,
    /// Member file paths
    pub files: Vec<String>,
    /// Derived risk level
    pub risk: RiskLevel,
    /// Most common language among members
    pub primary_language: String,
    /// Aggregate lines of code
    pub total_loc: usize,
    /// Mean of member max complexities
    pub avg_complexity: f64,
    /// Set by the orchestration once the cluster's LLM call completed
    pub is_analyzed: bool,
}

/// One consolidated report per project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    /// Identity
    pub id: Uuid,
    /// Owning project (unique)
    pub project_id: Uuid,
    /// Narrative plus assessment plus counts
    pub summary: String,
    /// Ordered, unique, at most ten
    pub recommendations: Vec<String>,
    /// Bounded health score
    pub health_score: u8,
    /// Count of critical findings
    pub critical_count: usize,
    /// Count of high findings
    pub high_count: usize,
    /// Count of medium findings
    pub medium_count: usize,
    /// Count of low findings
    pub low_count: usize,
    /// Count of info findings
    pub info_count: usize,
    /// Wall-clock analysis duration in milliseconds
    pub duration_ms: u64,
    /// Engine version that produced the report
    pub engine_version: String,
    /// Pointer to a rendered artifact, when one exists
    pub artifact_key: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl Report {
    /// Build a report, enforcing the recommendation and score invariants.
    pub fn new(
        project_id: Uuid,
        summary: String,
        recommendations: Vec<String>,
        health_score: u8,
        duration_ms: u64,
    ) -> Self {
        let mut seen = std::collections::HashSet::new();
        let recommendations: Vec<String> = recommendations
            .into_iter()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty() && seen.insert(r.clone()))
            .take(10)
            .collect();

        Self {
            id: Uuid::new_v4(),
            project_id,
            summary,
            recommendations,
            health_score: health_score.min(100),
            critical_count: 0,
            high_count: 0,
            medium_count: 0,
            low_count: 0,
            info_count: 0,
            duration_ms,
            engine_version: crate::VERSION.to_string(),
            artifact_key: None,
            created_at: Utc::now(),
        }
    }

    /// Tally severity counts from the persisted findings.
    pub fn record_counts(&mut self, findings: &[ReviewFinding]) {
        for finding in findings {
            match finding.severity {
                Severity::Critical => self.critical_count += 1,
                Severity::High => self.high_count += 1,
                Severity::Medium => self.medium_count += 1,
                Severity::Low => self.low_count += 1,
                Severity::Info => self.info_count += 1,
            }
        }
    }
}

/// Resumption checkpoint for a job phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCheckpoint {
    /// Owning project
    pub project_id: Uuid,
    /// Phase name, e.g. `indexing`
    pub phase: String,
    /// Last fully processed offset within the phase
    pub last_offset: usize,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}
