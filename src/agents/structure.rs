//! Repository structure agent.
//!
//! Entirely heuristic: walks the extracted tree, recognizes frameworks from
//! manifest files, recognizes architectural patterns from directory-name
//! signatures, and flags missing engineering scaffolding (tests, Docker,
//! CI). Never calls the LLM.

use std::collections::BTreeSet;

use async_trait::async_trait;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::agents::orchestrator::{AgentContext, AgentOutcome, AnalysisAgent};
use crate::core::entities::AgentFinding;
use crate::core::errors::Result;

/// Manifest basename → framework display name.
const FRAMEWORK_MANIFESTS: &[(&str, &str)] = &[
    ("package.json", "Node.js"),
    ("Cargo.toml", "Rust"),
    ("pom.xml", "Maven/Java"),
    ("build.gradle", "Gradle/Java"),
    ("requirements.txt", "Python"),
    ("pyproject.toml", "Python"),
    ("go.mod", "Go"),
    ("composer.json", "PHP"),
    ("Gemfile", "Ruby"),
];

/// CI definition locations checked for presence.
const CI_MARKERS: &[&str] = &[
    ".github/workflows",
    ".gitlab-ci.yml",
    "azure-pipelines.yml",
    "Jenkinsfile",
    ".circleci/config.yml",
];

/// Heuristic structure and scaffolding agent.
pub struct StructureAgent;

impl StructureAgent {
    /// Create the agent.
    pub fn new() -> Self {
        Self
    }
}

impl Default for StructureAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AnalysisAgent for StructureAgent {
    fn name(&self) -> &'static str {
        "Structure"
    }

    async fn analyze(&self, ctx: &AgentContext<'_>) -> Result<AgentOutcome> {
        let mut directories: BTreeSet<String> = BTreeSet::new();
        let mut basenames: BTreeSet<String> = BTreeSet::new();
        let mut relative_paths: Vec<String> = Vec::new();

        for entry in WalkDir::new(ctx.working_dir).follow_links(false) {
            let Ok(entry) = entry else { continue };
            let relative = entry
                .path()
                .strip_prefix(ctx.working_dir)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            if relative.is_empty() {
                continue;
            }
            if entry.file_type().is_dir() {
                if let Some(name) = relative.rsplit('/').next() {
                    directories.insert(name.to_ascii_lowercase());
                }
            } else {
                if let Some(name) = relative.rsplit('/').next() {
                    basenames.insert(name.to_string());
                }
                relative_paths.push(relative);
            }
        }

        let mut findings = Vec::new();
        let mut recommendations = Vec::new();

        let frameworks: Vec<&str> = FRAMEWORK_MANIFESTS
            .iter()
            .filter(|(manifest, _)| basenames.contains(*manifest))
            .map(|(_, name)| *name)
            .collect();
        let patterns = detect_patterns(&directories);

        if !patterns.is_empty() {
            findings.push(info_finding(
                format!("Architectural patterns detected: {}", patterns.join(", ")),
                format!(
                    "Directory layout matches known signatures. Frameworks present: {}.",
                    if frameworks.is_empty() {
                        "none recognized".to_string()
                    } else {
                        frameworks.join(", ")
                    }
                ),
            ));
        }

        if !has_tests(&directories, &relative_paths) {
            findings.push(structure_finding(
                "Medium",
                "Testing",
                "No test directory or test files detected",
                "Untested code erodes confidence in every change; start with the highest-risk modules.",
                "Add a test suite alongside the production tree and wire it into the build.",
            ));
            recommendations.push("Introduce an automated test suite".to_string());
        }

        if !basenames.contains("Dockerfile") && !basenames.contains("docker-compose.yml") {
            findings.push(structure_finding(
                "Low",
                "Structure",
                "No container definition found",
                "Without a Dockerfile, environments drift between machines and deployments.",
                "Add a Dockerfile that builds and runs the service.",
            ));
        }

        if !has_ci(&relative_paths) {
            findings.push(structure_finding(
                "Medium",
                "Structure",
                "No continuous-integration configuration found",
                "Builds and tests only run when someone remembers to run them.",
                "Add a CI pipeline that builds the project and runs the tests on every push.",
            ));
            recommendations.push("Set up continuous integration".to_string());
        }

        Ok(AgentOutcome {
            findings,
            recommendations,
        })
    }
}

fn detect_patterns(directories: &BTreeSet<String>) -> Vec<&'static str> {
    let mut patterns = Vec::new();
    let has = |name: &str| directories.contains(name);

    if (has("domain") || has("core")) && (has("application") || has("usecases"))
        && (has("infrastructure") || has("persistence"))
    {
        patterns.push("Clean Architecture");
    }
    if has("controllers") && (has("models") || has("viewmodels")) && has("views") {
        patterns.push("MVC");
    }
    if has("services")
        && directories
            .iter()
            .filter(|d| d.ends_with("service") || d.ends_with("services"))
            .count()
            >= 2
    {
        patterns.push("Service-Oriented");
    }
    patterns
}

fn has_tests(directories: &BTreeSet<String>, paths: &[String]) -> bool {
    let test_dirs = ["test", "tests", "spec", "specs", "__tests__"];
    if test_dirs.iter().any(|d| directories.contains(*d)) {
        return true;
    }
    paths.iter().any(|p| {
        let lower = p.to_ascii_lowercase();
        lower.contains("test") && (lower.ends_with(".cs") || lower.ends_with(".rs")
            || lower.ends_with(".py") || lower.ends_with(".ts") || lower.ends_with(".js")
            || lower.ends_with(".go") || lower.ends_with(".java"))
    })
}

fn has_ci(paths: &[String]) -> bool {
    paths.iter().any(|p| {
        CI_MARKERS
            .iter()
            .any(|marker| p == marker || p.starts_with(&format!("{marker}/")))
    })
}

fn structure_finding(
    severity: &str,
    category: &str,
    description: &str,
    explanation: &str,
    fix: &str,
) -> AgentFinding {
    AgentFinding {
        id: Some(Uuid::new_v4()),
        severity: severity.to_string(),
        category: category.to_string(),
        description: description.to_string(),
        explanation: explanation.to_string(),
        suggested_fix: fix.to_string(),
        confidence: 0.9,
        ..AgentFinding::default()
    }
}

fn info_finding(description: String, explanation: String) -> AgentFinding {
    AgentFinding {
        id: Some(Uuid::new_v4()),
        severity: "Info".to_string(),
        category: "Architecture".to_string(),
        description,
        explanation,
        confidence: 0.8,
        ..AgentFinding::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    async fn run_on(layout: &[&str]) -> AgentOutcome {
        let dir = tempfile::tempdir().unwrap();
        for path in layout {
            let full = dir.path().join(path);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(&full, "content\n").unwrap();
        }

        let cancel = CancellationToken::new();
        let ctx = AgentContext {
            project_id: Uuid::new_v4(),
            working_dir: dir.path(),
            plans: &[],
            summaries: &[],
            retriever: None,
            cancel: &cancel,
        };
        StructureAgent::new().analyze(&ctx).await.unwrap()
    }

    #[tokio::test]
    async fn test_flags_missing_scaffolding() {
        let outcome = run_on(&["src/main.rs"]).await;
        let descriptions: Vec<&str> = outcome
            .findings
            .iter()
            .map(|f| f.description.as_str())
            .collect();

        assert!(descriptions.iter().any(|d| d.contains("test")));
        assert!(descriptions.iter().any(|d| d.contains("container")));
        assert!(descriptions.iter().any(|d| d.contains("continuous-integration")));
    }

    #[tokio::test]
    async fn test_recognizes_scaffolding_when_present() {
        let outcome = run_on(&[
            "src/main.rs",
            "tests/integration.rs",
            "Dockerfile",
            ".github/workflows/ci.yml",
        ])
        .await;

        assert!(
            outcome.findings.iter().all(|f| f.severity == "Info"),
            "only informational findings expected: {:?}",
            outcome.findings
        );
    }

    #[tokio::test]
    async fn test_detects_clean_architecture() {
        let outcome = run_on(&[
            "domain/entities.cs",
            "application/usecase.cs",
            "infrastructure/repo.cs",
            "tests/test_core.cs",
            "Dockerfile",
            ".github/workflows/ci.yml",
        ])
        .await;

        assert!(outcome
            .findings
            .iter()
            .any(|f| f.description.contains("Clean Architecture")));
    }

    #[tokio::test]
    async fn test_detects_mvc() {
        let outcome = run_on(&[
            "controllers/home.cs",
            "models/user.cs",
            "views/index.cshtml",
        ])
        .await;

        assert!(outcome
            .findings
            .iter()
            .any(|f| f.description.contains("MVC")));
    }
}
