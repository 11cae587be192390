//! Per-file routing decisions and the preflight estimate.
//!
//! The router walks an extracted tree and decides, per file, whether its
//! full text rides along in direct LLM context, whether it is chunked and
//! embedded for retrieval, or whether it is skipped. The decision rule is
//! ordered and closed; boundary semantics matter downstream (a file exactly
//! at the direct threshold is chunked, a file exactly at the RAG threshold
//! still qualifies).

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::core::config::RouterConfig;
use crate::core::errors::Result;

/// Directory names excluded wherever they appear in a path.
const EXCLUDED_SEGMENTS: &[&str] = &[
    "node_modules",
    "bin",
    "obj",
    ".git",
    ".vs",
    ".idea",
    ".vscode",
    "packages",
    "dist",
    "build",
    "__pycache__",
    ".venv",
    "venv",
    "coverage",
    ".nyc_output",
    "TestResults",
    ".nuget",
    "vendor",
    ".gradle",
    "target",
    "out",
    ".next",
    ".cache",
];

/// Extensions that are never analyzable regardless of size.
const BINARY_EXTENSIONS: &[&str] = &[
    ".png", ".jpg", ".jpeg", ".gif", ".bmp", ".ico", ".webp", ".tiff", ".dll", ".exe", ".pdb",
    ".so", ".dylib", ".a", ".o", ".lib", ".zip", ".tar", ".gz", ".bz2", ".xz", ".7z", ".rar",
    ".jar", ".war", ".class", ".pyc", ".pyo", ".wasm", ".woff", ".woff2", ".ttf", ".eot", ".otf",
    ".mp3", ".mp4", ".avi", ".mov", ".wav", ".pdf", ".doc", ".docx", ".xls", ".xlsx", ".ppt",
    ".pptx", ".bin", ".dat", ".db", ".sqlite", ".iso", ".dmg",
];

/// Source-code extensions eligible for analysis.
const SOURCE_EXTENSIONS: &[&str] = &[
    ".cs", ".ts", ".tsx", ".js", ".jsx", ".py", ".java", ".go", ".rs", ".cpp", ".c", ".h",
    ".hpp", ".rb", ".php", ".swift", ".kt", ".scala", ".vue", ".svelte", ".razor", ".cshtml",
    ".fs", ".fsx", ".vb", ".lua", ".r", ".jl", ".dart", ".elm", ".clj", ".ex", ".exs", ".erl",
    ".hrl",
];

/// Configuration and documentation extensions routed like source.
const CONFIG_EXTENSIONS: &[&str] = &[".json", ".yaml", ".yml", ".xml", ".config", ".toml", ".md"];

/// Config files matched by exact basename.
const CONFIG_BASENAMES: &[&str] = &["Dockerfile", ".env", "Makefile", "CMakeLists.txt"];

/// Why a file was left out of the analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// Lives under an excluded directory or has no analyzable extension
    ExcludedPath,
    /// Binary extension
    Binary,
    /// Above the RAG threshold without `allow_large_files`
    TooLarge,
}

/// Routing decision for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteDecision {
    /// Full text goes into direct LLM context
    DirectSend,
    /// Chunked, embedded, retrieved by similarity
    RagChunks,
    /// Not analyzed
    Skipped(SkipReason),
}

impl RouteDecision {
    /// Whether the file participates in analysis at all.
    pub fn is_analyzed(self) -> bool {
        !matches!(self, RouteDecision::Skipped(_))
    }
}

/// Routing outcome for one file in the extracted tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAnalysisPlan {
    /// Path relative to the extraction root, forward slashes
    pub relative_path: String,
    /// Lower-cased extension including the dot, empty when none
    pub extension: String,
    /// Size in bytes
    pub size_bytes: u64,
    /// Routing decision
    pub decision: RouteDecision,
    /// Externally supplied risk score, when a filter ran
    pub risk_score: Option<f64>,
    /// Whether the risk score met the configured threshold
    pub is_high_risk: bool,
}

/// Pre-analysis estimate of counts, tokens, cost, and processing time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightEstimate {
    /// Files routed to direct context
    pub direct_count: usize,
    /// Files routed to RAG chunking
    pub rag_count: usize,
    /// Files skipped
    pub skipped_count: usize,
    /// Token estimate (size/4) over analyzed files
    pub estimated_tokens: u64,
    /// Cost estimate at the configured price per 1k tokens
    pub estimated_cost: f64,
    /// Processing time heuristic in seconds
    pub estimated_seconds: u64,
    /// Analyzed-file counts by extension
    pub extension_breakdown: BTreeMap<String, usize>,
    /// Soft warnings surfaced to the caller
    pub warnings: Vec<String>,
    /// Whether the job must carry an approval flag to proceed
    pub requires_approval: bool,
}

/// Optional external scorer attaching a risk value to a file path.
pub type RiskFilter = dyn Fn(&str) -> Option<f64> + Send + Sync;

/// Walks extracted trees and routes each file.
pub struct FileRouter {
    config: RouterConfig,
    risk_filter: Option<Arc<RiskFilter>>,
}

impl FileRouter {
    /// Create a router over the given thresholds.
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            risk_filter: None,
        }
    }

    /// Attach an external risk filter; scores at or above the configured
    /// threshold tag files high-risk for downstream prioritization.
    pub fn with_risk_filter(mut self, filter: Arc<RiskFilter>) -> Self {
        self.risk_filter = Some(filter);
        self
    }

    /// Route a single file by relative path and size.
    ///
    /// The rule is evaluated strictly in order: excluded path, binary
    /// extension, unknown extension, direct threshold, RAG threshold,
    /// large-file gate.
    pub fn route(&self, relative_path: &str, size_bytes: u64) -> RouteDecision {
        if has_excluded_segment(relative_path) {
            return RouteDecision::Skipped(SkipReason::ExcludedPath);
        }

        let basename = relative_path.rsplit('/').next().unwrap_or(relative_path);
        let extension = extension_of(basename);

        if BINARY_EXTENSIONS.contains(&extension.as_str()) {
            return RouteDecision::Skipped(SkipReason::Binary);
        }

        let is_source = SOURCE_EXTENSIONS.contains(&extension.as_str());
        let is_config = CONFIG_EXTENSIONS.contains(&extension.as_str())
            || CONFIG_BASENAMES.contains(&basename);
        if !is_source && !is_config {
            return RouteDecision::Skipped(SkipReason::ExcludedPath);
        }

        if size_bytes < self.config.direct_send_threshold_bytes {
            return RouteDecision::DirectSend;
        }
        if size_bytes <= self.config.rag_chunk_threshold_bytes {
            return RouteDecision::RagChunks;
        }
        if self.config.allow_large_files {
            RouteDecision::RagChunks
        } else {
            RouteDecision::Skipped(SkipReason::TooLarge)
        }
    }

    /// Walk the extracted tree and produce one plan per regular file.
    pub fn plan_tree(&self, root: &Path) -> Result<Vec<FileAnalysisPlan>> {
        let mut plans = Vec::new();

        for entry in WalkDir::new(root).follow_links(false) {
            let entry = match entry {
                Ok(e) => e,
                Err(err) => {
                    debug!("walk error under {}: {err}", root.display());
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let relative = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            let decision = self.route(&relative, size);

            let risk_score = self
                .risk_filter
                .as_ref()
                .and_then(|filter| filter(&relative));
            let is_high_risk = risk_score
                .map(|score| score >= self.config.risk_threshold)
                .unwrap_or(false);

            plans.push(FileAnalysisPlan {
                extension: extension_of(
                    relative.rsplit('/').next().unwrap_or(relative.as_str()),
                ),
                relative_path: relative,
                size_bytes: size,
                decision,
                risk_score,
                is_high_risk,
            });
        }

        plans.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        info!(
            total = plans.len(),
            analyzed = plans.iter().filter(|p| p.decision.is_analyzed()).count(),
            "file routing complete"
        );
        Ok(plans)
    }

    /// Compute the preflight estimate over a set of plans.
    pub fn preflight(&self, plans: &[FileAnalysisPlan]) -> PreflightEstimate {
        let mut direct_count = 0usize;
        let mut rag_count = 0usize;
        let mut skipped_count = 0usize;
        let mut estimated_tokens = 0u64;
        let mut extension_breakdown: BTreeMap<String, usize> = BTreeMap::new();

        for plan in plans {
            match plan.decision {
                RouteDecision::DirectSend => direct_count += 1,
                RouteDecision::RagChunks => rag_count += 1,
                RouteDecision::Skipped(_) => {
                    skipped_count += 1;
                    continue;
                }
            }
            estimated_tokens += plan.size_bytes / 4;
            *extension_breakdown
                .entry(plan.extension.clone())
                .or_default() += 1;
        }

        let estimated_cost =
            (estimated_tokens as f64 / 1000.0) * self.config.price_per_1k_tokens;
        let analyzed = direct_count + rag_count;
        let estimated_seconds = estimated_tokens / 1000 + analyzed as u64;

        let mut warnings = Vec::new();
        if estimated_tokens > self.config.warn_threshold_tokens {
            warnings.push(format!(
                "Estimated {estimated_tokens} tokens exceeds the warning threshold of {}",
                self.config.warn_threshold_tokens
            ));
        }

        let over_tokens = estimated_tokens > self.config.approval_threshold_tokens;
        let over_cost = self.config.price_per_1k_tokens > 0.0
            && estimated_cost > self.config.approval_threshold_cost;
        let requires_approval = over_tokens || over_cost;

        PreflightEstimate {
            direct_count,
            rag_count,
            skipped_count,
            estimated_tokens,
            estimated_cost,
            estimated_seconds,
            extension_breakdown,
            warnings,
            requires_approval,
        }
    }
}

fn has_excluded_segment(relative_path: &str) -> bool {
    relative_path
        .split('/')
        .any(|segment| EXCLUDED_SEGMENTS.contains(&segment))
}

fn extension_of(basename: &str) -> String {
    match basename.rfind('.') {
        // A leading dot alone (".env") is a basename, not an extension.
        Some(0) | None => String::new(),
        Some(idx) => basename[idx..].to_ascii_lowercase(),
    }
}
