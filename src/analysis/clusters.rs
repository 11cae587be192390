//! Analysis-cluster construction.
//!
//! Groups related files so a single LLM call can cover one theme. Affinity
//! is directory-first: files sharing a parent directory seed a cluster, and
//! file-level embeddings (when the indexing phase produced them) pull
//! similar files together across directories. Every cluster respects the
//! configured maximum size.

use std::collections::BTreeMap;

use tracing::debug;

use crate::analysis::metrics::FileSummary;
use crate::core::entities::{AnalysisCluster, RiskLevel};

/// Builds [`AnalysisCluster`]s from file summaries.
pub struct ClusterBuilder {
    max_cluster_size: usize,
    similarity_threshold: f64,
}

impl ClusterBuilder {
    /// Create a builder with the given limits.
    pub fn new(max_cluster_size: usize, similarity_threshold: f64) -> Self {
        Self {
            max_cluster_size: max_cluster_size.max(1),
            similarity_threshold,
        }
    }

    /// Group files into themed clusters with aggregate statistics.
    pub fn build(&self, files: &[FileSummary]) -> Vec<AnalysisCluster> {
        if files.is_empty() {
            return Vec::new();
        }

        // Directory affinity first: deterministic and cheap.
        let mut by_directory: BTreeMap<String, Vec<&FileSummary>> = BTreeMap::new();
        for file in files {
            by_directory
                .entry(theme_of(&file.relative_path))
                .or_default()
                .push(file);
        }

        let mut clusters = Vec::new();
        for (theme, mut members) in by_directory {
            // Embedding similarity refines ordering inside a directory so
            // size-capped splits keep related files together.
            if members.iter().any(|f| f.embedding.is_some()) {
                self.order_by_similarity(&mut members);
            }

            for group in members.chunks(self.max_cluster_size) {
                clusters.push(self.materialize(&theme, group));
            }
        }

        debug!(files = files.len(), clusters = clusters.len(), "clusters built");
        clusters
    }

    /// Files worth a dedicated deep-dive pass, ordered by descending
    /// complexity.
    pub fn detect_high_priority_files<'a>(
        &self,
        files: &'a [FileSummary],
        complexity_threshold: u32,
        loc_threshold: usize,
    ) -> Vec<&'a FileSummary> {
        let mut selected: Vec<&FileSummary> = files
            .iter()
            .filter(|f| {
                f.complexity >= complexity_threshold || f.loc >= loc_threshold || f.is_high_risk
            })
            .collect();
        selected.sort_by(|a, b| {
            b.complexity
                .cmp(&a.complexity)
                .then(b.loc.cmp(&a.loc))
                .then(a.relative_path.cmp(&b.relative_path))
        });
        selected
    }

    /// Greedy seeded ordering: each file is placed next to its most similar
    /// predecessor when the cosine clears the threshold.
    fn order_by_similarity(&self, members: &mut [&FileSummary]) {
        for index in 1..members.len() {
            let mut best: Option<(usize, f64)> = None;
            for candidate in index..members.len() {
                let similarity = cosine(
                    members[index - 1].embedding.as_deref(),
                    members[candidate].embedding.as_deref(),
                );
                if similarity >= self.similarity_threshold {
                    match best {
                        Some((_, s)) if s >= similarity => {}
                        _ => best = Some((candidate, similarity)),
                    }
                }
            }
            if let Some((candidate, _)) = best {
                members.swap(index, candidate);
            }
        }
    }

    fn materialize(&self, theme: &str, group: &[&FileSummary]) -> AnalysisCluster {
        let total_loc: usize = group.iter().map(|f| f.loc).sum();
        let max_complexity = group.iter().map(|f| f.complexity).max().unwrap_or(0);
        let avg_complexity = if group.is_empty() {
            0.0
        } else {
            group.iter().map(|f| f.complexity as f64).sum::<f64>() / group.len() as f64
        };
        let any_high_risk = group.iter().any(|f| f.is_high_risk);

        let mut language_counts: BTreeMap<&str, usize> = BTreeMap::new();
        for file in group {
            *language_counts.entry(file.language.as_str()).or_default() += 1;
        }
        let primary_language = language_counts
            .into_iter()
            .max_by_key(|(_, count)| *count)
            .map(|(language, _)| language.to_string())
            .unwrap_or_else(|| "text".to_string());

        AnalysisCluster {
            theme: theme.to_string(),
            files: group.iter().map(|f| f.relative_path.clone()).collect(),
            risk: risk_level(max_complexity, total_loc, any_high_risk),
            primary_language,
            total_loc,
            avg_complexity,
            is_analyzed: false,
        }
    }
}

/// Theme key: the first two path segments, or the root marker.
fn theme_of(relative_path: &str) -> String {
    let segments: Vec<&str> = relative_path.split('/').collect();
    match segments.len() {
        0 | 1 => "(root)".to_string(),
        2 => segments[0].to_string(),
        _ => format!("{}/{}", segments[0], segments[1]),
    }
}

/// Derive a cluster risk level from its aggregate signals.
fn risk_level(max_complexity: u32, total_loc: usize, any_high_risk: bool) -> RiskLevel {
    let mut score = 0u8;
    if max_complexity >= 30 {
        score += 2;
    } else if max_complexity >= 15 {
        score += 1;
    }
    if total_loc >= 2000 {
        score += 1;
    }
    if any_high_risk {
        score += 1;
    }
    match score {
        0 => RiskLevel::Low,
        1 => RiskLevel::Medium,
        2 => RiskLevel::High,
        _ => RiskLevel::Critical,
    }
}

fn cosine(a: Option<&[f32]>, b: Option<&[f32]>) -> f64 {
    match (a, b) {
        (Some(a), Some(b)) if a.len() == b.len() && !a.is_empty() => {
            let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
            let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
            let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
            if na <= f32::EPSILON || nb <= f32::EPSILON {
                0.0
            } else {
                (dot / (na * nb)) as f64
            }
        }
        _ => 0.0,
    }
}
