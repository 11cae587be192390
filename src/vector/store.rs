//! Vector index contract and shared indexing semantics.
//!
//! Vectors are unit-normalized at insert time so cosine similarity reduces
//! to a dot product everywhere downstream. Point identity is derived from
//! the chunk hash, which makes re-indexing the same chunk overwrite in
//! place. Batch indexing verifies a retrieved sample and optionally
//! re-counts, aborting on any payload invariant violation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::chunking::chunk::Chunk;
use crate::core::errors::{ArchrevError, Result};

/// Norm tolerance for the unit-length invariant.
pub const NORM_EPSILON: f32 = 1e-4;

/// Wire-exact point payload mirroring the chunk metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkPayload {
    /// Owning project id, stringified UUID
    pub project_id: String,
    /// Path relative to the extraction root
    pub file_path: String,
    /// First line, 1-based inclusive
    pub start_line: usize,
    /// Last line, 1-based inclusive
    pub end_line: usize,
    /// Language key
    pub language: String,
    /// Semantic unit kind, wire string
    pub semantic_type: String,
    /// Semantic unit name
    pub semantic_name: String,
    /// Chunk position within its file
    pub chunk_index: usize,
    /// Chunk count for the file
    pub total_chunks: usize,
    /// 16-hex chunk identity
    pub chunk_hash: String,
}

impl ChunkPayload {
    /// Build the payload for a chunk.
    pub fn from_chunk(chunk: &Chunk) -> Self {
        Self {
            project_id: chunk.project_id.to_string(),
            file_path: chunk.file_path.clone(),
            start_line: chunk.start_line,
            end_line: chunk.end_line,
            language: chunk.language.clone(),
            semantic_type: chunk.semantic_type.as_str().to_string(),
            semantic_name: chunk.semantic_name.clone(),
            chunk_index: chunk.chunk_index,
            total_chunks: chunk.total_chunks,
            chunk_hash: chunk.chunk_hash.clone(),
        }
    }

    /// Index/count invariants the verification step checks on retrieval.
    pub fn invariants_hold(&self) -> bool {
        self.total_chunks > 0 && self.chunk_index < self.total_chunks
    }
}

/// One similarity search result.
#[derive(Debug, Clone)]
pub struct SearchHit {
    /// Chunk identity
    pub chunk_hash: String,
    /// Cosine similarity against the query
    pub score: f32,
    /// Stored payload
    pub payload: ChunkPayload,
}

/// One entry handed to batch indexing.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    /// Chunk identity
    pub chunk_hash: String,
    /// Raw vector; normalized by the store
    pub vector: Vec<f32>,
    /// Point payload
    pub payload: ChunkPayload,
}

/// Project-scoped vector index.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Upsert a single point.
    async fn index(&self, entry: IndexEntry) -> Result<()>;

    /// Upsert a batch of points.
    async fn index_batch(&self, entries: Vec<IndexEntry>) -> Result<()>;

    /// Similarity search, optionally filtered to one project.
    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        project: Option<Uuid>,
    ) -> Result<Vec<SearchHit>>;

    /// Retrieve a point's payload by chunk hash, scoped to a project.
    async fn retrieve(&self, project: Uuid, chunk_hash: &str) -> Result<Option<ChunkPayload>>;

    /// Delete a single point.
    async fn delete(&self, project: Uuid, chunk_hash: &str) -> Result<()>;

    /// Delete everything belonging to one project. In per-project tenancy
    /// this drops the collection; in shared tenancy it deletes by filter.
    async fn delete_by_project(&self, project: Uuid) -> Result<()>;

    /// Point count, optionally filtered to one project.
    async fn count(&self, project: Option<Uuid>) -> Result<usize>;
}

/// Unit-normalize a vector, rejecting zero and non-finite norms.
pub fn normalize(vector: &[f32], expected_dimension: usize) -> Result<Vec<f32>> {
    if vector.len() != expected_dimension {
        return Err(ArchrevError::internal(format!(
            "vector dimension mismatch: expected {expected_dimension}, got {}",
            vector.len()
        )));
    }
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if !norm.is_finite() || norm <= f32::EPSILON {
        return Err(ArchrevError::internal(
            "cannot normalize a zero or non-finite vector",
        ));
    }
    Ok(vector.iter().map(|v| v / norm).collect())
}

/// Stable 128-bit point id for a chunk hash.
///
/// Hashing the chunk hash to a fixed UUID makes repeated indexing of the
/// same chunk an overwrite rather than a duplicate.
pub fn point_id_for(chunk_hash: &str) -> Uuid {
    let mut hasher = Sha256::new();
    hasher.update(chunk_hash.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes)
}

/// Index a batch, then verify a retrieved sample and optionally re-count.
///
/// Any payload invariant violation on the sample aborts indexing with
/// `VectorStore.Verification`; a flat count with `fail_on_indexing_failure`
/// does the same.
pub async fn index_batch_verified(
    index: &dyn VectorIndex,
    project: Uuid,
    entries: Vec<IndexEntry>,
    fail_on_indexing_failure: bool,
) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }

    let before = if fail_on_indexing_failure {
        Some(index.count(Some(project)).await?)
    } else {
        None
    };

    let sample_hash = entries[0].chunk_hash.clone();
    let already_present = index.retrieve(project, &sample_hash).await?.is_some();
    index.index_batch(entries).await?;

    let sample = index
        .retrieve(project, &sample_hash)
        .await?
        .ok_or_else(|| {
            ArchrevError::vector_verification(format!(
                "indexed sample {sample_hash} could not be retrieved"
            ))
        })?;
    if !sample.invariants_hold() {
        return Err(ArchrevError::vector_verification(format!(
            "sample {sample_hash} violates chunk invariants: index {} of {}",
            sample.chunk_index, sample.total_chunks
        )));
    }

    if let Some(before) = before {
        let after = index.count(Some(project)).await?;
        // Re-indexing existing chunks legitimately leaves the count flat.
        if after <= before && !already_present {
            warn!(before, after, "vector count did not grow after batch");
            return Err(ArchrevError::vector_verification(format!(
                "count did not increase after batch: {before} -> {after}"
            )));
        }
    }

    debug!(sample = %sample_hash, "batch indexed and verified");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_produces_unit_length() {
        let normalized = normalize(&[3.0, 4.0], 2).unwrap();
        let norm: f32 = normalized.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < NORM_EPSILON);
    }

    #[test]
    fn test_normalize_rejects_bad_input() {
        assert!(normalize(&[0.0, 0.0], 2).is_err());
        assert!(normalize(&[1.0, 2.0, 3.0], 2).is_err());
        assert!(normalize(&[f32::NAN, 1.0], 2).is_err());
    }

    #[test]
    fn test_point_id_is_stable_and_distinct() {
        let a = point_id_for("abcdef0123456789");
        let b = point_id_for("abcdef0123456789");
        let c = point_id_for("fedcba9876543210");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_payload_invariants() {
        let mut payload = ChunkPayload {
            project_id: Uuid::new_v4().to_string(),
            file_path: "src/lib.rs".to_string(),
            start_line: 1,
            end_line: 10,
            language: "rust".to_string(),
            semantic_type: "method".to_string(),
            semantic_name: "parse".to_string(),
            chunk_index: 0,
            total_chunks: 1,
            chunk_hash: "abc".to_string(),
        };
        assert!(payload.invariants_hold());

        payload.total_chunks = 0;
        assert!(!payload.invariants_hold());

        payload.total_chunks = 2;
        payload.chunk_index = 2;
        assert!(!payload.invariants_hold());
    }
}
