//! In-process vector index.
//!
//! Backs tests and single-process deployments with the same tenancy
//! semantics as the HTTP-backed index: per-project collections named
//! `<prefix>_<project_id>_vectors`, or one shared collection filtered by the
//! `project_id` payload field.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::core::config::VectorConfig;
use crate::core::errors::Result;
use crate::vector::store::{
    normalize, point_id_for, ChunkPayload, IndexEntry, SearchHit, VectorIndex,
};

struct StoredPoint {
    vector: Vec<f32>,
    payload: ChunkPayload,
}

/// Thread-safe in-memory vector index.
pub struct InMemoryVectorIndex {
    config: VectorConfig,
    dimension: usize,
    collections: RwLock<HashMap<String, HashMap<Uuid, StoredPoint>>>,
}

impl InMemoryVectorIndex {
    /// Create an empty index.
    pub fn new(config: VectorConfig, dimension: usize) -> Self {
        Self {
            config,
            dimension,
            collections: RwLock::new(HashMap::new()),
        }
    }

    fn collection_name(&self, project: Uuid) -> String {
        if self.config.per_project_collections {
            format!("{}_{}_vectors", self.config.collection_prefix, project)
        } else {
            format!("{}_vectors", self.config.collection_prefix)
        }
    }

    fn insert_entry(
        &self,
        collections: &mut HashMap<String, HashMap<Uuid, StoredPoint>>,
        entry: IndexEntry,
    ) -> Result<()> {
        let project: Uuid = entry
            .payload
            .project_id
            .parse()
            .unwrap_or_else(|_| Uuid::nil());
        let vector = normalize(&entry.vector, self.dimension)?;
        let collection = collections
            .entry(self.collection_name(project))
            .or_default();
        collection.insert(
            point_id_for(&entry.chunk_hash),
            StoredPoint {
                vector,
                payload: entry.payload,
            },
        );
        Ok(())
    }

    fn matching_collections(
        &self,
        collections: &HashMap<String, HashMap<Uuid, StoredPoint>>,
        project: Option<Uuid>,
    ) -> Vec<String> {
        match project {
            Some(project) => vec![self.collection_name(project)],
            None => collections.keys().cloned().collect(),
        }
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn index(&self, entry: IndexEntry) -> Result<()> {
        let mut collections = self.collections.write();
        self.insert_entry(&mut collections, entry)
    }

    async fn index_batch(&self, entries: Vec<IndexEntry>) -> Result<()> {
        let mut collections = self.collections.write();
        for entry in entries {
            self.insert_entry(&mut collections, entry)?;
        }
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        project: Option<Uuid>,
    ) -> Result<Vec<SearchHit>> {
        let query = normalize(vector, self.dimension)?;
        let project_filter = project.map(|p| p.to_string());
        let collections = self.collections.read();

        let mut hits: Vec<SearchHit> = Vec::new();
        for name in self.matching_collections(&collections, project) {
            let Some(points) = collections.get(&name) else {
                continue;
            };
            for point in points.values() {
                if let Some(filter) = &project_filter {
                    if !self.config.per_project_collections && &point.payload.project_id != filter
                    {
                        continue;
                    }
                }
                let score: f32 = point
                    .vector
                    .iter()
                    .zip(query.iter())
                    .map(|(a, b)| a * b)
                    .sum();
                hits.push(SearchHit {
                    chunk_hash: point.payload.chunk_hash.clone(),
                    score,
                    payload: point.payload.clone(),
                });
            }
        }

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn retrieve(&self, project: Uuid, chunk_hash: &str) -> Result<Option<ChunkPayload>> {
        let collections = self.collections.read();
        let point_id = point_id_for(chunk_hash);
        Ok(collections
            .get(&self.collection_name(project))
            .and_then(|points| points.get(&point_id))
            .map(|point| point.payload.clone()))
    }

    async fn delete(&self, project: Uuid, chunk_hash: &str) -> Result<()> {
        let mut collections = self.collections.write();
        if let Some(points) = collections.get_mut(&self.collection_name(project)) {
            points.remove(&point_id_for(chunk_hash));
        }
        Ok(())
    }

    async fn delete_by_project(&self, project: Uuid) -> Result<()> {
        let mut collections = self.collections.write();
        if self.config.per_project_collections {
            // Per-project tenancy drops the whole collection.
            collections.remove(&self.collection_name(project));
        } else if let Some(points) = collections.get_mut(&self.collection_name(project)) {
            let filter = project.to_string();
            points.retain(|_, point| point.payload.project_id != filter);
        }
        Ok(())
    }

    async fn count(&self, project: Option<Uuid>) -> Result<usize> {
        let collections = self.collections.read();
        let project_filter = project.map(|p| p.to_string());

        let mut total = 0usize;
        for name in self.matching_collections(&collections, project) {
            let Some(points) = collections.get(&name) else {
                continue;
            };
            match (&project_filter, self.config.per_project_collections) {
                (Some(filter), false) => {
                    total += points
                        .values()
                        .filter(|p| &p.payload.project_id == filter)
                        .count();
                }
                _ => total += points.len(),
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::store::index_batch_verified;

    fn payload(project: Uuid, chunk_hash: &str, index: usize, total: usize) -> ChunkPayload {
        ChunkPayload {
            project_id: project.to_string(),
            file_path: "src/lib.rs".to_string(),
            start_line: 1,
            end_line: 10,
            language: "rust".to_string(),
            semantic_type: "method".to_string(),
            semantic_name: "parse".to_string(),
            chunk_index: index,
            total_chunks: total,
            chunk_hash: chunk_hash.to_string(),
        }
    }

    fn entry(project: Uuid, chunk_hash: &str, seed: f32) -> IndexEntry {
        IndexEntry {
            chunk_hash: chunk_hash.to_string(),
            vector: vec![seed, 1.0, 0.5, 0.25],
            payload: payload(project, chunk_hash, 0, 1),
        }
    }

    fn index(per_project: bool) -> InMemoryVectorIndex {
        let mut config = VectorConfig::default();
        config.per_project_collections = per_project;
        InMemoryVectorIndex::new(config, 4)
    }

    #[tokio::test]
    async fn test_indexing_is_idempotent() {
        let store = index(true);
        let project = Uuid::new_v4();

        store.index(entry(project, "hash-a", 1.0)).await.unwrap();
        store.index(entry(project, "hash-a", 1.0)).await.unwrap();

        assert_eq!(store.count(Some(project)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_query_respects_project_isolation_shared_mode() {
        let store = index(false);
        let mine = Uuid::new_v4();
        let theirs = Uuid::new_v4();

        store.index(entry(mine, "hash-mine", 1.0)).await.unwrap();
        store.index(entry(theirs, "hash-theirs", 1.0)).await.unwrap();

        let hits = store
            .query(&[1.0, 1.0, 0.5, 0.25], 10, Some(mine))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_hash, "hash-mine");
    }

    #[tokio::test]
    async fn test_query_ranks_by_cosine() {
        let store = index(true);
        let project = Uuid::new_v4();

        store
            .index(IndexEntry {
                chunk_hash: "aligned".to_string(),
                vector: vec![1.0, 0.0, 0.0, 0.0],
                payload: payload(project, "aligned", 0, 1),
            })
            .await
            .unwrap();
        store
            .index(IndexEntry {
                chunk_hash: "orthogonal".to_string(),
                vector: vec![0.0, 1.0, 0.0, 0.0],
                payload: payload(project, "orthogonal", 0, 1),
            })
            .await
            .unwrap();

        let hits = store
            .query(&[1.0, 0.0, 0.0, 0.0], 2, Some(project))
            .await
            .unwrap();
        assert_eq!(hits[0].chunk_hash, "aligned");
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn test_delete_by_project_modes() {
        for per_project in [true, false] {
            let store = index(per_project);
            let mine = Uuid::new_v4();
            let theirs = Uuid::new_v4();

            store.index(entry(mine, "hash-mine", 1.0)).await.unwrap();
            store.index(entry(theirs, "hash-theirs", 2.0)).await.unwrap();

            store.delete_by_project(mine).await.unwrap();
            assert_eq!(store.count(Some(mine)).await.unwrap(), 0);
            assert_eq!(store.count(Some(theirs)).await.unwrap(), 1);
        }
    }

    #[tokio::test]
    async fn test_verified_batch_rejects_bad_payload() {
        let store = index(true);
        let project = Uuid::new_v4();
        let bad = IndexEntry {
            chunk_hash: "bad".to_string(),
            vector: vec![1.0, 0.0, 0.0, 0.0],
            payload: payload(project, "bad", 3, 0),
        };

        let result = index_batch_verified(&store, project, vec![bad], false).await;
        assert_eq!(
            result.unwrap_err().error_code(),
            "VectorStore.Verification"
        );
    }

    #[tokio::test]
    async fn test_verified_batch_accepts_reindexing() {
        let store = index(true);
        let project = Uuid::new_v4();

        index_batch_verified(&store, project, vec![entry(project, "hash-a", 1.0)], true)
            .await
            .unwrap();
        // Same chunk again: the count stays flat, which is fine for a
        // re-index of an already present point.
        index_batch_verified(&store, project, vec![entry(project, "hash-a", 1.0)], true)
            .await
            .unwrap();
        assert_eq!(store.count(Some(project)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_mis_dimensioned_vector_fails_fast() {
        let store = index(true);
        let project = Uuid::new_v4();
        let result = store
            .index(IndexEntry {
                chunk_hash: "short".to_string(),
                vector: vec![1.0, 2.0],
                payload: payload(project, "short", 0, 1),
            })
            .await;
        assert!(result.is_err());
    }
}
