//! Retrieval-augmented context for agent prompts.
//!
//! Agents describe what they are about to analyze; the retriever embeds the
//! description and pulls the most similar indexed chunks for the project.
//! Retrieval failures degrade to an empty context — prompts lose color, the
//! agent run continues.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::embedding::client::EmbeddingClient;
use crate::vector::store::{SearchHit, VectorIndex};

/// Default number of chunks pulled into a prompt.
const DEFAULT_TOP_K: usize = 5;

/// Project-scoped similarity retriever handed to agents.
pub struct Retriever {
    project_id: Uuid,
    embedder: Arc<EmbeddingClient>,
    index: Arc<dyn VectorIndex>,
}

impl Retriever {
    /// Create a retriever bound to one project.
    pub fn new(
        project_id: Uuid,
        embedder: Arc<EmbeddingClient>,
        index: Arc<dyn VectorIndex>,
    ) -> Self {
        Self {
            project_id,
            embedder,
            index,
        }
    }

    /// Most similar chunks for a query text; empty on any failure.
    pub async fn related(&self, query: &str, cancel: &CancellationToken) -> Vec<SearchHit> {
        let vectors = match self
            .embedder
            .embed_batch(&[query.to_string()], cancel)
            .await
        {
            Ok(vectors) => vectors,
            Err(err) => {
                warn!("retrieval embedding failed: {err}");
                return Vec::new();
            }
        };
        let Some(vector) = vectors.into_iter().next() else {
            return Vec::new();
        };

        match self
            .index
            .query(&vector, DEFAULT_TOP_K, Some(self.project_id))
            .await
        {
            Ok(hits) => hits,
            Err(err) => {
                warn!("retrieval query failed: {err}");
                Vec::new()
            }
        }
    }

    /// Render hits into a compact prompt section.
    pub fn render_context(hits: &[SearchHit]) -> String {
        if hits.is_empty() {
            return String::new();
        }
        let mut section = String::from("Related code elsewhere in the project:\n");
        for hit in hits {
            section.push_str(&format!(
                "- {} `{}` at {}:{}-{} (similarity {:.2})\n",
                hit.payload.semantic_type,
                hit.payload.semantic_name,
                hit.payload.file_path,
                hit.payload.start_line,
                hit.payload.end_line,
                hit.score
            ));
        }
        section
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{EmbeddingConfig, ResilienceConfig, VectorConfig};
    use crate::embedding::client::EmbeddingProvider;
    use crate::vector::memory::InMemoryVectorIndex;
    use crate::vector::store::{ChunkPayload, IndexEntry};
    use async_trait::async_trait;

    struct UnitEmbedder;

    #[async_trait]
    impl EmbeddingProvider for UnitEmbedder {
        async fn embed(
            &self,
            texts: &[String],
        ) -> crate::core::errors::Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0, 0.0, 0.0]).collect())
        }
    }

    fn payload(project: Uuid, hash: &str) -> ChunkPayload {
        ChunkPayload {
            project_id: project.to_string(),
            file_path: "src/other.rs".to_string(),
            start_line: 1,
            end_line: 9,
            language: "rust".to_string(),
            semantic_type: "method".to_string(),
            semantic_name: "helper".to_string(),
            chunk_index: 0,
            total_chunks: 1,
            chunk_hash: hash.to_string(),
        }
    }

    #[tokio::test]
    async fn test_related_returns_project_hits() {
        let project = Uuid::new_v4();
        let index = Arc::new(InMemoryVectorIndex::new(VectorConfig::default(), 4));
        index
            .index(IndexEntry {
                chunk_hash: "near".to_string(),
                vector: vec![1.0, 0.0, 0.0, 0.0],
                payload: payload(project, "near"),
            })
            .await
            .unwrap();

        let mut config = EmbeddingConfig::default();
        config.embedding_dimension = 4;
        let embedder = Arc::new(EmbeddingClient::new(
            Arc::new(UnitEmbedder),
            &config,
            &ResilienceConfig::default(),
        ));

        let retriever = Retriever::new(project, embedder, index);
        let hits = retriever
            .related("query text", &CancellationToken::new())
            .await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_hash, "near");

        let rendered = Retriever::render_context(&hits);
        assert!(rendered.contains("src/other.rs"));
        assert!(rendered.contains("helper"));
    }

    #[tokio::test]
    async fn test_empty_context_renders_empty() {
        assert!(Retriever::render_context(&[]).is_empty());
    }
}
