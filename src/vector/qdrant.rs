//! Qdrant-compatible HTTP vector index.
//!
//! Speaks the plain REST surface: collection create, point upsert, search,
//! count, delete by id or filter, and retrieve by id. Collection naming and
//! project filtering follow the same tenancy switch as the in-memory index.
//! All requests flow through the resilience policy shared with the other
//! outbound services.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::core::config::{ResilienceConfig, VectorConfig};
use crate::core::errors::{ArchrevError, Result};
use crate::resilience::OutboundPolicy;
use crate::vector::store::{
    normalize, point_id_for, ChunkPayload, IndexEntry, SearchHit, VectorIndex,
};

/// Per-call timeout for vector store requests.
const VECTOR_CALL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize)]
struct UpsertPoint {
    id: Uuid,
    vector: Vec<f32>,
    payload: ChunkPayload,
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ScoredPoint {
    score: f32,
    payload: Option<ChunkPayload>,
}

#[derive(Debug, Deserialize)]
struct RetrievedPoint {
    payload: Option<ChunkPayload>,
}

#[derive(Debug, Deserialize)]
struct CountResult {
    count: usize,
}

/// HTTP-backed vector index against a Qdrant-compatible service.
pub struct QdrantHttpIndex {
    client: reqwest::Client,
    config: VectorConfig,
    dimension: usize,
    policy: OutboundPolicy,
}

impl QdrantHttpIndex {
    /// Create an index client over the configured endpoint.
    pub fn new(config: VectorConfig, dimension: usize, resilience: &ResilienceConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            dimension,
            policy: OutboundPolicy::new("VectorStore", resilience, VECTOR_CALL_TIMEOUT),
        }
    }

    fn collection_name(&self, project: Uuid) -> String {
        if self.config.per_project_collections {
            format!("{}_{}_vectors", self.config.collection_prefix, project)
        } else {
            format!("{}_vectors", self.config.collection_prefix)
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.endpoint.trim_end_matches('/'), path)
    }

    fn project_filter(&self, project: Option<Uuid>) -> Option<serde_json::Value> {
        // Per-project tenancy already isolates by collection name.
        if self.config.per_project_collections {
            return None;
        }
        project.map(|p| {
            json!({
                "must": [{"key": "project_id", "match": {"value": p.to_string()}}]
            })
        })
    }

    /// Create the collection if it does not exist yet; conflicts are fine.
    async fn ensure_collection(&self, name: &str) -> Result<()> {
        let body = json!({
            "vectors": {"size": self.dimension, "distance": "Cosine"}
        });
        let response = self
            .client
            .put(self.url(&format!("collections/{name}")))
            .json(&body)
            .send()
            .await?;

        let status = response.status().as_u16();
        if response.status().is_success() || status == 409 {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(ArchrevError::from_http_status("VectorStore", status, body))
    }

    async fn parse_envelope<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<Option<T>> {
        let status = response.status().as_u16();
        if status == 404 {
            // Missing collections read as empty rather than failing.
            return Ok(None);
        }
        if !(200..300).contains(&status) {
            let body = response.text().await.unwrap_or_default();
            return Err(ArchrevError::from_http_status("VectorStore", status, body));
        }
        let envelope: ApiEnvelope<T> = response.json().await?;
        Ok(envelope.result)
    }
}

#[async_trait]
impl VectorIndex for QdrantHttpIndex {
    async fn index(&self, entry: IndexEntry) -> Result<()> {
        self.index_batch(vec![entry]).await
    }

    async fn index_batch(&self, entries: Vec<IndexEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let project: Uuid = entries[0]
            .payload
            .project_id
            .parse()
            .map_err(|_| ArchrevError::internal("entry payload carries a malformed project id"))?;
        let name = self.collection_name(project);

        let mut points = Vec::with_capacity(entries.len());
        for entry in &entries {
            points.push(UpsertPoint {
                id: point_id_for(&entry.chunk_hash),
                vector: normalize(&entry.vector, self.dimension)?,
                payload: entry.payload.clone(),
            });
        }

        let body = json!({ "points": points });
        self.policy
            .execute(|| async {
                self.ensure_collection(&name).await?;
                let response = self
                    .client
                    .put(self.url(&format!("collections/{name}/points")))
                    .json(&body)
                    .send()
                    .await?;
                let status = response.status().as_u16();
                if !(200..300).contains(&status) {
                    let body = response.text().await.unwrap_or_default();
                    return Err(ArchrevError::from_http_status("VectorStore", status, body));
                }
                Ok(())
            })
            .await?;

        debug!(collection = %name, points = entries.len(), "points upserted");
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        project: Option<Uuid>,
    ) -> Result<Vec<SearchHit>> {
        let query = normalize(vector, self.dimension)?;
        let name = match project {
            Some(p) => self.collection_name(p),
            None => format!("{}_vectors", self.config.collection_prefix),
        };

        let mut body = json!({
            "vector": query,
            "limit": top_k,
            "with_payload": true,
        });
        if let Some(filter) = self.project_filter(project) {
            body["filter"] = filter;
        }

        let points: Option<Vec<ScoredPoint>> = self
            .policy
            .execute(|| async {
                let response = self
                    .client
                    .post(self.url(&format!("collections/{name}/points/search")))
                    .json(&body)
                    .send()
                    .await?;
                self.parse_envelope(response).await
            })
            .await?;

        Ok(points
            .unwrap_or_default()
            .into_iter()
            .filter_map(|point| {
                point.payload.map(|payload| SearchHit {
                    chunk_hash: payload.chunk_hash.clone(),
                    score: point.score,
                    payload,
                })
            })
            .collect())
    }

    async fn retrieve(&self, project: Uuid, chunk_hash: &str) -> Result<Option<ChunkPayload>> {
        let name = self.collection_name(project);
        let body = json!({
            "ids": [point_id_for(chunk_hash)],
            "with_payload": true,
        });

        let points: Option<Vec<RetrievedPoint>> = self
            .policy
            .execute(|| async {
                let response = self
                    .client
                    .post(self.url(&format!("collections/{name}/points")))
                    .json(&body)
                    .send()
                    .await?;
                self.parse_envelope(response).await
            })
            .await?;

        Ok(points
            .unwrap_or_default()
            .into_iter()
            .find_map(|point| point.payload))
    }

    async fn delete(&self, project: Uuid, chunk_hash: &str) -> Result<()> {
        let name = self.collection_name(project);
        let body = json!({"points": [point_id_for(chunk_hash)]});

        self.policy
            .execute(|| async {
                let response = self
                    .client
                    .post(self.url(&format!("collections/{name}/points/delete")))
                    .json(&body)
                    .send()
                    .await?;
                self.parse_envelope::<serde_json::Value>(response).await?;
                Ok(())
            })
            .await
    }

    async fn delete_by_project(&self, project: Uuid) -> Result<()> {
        let name = self.collection_name(project);

        if self.config.per_project_collections {
            // Dropping the collection removes every point at once.
            self.policy
                .execute(|| async {
                    let response = self
                        .client
                        .delete(self.url(&format!("collections/{name}")))
                        .send()
                        .await?;
                    self.parse_envelope::<serde_json::Value>(response).await?;
                    Ok(())
                })
                .await
        } else {
            let body = json!({
                "filter": {
                    "must": [{"key": "project_id", "match": {"value": project.to_string()}}]
                }
            });
            self.policy
                .execute(|| async {
                    let response = self
                        .client
                        .post(self.url(&format!("collections/{name}/points/delete")))
                        .json(&body)
                        .send()
                        .await?;
                    self.parse_envelope::<serde_json::Value>(response).await?;
                    Ok(())
                })
                .await
        }
    }

    async fn count(&self, project: Option<Uuid>) -> Result<usize> {
        let name = match project {
            Some(p) => self.collection_name(p),
            None => format!("{}_vectors", self.config.collection_prefix),
        };

        let mut body = json!({"exact": true});
        if let Some(filter) = self.project_filter(project) {
            body["filter"] = filter;
        }

        let result: Option<CountResult> = self
            .policy
            .execute(|| async {
                let response = self
                    .client
                    .post(self.url(&format!("collections/{name}/points/count")))
                    .json(&body)
                    .send()
                    .await?;
                self.parse_envelope(response).await
            })
            .await?;

        Ok(result.map(|r| r.count).unwrap_or(0))
    }
}
