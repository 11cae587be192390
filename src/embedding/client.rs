//! Rate-limited, batched embedding generation.
//!
//! The [`EmbeddingClient`] wraps any [`EmbeddingProvider`] with the two
//! throughput controls the pipeline depends on: a counted semaphore bounding
//! in-flight requests and the per-minute token reservation window. Both
//! controls degrade rather than deadlock — a two-minute gate timeout and a
//! 120-wait limiter cap each proceed with a warning.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::config::{EmbeddingConfig, ResilienceConfig};
use crate::core::errors::{ArchrevError, Result};
use crate::core::tokens::TokenCounter;
use crate::embedding::limiter::TokenRateLimiter;
use crate::resilience::OutboundPolicy;

/// How long a caller waits on the concurrency gate before proceeding anyway.
const GATE_TIMEOUT: Duration = Duration::from_secs(120);

/// External embedding provider behind a narrow interface.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

/// OpenAI-compatible HTTP embedding provider.
pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    config: EmbeddingConfig,
}

impl HttpEmbeddingProvider {
    /// Create a provider over the configured endpoint.
    pub fn new(config: EmbeddingConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let request = EmbeddingRequest {
            model: &self.config.model,
            input: texts,
        };

        let mut builder = self.client.post(&self.config.endpoint).json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ArchrevError::from_http_status(
                "Embedding",
                status.as_u16(),
                body,
            ));
        }

        let parsed: EmbeddingResponse = response.json().await?;
        let mut vectors: Vec<(usize, Vec<f32>)> = parsed
            .data
            .into_iter()
            .map(|d| (d.index, d.embedding))
            .collect();
        vectors.sort_by_key(|(index, _)| *index);

        if vectors.len() != texts.len() {
            return Err(ArchrevError::internal(format!(
                "embedding provider returned {} vectors for {} inputs",
                vectors.len(),
                texts.len()
            )));
        }

        Ok(vectors.into_iter().map(|(_, v)| v).collect())
    }
}

/// Bounded-concurrency, rate-limited embedding client.
pub struct EmbeddingClient {
    provider: Arc<dyn EmbeddingProvider>,
    gate: Arc<Semaphore>,
    limiter: TokenRateLimiter,
    policy: OutboundPolicy,
    tokens: &'static TokenCounter,
    dimension: usize,
    batch_size: usize,
}

impl EmbeddingClient {
    /// Wrap a provider with the configured throughput controls.
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        config: &EmbeddingConfig,
        resilience: &ResilienceConfig,
    ) -> Self {
        Self {
            provider,
            gate: Arc::new(Semaphore::new(config.embedding_concurrency)),
            limiter: TokenRateLimiter::new(config.embedding_tokens_per_minute),
            policy: OutboundPolicy::new(
                "Embedding",
                resilience,
                Duration::from_secs(resilience.embed_timeout_seconds),
            ),
            tokens: TokenCounter::shared(),
            dimension: config.embedding_dimension,
            batch_size: config.embedding_batch_size,
        }
    }

    /// Embed one batch: reserve tokens, take a gate slot, call the provider
    /// through the resilience policy, and validate every dimension.
    pub async fn embed_batch(
        &self,
        texts: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if cancel.is_cancelled() {
            return Err(ArchrevError::cancelled("embedding batch"));
        }

        let estimated: u64 = texts.iter().map(|t| self.tokens.count(t) as u64).sum();
        self.limiter.reserve(estimated).await;

        if cancel.is_cancelled() {
            return Err(ArchrevError::cancelled("embedding batch"));
        }

        // The gate prevents provider overload; a timed-out acquisition
        // proceeds unguarded instead of deadlocking the pipeline.
        let _permit = match tokio::time::timeout(GATE_TIMEOUT, self.gate.clone().acquire_owned())
            .await
        {
            Ok(Ok(permit)) => Some(permit),
            Ok(Err(_)) => None,
            Err(_) => {
                warn!("embedding gate not acquired within 120s; proceeding unguarded");
                None
            }
        };

        let vectors = self.policy.execute(|| self.provider.embed(texts)).await?;

        for vector in &vectors {
            if vector.len() != self.dimension {
                return Err(ArchrevError::internal(format!(
                    "embedding dimension mismatch: expected {}, got {}",
                    self.dimension,
                    vector.len()
                )));
            }
        }

        debug!(batch = texts.len(), tokens = estimated, "batch embedded");
        Ok(vectors)
    }

    /// Embed a full input sequence in `batch_size` groups, reporting progress
    /// as `(processed, total)` after each group.
    pub async fn embed_all<F>(
        &self,
        texts: &[String],
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> Result<Vec<Vec<f32>>>
    where
        F: FnMut(usize, usize),
    {
        let mut vectors = Vec::with_capacity(texts.len());
        for group in texts.chunks(self.batch_size) {
            if cancel.is_cancelled() {
                return Err(ArchrevError::cancelled("embedding sequence"));
            }
            let batch = self.embed_batch(group, cancel).await?;
            vectors.extend(batch);
            on_progress(vectors.len(), texts.len());
        }

        info!(total = vectors.len(), "embedding sequence complete");
        Ok(vectors)
    }

    /// Expected vector dimensionality.
    pub fn dimension(&self) -> usize {
        self.dimension
    }
}
