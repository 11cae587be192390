//! Configuration types and management for archrev-rs.
//!
//! Every tunable of the analysis pipeline lives here, grouped by component.
//! Defaults match the documented configuration keys; `validate()` rejects
//! combinations the pipeline cannot honor before any job starts.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::errors::{ArchrevError, Result};

/// Main configuration for the archrev engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchrevConfig {
    /// File routing and preflight settings
    pub router: RouterConfig,

    /// Semantic chunking settings
    pub chunking: ChunkingConfig,

    /// Embedding client settings
    pub embedding: EmbeddingConfig,

    /// Vector store settings
    pub vector: VectorConfig,

    /// Agent and cluster analysis settings
    pub analysis: AnalysisConfig,

    /// Watchdog supervision settings
    pub watchdog: WatchdogConfig,

    /// Retry/backoff/circuit-breaker settings
    pub resilience: ResilienceConfig,

    /// Job consumption and extraction limits
    pub runtime: RuntimeConfig,
}

impl Default for ArchrevConfig {
    fn default() -> Self {
        Self {
            router: RouterConfig::default(),
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            vector: VectorConfig::default(),
            analysis: AnalysisConfig::default(),
            watchdog: WatchdogConfig::default(),
            resilience: ResilienceConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

impl ArchrevConfig {
    /// Load configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ArchrevError::io(format!("Cannot read config {}", path.display()), e))?;
        let config: Self = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration as a whole.
    pub fn validate(&self) -> Result<()> {
        self.router.validate()?;
        self.chunking.validate()?;
        self.embedding.validate()?;
        self.analysis.validate()?;
        self.watchdog.validate()?;
        self.resilience.validate()?;
        self.runtime.validate()?;
        Ok(())
    }
}

/// File routing thresholds and preflight gates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Files strictly below this size go into direct LLM context
    pub direct_send_threshold_bytes: u64,

    /// Files up to this size are chunked and embedded
    pub rag_chunk_threshold_bytes: u64,

    /// Whether files above the RAG threshold are still chunked
    pub allow_large_files: bool,

    /// Token estimate above which preflight carries a warning
    pub warn_threshold_tokens: u64,

    /// Token estimate above which the job requires an approval flag
    pub approval_threshold_tokens: u64,

    /// Cost estimate above which the job requires an approval flag
    pub approval_threshold_cost: f64,

    /// Price per 1000 tokens for the cost estimate (0.0 disables cost gating)
    pub price_per_1k_tokens: f64,

    /// Risk score at or above which a file is tagged high-risk
    pub risk_threshold: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            direct_send_threshold_bytes: 10_240,
            rag_chunk_threshold_bytes: 204_800,
            allow_large_files: false,
            warn_threshold_tokens: 500_000,
            approval_threshold_tokens: 2_000_000,
            approval_threshold_cost: 50.0,
            price_per_1k_tokens: 0.0,
            risk_threshold: 0.5,
        }
    }
}

impl RouterConfig {
    fn validate(&self) -> Result<()> {
        if self.direct_send_threshold_bytes >= self.rag_chunk_threshold_bytes {
            return Err(ArchrevError::config_field(
                "direct threshold must be below the RAG threshold",
                "router.direct_send_threshold_bytes",
            ));
        }
        if !(0.0..=1.0).contains(&self.risk_threshold) {
            return Err(ArchrevError::config_field(
                "risk threshold must be within [0, 1]",
                "router.risk_threshold",
            ));
        }
        Ok(())
    }
}

/// Semantic chunking limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Maximum tokens in a single chunk before sliding-window splitting
    pub max_chunk_tokens: usize,

    /// Minimum tokens for a chunk to stand alone (units below it still emit)
    pub min_chunk_tokens: usize,

    /// Approximate token overlap between consecutive window chunks
    pub overlap_tokens: usize,

    /// Per-file parser budget; on timeout the whole file is window-split
    pub parse_timeout_seconds: u64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_tokens: 1600,
            min_chunk_tokens: 50,
            overlap_tokens: 100,
            parse_timeout_seconds: 30,
        }
    }
}

impl ChunkingConfig {
    fn validate(&self) -> Result<()> {
        if self.max_chunk_tokens == 0 {
            return Err(ArchrevError::config_field(
                "maximum chunk tokens must be positive",
                "chunking.max_chunk_tokens",
            ));
        }
        if self.min_chunk_tokens > self.max_chunk_tokens {
            return Err(ArchrevError::config_field(
                "minimum chunk tokens cannot exceed the maximum",
                "chunking.min_chunk_tokens",
            ));
        }
        if self.overlap_tokens >= self.max_chunk_tokens {
            return Err(ArchrevError::config_field(
                "overlap must be smaller than the maximum chunk size",
                "chunking.overlap_tokens",
            ));
        }
        Ok(())
    }
}

/// Embedding provider endpoint and throughput controls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Expected dimensionality of every returned vector
    pub embedding_dimension: usize,

    /// Width of the in-flight request gate
    pub embedding_concurrency: usize,

    /// Sliding per-minute token budget across all in-process callers
    pub embedding_tokens_per_minute: u64,

    /// Texts per provider request in batched mode
    pub embedding_batch_size: usize,

    /// Provider endpoint URL
    pub endpoint: String,

    /// Provider API key (usually injected from the environment)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Provider model identifier
    pub model: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            embedding_dimension: 1536,
            embedding_concurrency: 5,
            embedding_tokens_per_minute: 1_000_000,
            embedding_batch_size: 16,
            endpoint: "http://localhost:8080/v1/embeddings".to_string(),
            api_key: None,
            model: "text-embedding-3-small".to_string(),
        }
    }
}

impl EmbeddingConfig {
    fn validate(&self) -> Result<()> {
        if self.embedding_dimension == 0 {
            return Err(ArchrevError::config_field(
                "embedding dimension must be positive",
                "embedding.embedding_dimension",
            ));
        }
        if self.embedding_concurrency == 0 {
            return Err(ArchrevError::config_field(
                "embedding concurrency must be at least 1",
                "embedding.embedding_concurrency",
            ));
        }
        if self.embedding_batch_size == 0 {
            return Err(ArchrevError::config_field(
                "embedding batch size must be at least 1",
                "embedding.embedding_batch_size",
            ));
        }
        Ok(())
    }
}

/// Vector store tenancy and verification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorConfig {
    /// One collection per project (`<prefix>_<project_id>_vectors`) vs a
    /// shared collection with a `project_id` payload filter
    pub per_project_collections: bool,

    /// Re-count after each indexed batch and fail when the count is flat
    pub fail_on_indexing_failure: bool,

    /// Collection name prefix
    pub collection_prefix: String,

    /// Vector store endpoint URL (Qdrant-compatible REST surface)
    pub endpoint: String,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            per_project_collections: true,
            fail_on_indexing_failure: true,
            collection_prefix: "archrev".to_string(),
            endpoint: "http://localhost:6333".to_string(),
        }
    }
}

/// Agent orchestration and cluster analysis settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Bound on concurrent cluster LLM calls
    pub max_parallel_llm_calls: usize,

    /// Complexity at or above which a file qualifies for deep dive
    pub deep_dive_complexity_threshold: u32,

    /// Line count at or above which a file qualifies for deep dive
    pub deep_dive_line_count_threshold: usize,

    /// Per-file LLM budget during deep dive; timeout degrades to a
    /// manual-review finding
    pub deep_dive_timeout_seconds: u64,

    /// Maximum files per analysis cluster
    pub max_cluster_size: usize,

    /// Cosine similarity at or above which files join an existing cluster
    pub cluster_similarity_threshold: f64,

    /// Chat endpoint URL
    pub chat_endpoint: String,

    /// Chat API key (usually injected from the environment)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_api_key: Option<String>,

    /// Chat model identifier
    pub chat_model: String,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_parallel_llm_calls: 4,
            deep_dive_complexity_threshold: 20,
            deep_dive_line_count_threshold: 500,
            deep_dive_timeout_seconds: 180,
            max_cluster_size: 8,
            cluster_similarity_threshold: 0.75,
            chat_endpoint: "http://localhost:8080/v1/chat/completions".to_string(),
            chat_api_key: None,
            chat_model: "gpt-4o-mini".to_string(),
        }
    }
}

impl AnalysisConfig {
    fn validate(&self) -> Result<()> {
        if self.max_parallel_llm_calls == 0 {
            return Err(ArchrevError::config_field(
                "parallel LLM call width must be at least 1",
                "analysis.max_parallel_llm_calls",
            ));
        }
        if self.max_cluster_size == 0 {
            return Err(ArchrevError::config_field(
                "cluster size must be at least 1",
                "analysis.max_cluster_size",
            ));
        }
        Ok(())
    }
}

/// Watchdog sweep intervals and stuck-job thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Sweeper period
    pub check_interval_seconds: u64,

    /// Heartbeat silence after which a batch is stuck
    pub max_heartbeat_interval_seconds: u64,

    /// Wall-clock bound on one project's analysis
    pub max_project_duration_seconds: u64,

    /// Cancel the tracked batch token when it is declared stuck
    pub auto_cancel_stuck: bool,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval_seconds: 30,
            max_heartbeat_interval_seconds: 120,
            max_project_duration_seconds: 3600,
            auto_cancel_stuck: false,
        }
    }
}

impl WatchdogConfig {
    fn validate(&self) -> Result<()> {
        if self.check_interval_seconds == 0 {
            return Err(ArchrevError::config_field(
                "sweep interval must be positive",
                "watchdog.check_interval_seconds",
            ));
        }
        Ok(())
    }
}

/// Retry, backoff, circuit breaker, and timeout settings for outbound calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Maximum retry attempts for a transient failure
    pub max_retry_attempts: u32,

    /// First backoff delay in milliseconds
    pub backoff_base_ms: u64,

    /// Multiplier applied per attempt
    pub backoff_factor: f64,

    /// Ceiling on a single backoff delay in milliseconds
    pub backoff_cap_ms: u64,

    /// Failure ratio that opens the circuit
    pub breaker_failure_ratio: f64,

    /// Minimum samples in the window before the breaker may open
    pub breaker_min_throughput: usize,

    /// Sampling window width in seconds
    pub breaker_sampling_window_seconds: u64,

    /// How long an open circuit stays open before half-opening
    pub breaker_break_duration_seconds: u64,

    /// Per-call timeout for embedding requests
    pub embed_timeout_seconds: u64,

    /// Per-call timeout for chat completion requests
    pub chat_timeout_seconds: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            backoff_base_ms: 250,
            backoff_factor: 2.0,
            backoff_cap_ms: 15_000,
            breaker_failure_ratio: 0.5,
            breaker_min_throughput: 10,
            breaker_sampling_window_seconds: 30,
            breaker_break_duration_seconds: 30,
            embed_timeout_seconds: 120,
            chat_timeout_seconds: 180,
        }
    }
}

impl ResilienceConfig {
    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.breaker_failure_ratio) {
            return Err(ArchrevError::config_field(
                "failure ratio must be within [0, 1]",
                "resilience.breaker_failure_ratio",
            ));
        }
        if self.backoff_factor < 1.0 {
            return Err(ArchrevError::config_field(
                "backoff factor below 1.0 would shrink delays",
                "resilience.backoff_factor",
            ));
        }
        Ok(())
    }
}

/// Job consumption and archive extraction limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Concurrently processed bus messages
    pub concurrent_message_limit: usize,

    /// Bound on total uncompressed archive size
    pub max_uncompressed_bytes: u64,

    /// How long a cooperative cancel may take before the job is abandoned
    pub cancel_grace_seconds: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            concurrent_message_limit: 4,
            max_uncompressed_bytes: 2 * 1024 * 1024 * 1024,
            cancel_grace_seconds: 30,
        }
    }
}

impl RuntimeConfig {
    fn validate(&self) -> Result<()> {
        if self.concurrent_message_limit == 0 {
            return Err(ArchrevError::config_field(
                "message concurrency must be at least 1",
                "runtime.concurrent_message_limit",
            ));
        }
        if self.max_uncompressed_bytes == 0 {
            return Err(ArchrevError::config_field(
                "extraction size bound must be positive",
                "runtime.max_uncompressed_bytes",
            ));
        }
        Ok(())
    }
}
