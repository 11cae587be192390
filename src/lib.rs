//! # Archrev-RS: Asynchronous Architecture Review Engine
//!
//! Ingests a source-code repository archive and produces a consolidated
//! architecture-review report: a 0–100 health score, categorized findings
//! with severity, and recommendations. The heavy lifting happens on
//! background workers driven by a durable message bus:
//!
//! - **File Routing**: per-file decisions between direct LLM context,
//!   retrieval-augmented chunking, and skipping
//! - **Semantic Chunking**: tree-sitter semantic units with stable identity
//!   and token-bounded sliding windows
//! - **Embedding & Retrieval**: rate-limited batched embedding into a
//!   project-scoped vector index
//! - **Agent Analysis**: security, code-quality, structure, and architecture
//!   agents combining local heuristics with LLM calls
//! - **Report Aggregation**: deterministic dedup/merge of noisy LLM findings
//!   into one stable report
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                       Runtime Layer                           │
//! │        Job Runner │ Watchdog │ Progress │ Message Bus         │
//! ├───────────────────────────────────────────────────────────────┤
//! │  Ingest   │ Chunking │ Embedding │ Vector │ Agents │ Report   │
//! │ • Archive │ • Units  │ • Gate    │ • Index│ • LLM  │ • Merge  │
//! │ • Router  │ • Window │ • Limiter │ • Query│ • Rules│ • Score  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use archrev_rs::core::config::ArchrevConfig;
//!
//! let config = ArchrevConfig::default();
//! config.validate().expect("default configuration is valid");
//! ```

#![warn(missing_docs)]
#![warn(unsafe_code)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::too_many_arguments)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

// Core data model, configuration, and error taxonomy
pub mod core {
    //! Core data structures, configuration, and errors.

    pub mod config;
    pub mod entities;
    pub mod errors;
    pub mod tokens;
}

// Archive extraction and per-file routing
pub mod ingest {
    //! Archive extraction and file routing.

    pub mod archive;
    pub mod router;
}

// Semantic chunking
pub mod chunking {
    //! Semantic unit extraction and token-bounded chunk emission.

    pub mod chunk;
    pub mod semantic;
    pub mod window;

    pub use chunk::{Chunk, SemanticType};
    pub use semantic::SemanticChunker;
}

// Embedding generation
pub mod embedding {
    //! Rate-limited, batched embedding generation.

    pub mod client;
    pub mod limiter;

    pub use client::{EmbeddingClient, EmbeddingProvider, HttpEmbeddingProvider};
}

// Vector indexing and retrieval
pub mod vector {
    //! Project-scoped vector indexing and similarity retrieval.

    pub mod memory;
    pub mod qdrant;
    pub mod store;

    pub use memory::InMemoryVectorIndex;
    pub use store::{ChunkPayload, SearchHit, VectorIndex};
}

// Local analysis: static metrics and cluster building
pub mod analysis {
    //! Local static metrics and analysis-cluster construction.

    pub mod clusters;
    pub mod metrics;

    pub use clusters::ClusterBuilder;
    pub use metrics::{FileSummary, StaticAnalyzer};
}

// Analysis agents and orchestration
pub mod agents {
    //! LLM-backed and heuristic analysis agents.

    pub mod advisor;
    pub mod code_quality;
    pub mod llm;
    pub mod orchestrator;
    pub mod parse;
    pub mod retrieval;
    pub mod security;
    pub mod structure;

    pub use llm::{ChatClient, HttpChatClient};
    pub use orchestrator::{AgentOrchestrator, AgentResponse, AnalysisAgent};
    pub use retrieval::Retriever;
}

// Report aggregation
pub mod report {
    //! Finding dedup/merge and report synthesis.

    pub mod aggregator;
    pub mod score;

    pub use aggregator::ReportAggregator;
    pub use score::health_score;
}

// Job runtime: bus, runner, watchdog, progress
pub mod runtime {
    //! Durable job lifecycle, supervision, and progress fan-out.

    pub mod bus;
    pub mod job;
    pub mod progress;
    pub mod watchdog;

    pub use bus::{InMemoryBus, MessageBus, StartAnalysisCommand};
    pub use job::JobRunner;
    pub use progress::{ProgressHub, ProgressUpdate};
    pub use watchdog::Watchdog;
}

// Retry, circuit breaking, and timeouts for outbound calls
pub mod resilience;

// Collaborator contracts: relational records and blob storage
pub mod storage {
    //! Narrow contracts for the relational and blob storage collaborators.

    pub mod blob;
    pub mod records;

    pub use blob::{BlobStorage, FsBlobStorage};
    pub use records::{
        CheckpointStore, ChunkStore, InMemoryStores, ProjectStore, ReportStore,
    };
}

// Re-export primary types for convenience
pub use crate::core::config::ArchrevConfig;
pub use crate::core::entities::{
    Category, Project, ProjectStatus, Report, ReviewFinding, Severity,
};
pub use crate::core::errors::{ArchrevError, Result, ResultExt};

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
