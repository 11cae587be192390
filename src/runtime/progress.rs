//! Progress fan-out to subscribers.
//!
//! One broadcast topic per project. Publishing never blocks: a slow
//! subscriber lags and, once its buffer wraps, resumes at the most recent
//! updates instead of holding the publisher back. Updates for one project
//! are delivered in publication order.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Buffered updates per subscriber before the oldest are dropped.
const TOPIC_CAPACITY: usize = 256;

/// Pipeline phase names used in progress updates and checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnalysisPhase {
    /// Waiting for a worker
    Queued,
    /// Downloading and extracting the archive
    Extracting,
    /// Routing files
    Routing,
    /// Chunking and embedding
    Indexing,
    /// Agents running
    Analyzing,
    /// Aggregating findings into the report
    Aggregating,
    /// Terminal success
    Completed,
    /// Terminal failure
    Failed,
}

impl AnalysisPhase {
    /// Stable phase name for checkpoints and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            AnalysisPhase::Queued => "queued",
            AnalysisPhase::Extracting => "extracting",
            AnalysisPhase::Routing => "routing",
            AnalysisPhase::Indexing => "indexing",
            AnalysisPhase::Analyzing => "analyzing",
            AnalysisPhase::Aggregating => "aggregating",
            AnalysisPhase::Completed => "completed",
            AnalysisPhase::Failed => "failed",
        }
    }
}

/// One progress update on a project topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Project the update belongs to
    pub project_id: Uuid,
    /// Current phase
    pub phase: AnalysisPhase,
    /// Overall percentage in [0, 100]
    pub percent: f32,
    /// File being processed, when one is
    pub current_file: Option<String>,
    /// Files processed so far
    pub files_processed: usize,
    /// Total files in scope
    pub total_files: usize,
    /// Free-form detail
    pub message: Option<String>,
}

/// Per-project progress topics.
#[derive(Default)]
pub struct ProgressHub {
    topics: DashMap<Uuid, broadcast::Sender<ProgressUpdate>>,
}

impl ProgressHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an update; never blocks, never fails.
    pub fn publish(&self, update: ProgressUpdate) {
        let topic = self
            .topics
            .entry(update.project_id)
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0);
        // No subscribers is not an error; the update simply evaporates.
        let _ = topic.send(update);
    }

    /// Subscribe to a project's updates from this point on.
    pub fn subscribe(&self, project_id: Uuid) -> broadcast::Receiver<ProgressUpdate> {
        self.topics
            .entry(project_id)
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }

    /// Drop a project's topic once its job is done.
    pub fn remove(&self, project_id: Uuid) {
        self.topics.remove(&project_id);
    }
}
