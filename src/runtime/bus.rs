//! Analysis commands, lifecycle events, and the message bus seam.
//!
//! One trait covers both directions: commands in, events out. The in-memory
//! implementation is the queue and the bus at once — a deployment that
//! needs a broker binds the same trait to an adapter and nothing else in
//! the crate changes. Redelivery is explicit: the job runner hands a failed
//! delivery back, and the attempt counter enforces at-most-N processing.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::errors::{ArchrevError, Result};

/// Command that starts one project analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartAnalysisCommand {
    /// Project to analyze
    pub project_id: Uuid,
    /// Correlation id threaded through every event
    pub correlation_id: Uuid,
    /// Scheduling priority; higher runs earlier where the bus supports it
    pub priority: i32,
    /// When the command was issued
    pub created_at: DateTime<Utc>,
    /// Free-form metadata; `approved = "true"` carries the preflight
    /// approval flag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
}

impl StartAnalysisCommand {
    /// Create a command for a project with a fresh correlation id.
    pub fn new(project_id: Uuid) -> Self {
        Self {
            project_id,
            correlation_id: Uuid::new_v4(),
            priority: 0,
            created_at: Utc::now(),
            metadata: None,
        }
    }

    /// Attach the preflight approval flag.
    pub fn approved(mut self) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert("approved".to_string(), "true".to_string());
        self
    }

    /// Whether the command carries the preflight approval flag.
    pub fn is_approved(&self) -> bool {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("approved"))
            .map(|v| v == "true")
            .unwrap_or(false)
    }
}

/// One delivery of a command, with its attempt counter.
#[derive(Debug, Clone)]
pub struct CommandDelivery {
    /// The command
    pub command: StartAnalysisCommand,
    /// 1-based delivery attempt
    pub attempt: u32,
}

/// Events published over the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AnalysisEvent {
    /// A worker picked the job up
    Started {
        /// Project under analysis
        project_id: Uuid,
        /// Correlation id from the command
        correlation_id: Uuid,
        /// When processing began
        started_at: DateTime<Utc>,
    },
    /// The job finished, in success or failure
    Completed {
        /// Project analyzed
        project_id: Uuid,
        /// Persisted report, when the job succeeded
        report_id: Option<Uuid>,
        /// Whether the job succeeded
        success: bool,
        /// Failure code, when it did not
        error_message: Option<String>,
        /// Wall-clock duration in milliseconds
        duration_ms: u64,
        /// Correlation id from the command
        correlation_id: Uuid,
        /// When processing finished
        completed_at: DateTime<Utc>,
    },
    /// The job failed terminally
    Failed {
        /// Project that failed
        project_id: Uuid,
        /// Stable failure code
        error_message: String,
        /// Error kind, when known
        exception_type: Option<String>,
        /// Deliveries consumed before giving up
        retry_count: u32,
        /// When the failure landed
        failed_at: DateTime<Utc>,
        /// Correlation id from the command
        correlation_id: Uuid,
    },
}

/// Durable command/event transport.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Enqueue a fresh command (attempt 1).
    async fn send(&self, command: StartAnalysisCommand) -> Result<()>;

    /// Next delivery, or `None` when the bus is shut down.
    async fn receive(&self) -> Option<CommandDelivery>;

    /// Hand a failed delivery back for another attempt.
    async fn redeliver(&self, delivery: CommandDelivery) -> Result<()>;

    /// Publish a lifecycle event.
    async fn publish(&self, event: AnalysisEvent) -> Result<()>;
}

/// Process-local bus over an unbounded channel.
pub struct InMemoryBus {
    sender: mpsc::UnboundedSender<CommandDelivery>,
    receiver: Mutex<mpsc::UnboundedReceiver<CommandDelivery>>,
    events: Mutex<Vec<AnalysisEvent>>,
    max_deliveries: u32,
}

impl InMemoryBus {
    /// Create a bus enforcing at-most-`max_deliveries` per command.
    pub fn new(max_deliveries: u32) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(receiver),
            events: Mutex::new(Vec::new()),
            max_deliveries: max_deliveries.max(1),
        }
    }

    /// Snapshot of every event published so far.
    pub fn events(&self) -> Vec<AnalysisEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn send(&self, command: StartAnalysisCommand) -> Result<()> {
        self.sender
            .send(CommandDelivery {
                command,
                attempt: 1,
            })
            .map_err(|_| ArchrevError::internal("bus channel closed"))
    }

    async fn receive(&self) -> Option<CommandDelivery> {
        // One consumer loop at a time; the runner fans out after receipt.
        let mut receiver = self.receiver.lock();
        receiver.try_recv().ok()
    }

    async fn redeliver(&self, delivery: CommandDelivery) -> Result<()> {
        if delivery.attempt >= self.max_deliveries {
            return Err(ArchrevError::TransientExhausted {
                message: format!(
                    "command for project {} exhausted {} deliveries",
                    delivery.command.project_id, self.max_deliveries
                ),
            });
        }
        self.sender
            .send(CommandDelivery {
                command: delivery.command,
                attempt: delivery.attempt + 1,
            })
            .map_err(|_| ArchrevError::internal("bus channel closed"))
    }

    async fn publish(&self, event: AnalysisEvent) -> Result<()> {
        self.events.lock().push(event);
        Ok(())
    }
}
