//! Durable job lifecycle: consume, analyze, persist, clean up.
//!
//! One consumed command drives the whole pipeline: status transitions,
//! archive resolution, routing and preflight, chunk/embed/index with
//! checkpoints and watchdog heartbeats, agent orchestration, aggregation,
//! and the terminal events. Transient failures reset the project and hand
//! the delivery back to the bus; everything else lands in `Failed` with a
//! stable code. The scratch directory is dropped on every exit path.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::agents::orchestrator::{AgentContext, AgentOrchestrator};
use crate::agents::retrieval::Retriever;
use crate::analysis::metrics::{FileSummary, StaticAnalyzer};
use crate::chunking::chunk::Chunk;
use crate::chunking::semantic::SemanticChunker;
use crate::core::config::ArchrevConfig;
use crate::core::entities::{FileRecord, Project, ProjectStatus, Report};
use crate::core::errors::{ArchrevError, Result};
use crate::embedding::client::EmbeddingClient;
use crate::ingest::archive::{extract_archive, read_text_lossy, ScratchDir};
use crate::ingest::router::{FileRouter, RouteDecision};
use crate::report::aggregator::ReportAggregator;
use crate::runtime::bus::{AnalysisEvent, CommandDelivery, MessageBus, StartAnalysisCommand};
use crate::runtime::progress::{AnalysisPhase, ProgressHub, ProgressUpdate};
use crate::runtime::watchdog::Watchdog;
use crate::storage::blob::BlobStorage;
use crate::storage::records::{CheckpointStore, ChunkStore, ProjectStore, ReportStore};
use crate::vector::store::{index_batch_verified, ChunkPayload, IndexEntry, VectorIndex};

/// Checkpoint phase name for the indexing loop.
const INDEXING_PHASE: &str = "indexing";

/// Drives analysis jobs from the message bus to a persisted report.
pub struct JobRunner {
    config: ArchrevConfig,
    projects: Arc<dyn ProjectStore>,
    chunk_store: Arc<dyn ChunkStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    report_store: Arc<dyn ReportStore>,
    blobs: Arc<dyn BlobStorage>,
    vectors: Arc<dyn VectorIndex>,
    embedder: Arc<EmbeddingClient>,
    chunker: SemanticChunker,
    router: FileRouter,
    analyzer: StaticAnalyzer,
    orchestrator: AgentOrchestrator,
    aggregator: ReportAggregator,
    watchdog: Arc<Watchdog>,
    progress: Arc<ProgressHub>,
    bus: Arc<dyn MessageBus>,
}

impl JobRunner {
    /// Wire a runner from its collaborators; the composition root owns all
    /// construction, there is no runtime injection.
    pub fn new(
        config: ArchrevConfig,
        projects: Arc<dyn ProjectStore>,
        chunk_store: Arc<dyn ChunkStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        report_store: Arc<dyn ReportStore>,
        blobs: Arc<dyn BlobStorage>,
        vectors: Arc<dyn VectorIndex>,
        embedder: Arc<EmbeddingClient>,
        orchestrator: AgentOrchestrator,
        aggregator: ReportAggregator,
        watchdog: Arc<Watchdog>,
        progress: Arc<ProgressHub>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        Self {
            chunker: SemanticChunker::new(config.chunking.clone()),
            router: FileRouter::new(config.router.clone()),
            analyzer: StaticAnalyzer::new(),
            config,
            projects,
            chunk_store,
            checkpoints,
            report_store,
            blobs,
            vectors,
            embedder,
            orchestrator,
            aggregator,
            watchdog,
            progress,
            bus,
        }
    }

    /// Consume commands until `shutdown` fires, processing up to
    /// `concurrent_message_limit` jobs at once.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let gate = Arc::new(Semaphore::new(self.config.runtime.concurrent_message_limit));
        info!("job runner consuming");

        loop {
            if shutdown.is_cancelled() {
                return;
            }
            match self.bus.receive().await {
                Some(delivery) => {
                    let Ok(permit) = gate.clone().acquire_owned().await else {
                        return;
                    };
                    let runner = Arc::clone(&self);
                    tokio::spawn(async move {
                        runner.process_delivery(delivery).await;
                        drop(permit);
                    });
                }
                None => {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
                    }
                }
            }
        }
    }

    /// Process one delivery end to end, including the failure paths.
    pub async fn process_delivery(&self, delivery: CommandDelivery) {
        let command = delivery.command.clone();
        let attempt = delivery.attempt;
        let started = Instant::now();

        match self.process_command(&command).await {
            Ok(report) => {
                let _ = self
                    .bus
                    .publish(AnalysisEvent::Completed {
                        project_id: command.project_id,
                        report_id: Some(report.id),
                        success: true,
                        error_message: None,
                        duration_ms: started.elapsed().as_millis() as u64,
                        correlation_id: command.correlation_id,
                        completed_at: chrono::Utc::now(),
                    })
                    .await;
            }
            Err(err) if err.is_transient() => {
                warn!(
                    project = %command.project_id,
                    attempt,
                    "transient failure, returning delivery to the bus: {err}"
                );
                // Make the project consumable again before redelivery; the
                // checkpoints let the retry skip completed batches.
                self.rewind_for_retry(command.project_id).await;
                if let Err(exhausted) = self.bus.redeliver(delivery).await {
                    error!(
                        project = %command.project_id,
                        "deliveries exhausted: {exhausted}"
                    );
                    self.fail_project(&command, attempt, &exhausted).await;
                }
            }
            Err(err) => {
                let code = err.error_code().to_string();
                // A rejected command (missing or already-running project)
                // must not mutate the project record.
                if code != "Project.NotFound" && code != "Project.AlreadyAnalyzing" {
                    self.fail_project(&command, attempt, &err).await;
                } else {
                    let _ = self
                        .bus
                        .publish(AnalysisEvent::Failed {
                            project_id: command.project_id,
                            error_message: code,
                            exception_type: None,
                            retry_count: attempt,
                            failed_at: chrono::Utc::now(),
                            correlation_id: command.correlation_id,
                        })
                        .await;
                }
            }
        }
    }

    /// The analysis pipeline for one command.
    async fn process_command(&self, command: &StartAnalysisCommand) -> Result<Report> {
        let started = Instant::now();

        // 1: load and validate the project.
        let mut project = self
            .projects
            .get(command.project_id)
            .await?
            .ok_or_else(|| {
                ArchrevError::not_found(
                    "Project.NotFound",
                    format!("project {} does not exist", command.project_id),
                )
            })?;
        if project.status != ProjectStatus::FilesReady {
            return Err(ArchrevError::validation(
                "Project.AlreadyAnalyzing",
                format!(
                    "project {} is {}, expected FilesReady",
                    project.id,
                    project.status.as_str()
                ),
            ));
        }

        // 2: forward transitions with persisted timestamps.
        project.transition(ProjectStatus::Queued)?;
        self.projects.upsert(project.clone()).await?;
        self.publish_progress(project.id, AnalysisPhase::Queued, 0.0, None, 0, 0);

        project.transition(ProjectStatus::Analyzing)?;
        self.projects.upsert(project.clone()).await?;
        self.bus
            .publish(AnalysisEvent::Started {
                project_id: project.id,
                correlation_id: command.correlation_id,
                started_at: chrono::Utc::now(),
            })
            .await?;

        let cancel = CancellationToken::new();

        // 3: resolve the archive into a scratch tree. The guard cleans up on
        // every exit path below.
        self.publish_progress(project.id, AnalysisPhase::Extracting, 5.0, None, 0, 0);
        let extract_token = cancel.child_token();
        let extract_handle = self
            .watchdog
            .track(project.id, 0, 0, extract_token.clone());
        self.watchdog
            .update_phase(project.id, AnalysisPhase::Extracting.as_str());

        let archive_bytes = self.blobs.download(&project.storage_key).await?;
        let scratch = ScratchDir::new()?;
        extract_archive(
            archive_bytes,
            scratch.path().to_path_buf(),
            self.config.runtime.max_uncompressed_bytes,
        )
        .await?;

        if extract_token.is_cancelled() {
            return Err(if self.watchdog.is_stuck(project.id) {
                ArchrevError::stuck("extraction stalled without heartbeats")
            } else {
                ArchrevError::cancelled("extraction")
            });
        }
        drop(extract_handle);

        // 4: route and gate on the preflight estimate.
        self.publish_progress(project.id, AnalysisPhase::Routing, 10.0, None, 0, 0);
        let plans = self.router.plan_tree(scratch.path())?;
        let preflight = self.router.preflight(&plans);
        for warning in &preflight.warnings {
            warn!(project = %project.id, "{warning}");
        }
        if preflight.requires_approval && !command.is_approved() {
            return Err(ArchrevError::approval_required(format!(
                "estimated {} tokens (cost {:.2}) exceeds the approval threshold",
                preflight.estimated_tokens, preflight.estimated_cost
            )));
        }
        if preflight.direct_count + preflight.rag_count == 0 {
            return Err(ArchrevError::validation(
                "Project.NoFilesToAnalyze",
                "routing left no analyzable files",
            ));
        }

        // 5: static metrics and file records for every analyzed file.
        let (summaries, records) = self.summarize_files(&project, scratch.path(), &plans)?;
        project.file_count = records.len();
        project.total_loc = summaries.iter().map(|s| s.loc).sum();
        self.projects.put_files(project.id, records).await?;
        self.projects.upsert(project.clone()).await?;

        // 6: chunk, embed, index.
        self.index_project(&project, scratch.path(), &plans, &cancel)
            .await?;

        // 7: agents, with retrieval over whatever the indexing phase built.
        self.publish_progress(project.id, AnalysisPhase::Analyzing, 70.0, None, 0, 0);
        let retriever = Retriever::new(
            project.id,
            Arc::clone(&self.embedder),
            Arc::clone(&self.vectors),
        );
        let indexed = self.vectors.count(Some(project.id)).await.unwrap_or(0);
        let ctx = AgentContext {
            project_id: project.id,
            working_dir: scratch.path(),
            plans: &plans,
            summaries: &summaries,
            retriever: if indexed > 0 { Some(&retriever) } else { None },
            cancel: &cancel,
        };
        let responses = self.orchestrator.run(&ctx).await;

        // 8: aggregate and persist the report.
        self.publish_progress(project.id, AnalysisPhase::Aggregating, 90.0, None, 0, 0);
        let report = self
            .aggregator
            .aggregate(project.id, &responses, started.elapsed().as_millis() as u64)
            .await
            .map_err(|err| {
                if err.is_transient() {
                    err
                } else {
                    ArchrevError::validation(
                        "Report.GenerationFailed",
                        format!("report aggregation failed: {err}"),
                    )
                }
            })?;

        // 9: terminal success.
        project.transition(ProjectStatus::Completed)?;
        self.projects.upsert(project.clone()).await?;
        self.checkpoints.delete_by_project(project.id).await?;
        self.publish_progress(project.id, AnalysisPhase::Completed, 100.0, None, 0, 0);
        info!(project = %project.id, score = report.health_score, "analysis completed");

        Ok(report)
    }

    /// Read, hash, and summarize every analyzed file.
    fn summarize_files(
        &self,
        project: &Project,
        root: &std::path::Path,
        plans: &[crate::ingest::router::FileAnalysisPlan],
    ) -> Result<(Vec<FileSummary>, Vec<FileRecord>)> {
        let mut summaries = Vec::new();
        let mut records = Vec::new();

        for plan in plans {
            if !plan.decision.is_analyzed() {
                continue;
            }
            let content = match read_text_lossy(&root.join(&plan.relative_path)) {
                Ok(content) => content,
                Err(err) => {
                    warn!("cannot read {}: {err}", plan.relative_path);
                    continue;
                }
            };

            let mut summary = self.analyzer.summarize(&plan.relative_path, &content);
            summary.is_high_risk = plan.is_high_risk;

            records.push(FileRecord {
                id: Uuid::new_v4(),
                project_id: project.id,
                relative_path: plan.relative_path.clone(),
                extension: plan.extension.clone(),
                size_bytes: plan.size_bytes,
                content_hash: crate::chunking::chunk::hex_digest(content.as_bytes()),
                loc: summary.loc,
                complexity: summary.complexity,
            });
            summaries.push(summary);
        }

        Ok((summaries, records))
    }

    /// Chunk the RAG-routed files and push them through embed + index with
    /// per-batch checkpoints, heartbeats, and progress.
    async fn index_project(
        &self,
        project: &Project,
        root: &std::path::Path,
        plans: &[crate::ingest::router::FileAnalysisPlan],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut chunks: Vec<Chunk> = Vec::new();
        let rag_files: Vec<_> = plans
            .iter()
            .filter(|p| p.decision == RouteDecision::RagChunks)
            .collect();

        for (index, plan) in rag_files.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(ArchrevError::cancelled("chunking"));
            }
            let content = match read_text_lossy(&root.join(&plan.relative_path)) {
                Ok(content) => content,
                Err(err) => {
                    warn!("cannot read {}: {err}", plan.relative_path);
                    continue;
                }
            };
            chunks.extend(
                self.chunker
                    .chunk_file(project.id, &plan.relative_path, &content)
                    .await?,
            );
            self.publish_progress(
                project.id,
                AnalysisPhase::Indexing,
                15.0 + 10.0 * (index + 1) as f32 / rag_files.len().max(1) as f32,
                Some(plan.relative_path.clone()),
                index + 1,
                rag_files.len(),
            );
        }

        if chunks.is_empty() {
            return Ok(());
        }
        self.chunk_store.put_chunks(project.id, &chunks).await?;

        // Redelivered commands resume where the last run checkpointed.
        let resume_offset = self
            .checkpoints
            .get(project.id, INDEXING_PHASE)
            .await?
            .map(|cp| cp.last_offset.min(chunks.len()))
            .unwrap_or(0);
        if resume_offset > 0 {
            info!(
                project = %project.id,
                resume_offset, "resuming indexing from checkpoint"
            );
        }

        let total = chunks.len();
        let batch_size = self.config.embedding.embedding_batch_size;
        let batch_token = cancel.child_token();
        let mut handle = self
            .watchdog
            .track(project.id, resume_offset, total, batch_token.clone());
        self.watchdog.update_phase(project.id, INDEXING_PHASE);

        let mut offset = resume_offset;
        while offset < total {
            if batch_token.is_cancelled() {
                return Err(if self.watchdog.is_stuck(project.id) {
                    ArchrevError::stuck(format!("indexing stalled at offset {offset}"))
                } else {
                    ArchrevError::cancelled("indexing")
                });
            }

            let end = (offset + batch_size).min(total);
            let batch = &chunks[offset..end];
            let texts: Vec<String> = batch
                .iter()
                .map(|c| c.text.clone().unwrap_or_default())
                .collect();

            let vectors = self.embedder.embed_batch(&texts, &batch_token).await?;
            let entries: Vec<IndexEntry> = batch
                .iter()
                .zip(vectors)
                .map(|(chunk, vector)| IndexEntry {
                    chunk_hash: chunk.chunk_hash.clone(),
                    vector,
                    payload: ChunkPayload::from_chunk(chunk),
                })
                .collect();
            index_batch_verified(
                self.vectors.as_ref(),
                project.id,
                entries,
                self.config.vector.fail_on_indexing_failure,
            )
            .await?;

            offset = end;
            self.checkpoints
                .put(crate::core::entities::JobCheckpoint {
                    project_id: project.id,
                    phase: INDEXING_PHASE.to_string(),
                    last_offset: offset,
                    updated_at: chrono::Utc::now(),
                })
                .await?;

            // New batch registered before the old handle drops, so the
            // overall duration clock survives the handover.
            self.watchdog.heartbeat(project.id);
            handle = self
                .watchdog
                .track(project.id, offset, total, batch_token.clone());
            self.watchdog.update_phase(project.id, INDEXING_PHASE);

            self.publish_progress(
                project.id,
                AnalysisPhase::Indexing,
                25.0 + 45.0 * offset as f32 / total as f32,
                None,
                offset,
                total,
            );
        }
        drop(handle);

        Ok(())
    }

    /// Load a completed project's report with its findings.
    pub async fn get_report(
        &self,
        project_id: Uuid,
    ) -> Result<(Report, Vec<crate::core::entities::ReviewFinding>)> {
        let project = self.projects.get(project_id).await?.ok_or_else(|| {
            ArchrevError::not_found(
                "Project.NotFound",
                format!("project {project_id} does not exist"),
            )
        })?;
        if project.status != ProjectStatus::Completed {
            return Err(ArchrevError::validation(
                "Report.NotReady",
                format!("project {project_id} is {}", project.status.as_str()),
            ));
        }
        self.report_store
            .get_by_project(project_id)
            .await?
            .ok_or_else(|| {
                ArchrevError::not_found(
                    "Report.NotFound",
                    format!("no report persisted for project {project_id}"),
                )
            })
    }

    /// Administrative reset: drop derived state and return to `FilesReady`.
    pub async fn reset(&self, project_id: Uuid) -> Result<()> {
        let mut project = self.projects.get(project_id).await?.ok_or_else(|| {
            ArchrevError::not_found(
                "Project.NotFound",
                format!("project {project_id} does not exist"),
            )
        })?;

        self.vectors.delete_by_project(project_id).await?;
        self.chunk_store.delete_by_project(project_id).await?;
        self.checkpoints.delete_by_project(project_id).await?;
        project.reset()?;
        self.projects.upsert(project).await?;
        info!(project = %project_id, "project reset to FilesReady");
        Ok(())
    }

    /// Ordered delete: findings and report, vectors, chunks, checkpoints,
    /// blobs, then the project record (cascading to file records). The
    /// project record goes last so a failed delete stays retryable.
    pub async fn delete(&self, project_id: Uuid) -> Result<()> {
        let project = self.projects.get(project_id).await?.ok_or_else(|| {
            ArchrevError::not_found(
                "Project.NotFound",
                format!("project {project_id} does not exist"),
            )
        })?;

        self.report_store.delete_by_project(project_id).await?;
        self.vectors.delete_by_project(project_id).await?;
        self.chunk_store.delete_by_project(project_id).await?;
        self.checkpoints.delete_by_project(project_id).await?;
        self.blobs
            .delete_by_prefix(&blob_prefix(&project.storage_key))
            .await?;
        self.projects.delete(project_id).await?;
        self.progress.remove(project_id);
        info!(project = %project_id, "project deleted");
        Ok(())
    }

    /// Return a mid-flight project to `FilesReady` so a redelivery can
    /// consume it.
    async fn rewind_for_retry(&self, project_id: Uuid) {
        let Ok(Some(mut project)) = self.projects.get(project_id).await else {
            return;
        };
        if project.status.can_reset() {
            if project.reset().is_ok() {
                let _ = self.projects.upsert(project).await;
            }
        }
    }

    /// Terminal failure: mark the project and publish the event.
    async fn fail_project(
        &self,
        command: &StartAnalysisCommand,
        attempt: u32,
        err: &ArchrevError,
    ) {
        let code = err.error_code().to_string();
        if let Ok(Some(mut project)) = self.projects.get(command.project_id).await {
            project.fail(code.clone());
            let _ = self.projects.upsert(project).await;
        }
        self.publish_progress(
            command.project_id,
            AnalysisPhase::Failed,
            100.0,
            None,
            0,
            0,
        );
        let _ = self
            .bus
            .publish(AnalysisEvent::Failed {
                project_id: command.project_id,
                error_message: code,
                exception_type: Some(format!("{err}")),
                retry_count: attempt,
                failed_at: chrono::Utc::now(),
                correlation_id: command.correlation_id,
            })
            .await;
    }

    fn publish_progress(
        &self,
        project_id: Uuid,
        phase: AnalysisPhase,
        percent: f32,
        current_file: Option<String>,
        files_processed: usize,
        total_files: usize,
    ) {
        self.progress.publish(ProgressUpdate {
            project_id,
            phase,
            percent,
            current_file,
            files_processed,
            total_files,
            message: None,
        });
    }
}

fn blob_prefix(storage_key: &str) -> String {
    match storage_key.rsplit_once('/') {
        Some((prefix, _)) => format!("{prefix}/"),
        None => storage_key.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_prefix_extraction() {
        assert_eq!(blob_prefix("projects/p1/archive.zip"), "projects/p1/");
        assert_eq!(blob_prefix("flat.zip"), "flat.zip");
    }
}
