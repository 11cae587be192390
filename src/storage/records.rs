//! Relational-store contracts and in-memory implementations.
//!
//! The real deployment binds these traits to a relational database; the
//! engine only ever sees the narrow interfaces. The in-memory variant backs
//! tests and single-process runs, with the same semantics: one report per
//! project, cascade deletes from the project record, and atomic
//! report-plus-findings persistence.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::chunking::chunk::Chunk;
use crate::core::entities::{FileRecord, JobCheckpoint, Project, Report, ReviewFinding};
use crate::core::errors::{ArchrevError, Result};

/// Project and file-record persistence.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Load a project by id.
    async fn get(&self, id: Uuid) -> Result<Option<Project>>;

    /// Insert or replace a project record.
    async fn upsert(&self, project: Project) -> Result<()>;

    /// Replace the project's file records.
    async fn put_files(&self, project_id: Uuid, files: Vec<FileRecord>) -> Result<()>;

    /// File records for a project.
    async fn files(&self, project_id: Uuid) -> Result<Vec<FileRecord>>;

    /// Delete the project record, cascading to file records.
    async fn delete(&self, id: Uuid) -> Result<()>;
}

/// Chunk metadata persistence.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Store chunks for a project (text dropped, metadata kept).
    async fn put_chunks(&self, project_id: Uuid, chunks: &[Chunk]) -> Result<()>;

    /// Chunk count for a project.
    async fn count(&self, project_id: Uuid) -> Result<usize>;

    /// Remove all chunks for a project.
    async fn delete_by_project(&self, project_id: Uuid) -> Result<()>;
}

/// Report persistence; findings live and die with their report.
#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Persist a report and its findings in one step, replacing any
    /// previous report for the project.
    async fn persist(&self, report: Report, findings: Vec<ReviewFinding>) -> Result<()>;

    /// Load the report and findings for a project.
    async fn get_by_project(&self, project_id: Uuid)
        -> Result<Option<(Report, Vec<ReviewFinding>)>>;

    /// Remove the report and findings for a project.
    async fn delete_by_project(&self, project_id: Uuid) -> Result<()>;
}

/// Job checkpoint persistence.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Insert or update a checkpoint.
    async fn put(&self, checkpoint: JobCheckpoint) -> Result<()>;

    /// Load a checkpoint for a project phase.
    async fn get(&self, project_id: Uuid, phase: &str) -> Result<Option<JobCheckpoint>>;

    /// Remove all checkpoints for a project.
    async fn delete_by_project(&self, project_id: Uuid) -> Result<()>;
}

#[derive(Default)]
struct Inner {
    projects: HashMap<Uuid, Project>,
    files: HashMap<Uuid, Vec<FileRecord>>,
    chunks: HashMap<Uuid, Vec<Chunk>>,
    reports: HashMap<Uuid, (Report, Vec<ReviewFinding>)>,
    checkpoints: HashMap<(Uuid, String), JobCheckpoint>,
}

/// One in-memory backing store implementing every record contract.
#[derive(Default)]
pub struct InMemoryStores {
    inner: RwLock<Inner>,
}

impl InMemoryStores {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored chunk metadata for a project, for inspection in tests and
    /// administrative tooling.
    pub fn chunks_for(&self, project_id: Uuid) -> Vec<Chunk> {
        self.inner
            .read()
            .chunks
            .get(&project_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ProjectStore for InMemoryStores {
    async fn get(&self, id: Uuid) -> Result<Option<Project>> {
        Ok(self.inner.read().projects.get(&id).cloned())
    }

    async fn upsert(&self, project: Project) -> Result<()> {
        self.inner.write().projects.insert(project.id, project);
        Ok(())
    }

    async fn put_files(&self, project_id: Uuid, files: Vec<FileRecord>) -> Result<()> {
        self.inner.write().files.insert(project_id, files);
        Ok(())
    }

    async fn files(&self, project_id: Uuid) -> Result<Vec<FileRecord>> {
        Ok(self
            .inner
            .read()
            .files
            .get(&project_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.projects.remove(&id).is_none() {
            return Err(ArchrevError::not_found(
                "Project.NotFound",
                format!("project {id} does not exist"),
            ));
        }
        // Cascade: the project owns its files and report.
        inner.files.remove(&id);
        inner.reports.remove(&id);
        Ok(())
    }
}

#[async_trait]
impl ChunkStore for InMemoryStores {
    async fn put_chunks(&self, project_id: Uuid, chunks: &[Chunk]) -> Result<()> {
        let mut stripped: Vec<Chunk> = chunks.to_vec();
        for chunk in &mut stripped {
            chunk.text = None;
        }
        // A redelivered job re-chunks deterministically; storing replaces.
        self.inner.write().chunks.insert(project_id, stripped);
        Ok(())
    }

    async fn count(&self, project_id: Uuid) -> Result<usize> {
        Ok(self
            .inner
            .read()
            .chunks
            .get(&project_id)
            .map(|c| c.len())
            .unwrap_or(0))
    }

    async fn delete_by_project(&self, project_id: Uuid) -> Result<()> {
        self.inner.write().chunks.remove(&project_id);
        Ok(())
    }
}

#[async_trait]
impl ReportStore for InMemoryStores {
    async fn persist(&self, report: Report, findings: Vec<ReviewFinding>) -> Result<()> {
        // One report per project: persisting replaces.
        self.inner
            .write()
            .reports
            .insert(report.project_id, (report, findings));
        Ok(())
    }

    async fn get_by_project(
        &self,
        project_id: Uuid,
    ) -> Result<Option<(Report, Vec<ReviewFinding>)>> {
        Ok(self.inner.read().reports.get(&project_id).cloned())
    }

    async fn delete_by_project(&self, project_id: Uuid) -> Result<()> {
        self.inner.write().reports.remove(&project_id);
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for InMemoryStores {
    async fn put(&self, checkpoint: JobCheckpoint) -> Result<()> {
        self.inner
            .write()
            .checkpoints
            .insert((checkpoint.project_id, checkpoint.phase.clone()), checkpoint);
        Ok(())
    }

    async fn get(&self, project_id: Uuid, phase: &str) -> Result<Option<JobCheckpoint>> {
        Ok(self
            .inner
            .read()
            .checkpoints
            .get(&(project_id, phase.to_string()))
            .cloned())
    }

    async fn delete_by_project(&self, project_id: Uuid) -> Result<()> {
        self.inner
            .write()
            .checkpoints
            .retain(|(id, _), _| *id != project_id);
        Ok(())
    }
}
