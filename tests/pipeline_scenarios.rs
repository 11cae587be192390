//! End-to-end pipeline scenarios over the real job runner with stubbed
//! external services: deterministic embedder, scripted chat LLM, in-memory
//! stores and vector index, filesystem blob storage, zip archives.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use zip::write::SimpleFileOptions;

use archrev_rs::agents::advisor::ArchitectureAdvisorAgent;
use archrev_rs::agents::code_quality::CodeQualityAgent;
use archrev_rs::agents::llm::ChatClient;
use archrev_rs::agents::orchestrator::AgentOrchestrator;
use archrev_rs::agents::security::SecurityAgent;
use archrev_rs::agents::structure::StructureAgent;
use archrev_rs::core::config::ArchrevConfig;
use archrev_rs::core::entities::{Project, ProjectStatus, Severity};
use archrev_rs::core::errors::Result;
use archrev_rs::embedding::client::{EmbeddingClient, EmbeddingProvider};
use archrev_rs::report::aggregator::ReportAggregator;
use archrev_rs::runtime::bus::{AnalysisEvent, InMemoryBus, MessageBus, StartAnalysisCommand};
use archrev_rs::runtime::job::JobRunner;
use archrev_rs::runtime::progress::ProgressHub;
use archrev_rs::runtime::watchdog::Watchdog;
use archrev_rs::storage::blob::{BlobStorage, FsBlobStorage};
use archrev_rs::storage::records::{InMemoryStores, ProjectStore, ReportStore};
use archrev_rs::vector::memory::InMemoryVectorIndex;
use archrev_rs::vector::store::VectorIndex;

const DIMENSION: usize = 32;

/// Deterministic embedder: vector derived from text bytes.
struct StubEmbedder {
    calls: AtomicUsize,
}

impl StubEmbedder {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for StubEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts
            .iter()
            .map(|text| {
                let mut vector = vec![0.1f32; DIMENSION];
                for (index, byte) in text.bytes().enumerate() {
                    vector[index % DIMENSION] += byte as f32 / 255.0;
                }
                vector
            })
            .collect())
    }
}

/// Scripted chat: empty finding arrays, canned narrative.
struct StubChat;

#[async_trait]
impl ChatClient for StubChat {
    async fn complete(&self, _prompt: &str, label: &str) -> Result<String> {
        Ok(match label {
            "report-narrative" => "The codebase is small and coherent.".to_string(),
            "report-recommendations" => r#"["Add an automated test suite"]"#.to_string(),
            _ => "[]".to_string(),
        })
    }
}

struct Harness {
    stores: Arc<InMemoryStores>,
    blobs: Arc<FsBlobStorage>,
    vectors: Arc<InMemoryVectorIndex>,
    bus: Arc<InMemoryBus>,
    watchdog: Arc<Watchdog>,
    runner: Arc<JobRunner>,
    _blob_dir: tempfile::TempDir,
}

fn build_harness(
    mut config: ArchrevConfig,
    provider: Arc<dyn EmbeddingProvider>,
    chat: Arc<dyn ChatClient>,
) -> Harness {
    config.embedding.embedding_dimension = DIMENSION;
    config.resilience.backoff_base_ms = 1;
    config.resilience.backoff_cap_ms = 2;

    let blob_dir = tempfile::tempdir().unwrap();
    let stores = Arc::new(InMemoryStores::new());
    let blobs = Arc::new(FsBlobStorage::new(blob_dir.path()));
    let vectors = Arc::new(InMemoryVectorIndex::new(
        config.vector.clone(),
        DIMENSION,
    ));
    let embedder = Arc::new(EmbeddingClient::new(
        provider,
        &config.embedding,
        &config.resilience,
    ));

    let orchestrator = AgentOrchestrator::new(vec![
        Box::new(StructureAgent::new()),
        Box::new(CodeQualityAgent::new(chat.clone(), config.analysis.clone())),
        Box::new(SecurityAgent::new(chat.clone())),
        Box::new(ArchitectureAdvisorAgent::new(chat.clone())),
    ]);
    let aggregator = ReportAggregator::new(chat, stores.clone());

    let watchdog = Arc::new(Watchdog::new(config.watchdog.clone()));
    let progress = Arc::new(ProgressHub::new());
    let bus = Arc::new(InMemoryBus::new(config.resilience.max_retry_attempts + 1));

    let runner = Arc::new(JobRunner::new(
        config,
        stores.clone(),
        stores.clone(),
        stores.clone(),
        stores.clone(),
        blobs.clone(),
        vectors.clone(),
        embedder,
        orchestrator,
        aggregator,
        watchdog.clone(),
        progress,
        bus.clone(),
    ));

    Harness {
        stores,
        blobs,
        vectors,
        bus,
        watchdog,
        runner,
        _blob_dir: blob_dir,
    }
}

fn default_harness() -> Harness {
    build_harness(
        ArchrevConfig::default(),
        Arc::new(StubEmbedder::new()),
        Arc::new(StubChat),
    )
}

fn build_zip(files: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut cursor);
        for (name, body) in files {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(body).unwrap();
        }
        writer.finish().unwrap();
    }
    cursor.into_inner()
}

async fn ingest(harness: &Harness, name: &str, files: &[(&str, Vec<u8>)]) -> Uuid {
    let key = format!("projects/{name}/archive.zip");
    harness.blobs.upload(&key, build_zip(files)).await.unwrap();

    let mut project = Project::new(name, key, Uuid::new_v4());
    project.transition(ProjectStatus::FilesReady).unwrap();
    let id = project.id;
    harness.stores.upsert(project).await.unwrap();
    id
}

/// Process deliveries until the queue drains (redeliveries included).
async fn drain(harness: &Harness) {
    while let Some(delivery) = harness.bus.receive().await {
        harness.runner.process_delivery(delivery).await;
    }
}

fn padded_source(lead: &str, target_bytes: usize) -> Vec<u8> {
    let mut body = String::from(lead);
    let mut counter = 0usize;
    while body.len() < target_bytes {
        body.push_str(&format!("// filler line {counter}\n"));
        counter += 1;
    }
    body.truncate(target_bytes);
    body.into_bytes()
}

#[tokio::test]
async fn small_repo_happy_path() {
    let harness = default_harness();
    let project_id = ingest(
        &harness,
        "small",
        &[
            ("index.ts", padded_source("export const a = 1;\n", 120)),
            ("utils.ts", padded_source("export const b = 2;\n", 200)),
            ("README.md", padded_source("# demo\n", 300)),
        ],
    )
    .await;

    harness
        .bus
        .send(StartAnalysisCommand::new(project_id))
        .await
        .unwrap();
    drain(&harness).await;

    let project = harness.stores.get(project_id).await.unwrap().unwrap();
    assert_eq!(project.status, ProjectStatus::Completed);
    assert_eq!(project.file_count, 3);

    let (report, findings) = harness
        .stores
        .get_by_project(project_id)
        .await
        .unwrap()
        .unwrap();
    // Only the structure agent's scaffolding findings apply; nothing High.
    assert_eq!(report.high_count, 0, "summary: {}", report.summary);
    assert!(report.health_score >= 90, "score {}", report.health_score);
    assert!(!findings.is_empty());
    assert!(!report.recommendations.is_empty());

    // All three files were small enough for direct context.
    assert_eq!(harness.vectors.count(Some(project_id)).await.unwrap(), 0);

    let events = harness.bus.events();
    assert!(events.iter().any(|e| matches!(e, AnalysisEvent::Started { .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        AnalysisEvent::Completed { success: true, report_id: Some(_), .. }
    )));

    // The report is readable through the runner once the job completed.
    let (loaded, loaded_findings) = harness.runner.get_report(project_id).await.unwrap();
    assert_eq!(loaded.id, report.id);
    assert_eq!(loaded_findings.len(), findings.len());
}

#[tokio::test]
async fn mixed_sizes_route_and_index() {
    let harness = default_harness();
    let big_cs = {
        let mut body = String::from("public class Big {\n");
        let mut index = 0usize;
        while body.len() < 50 * 1024 {
            body.push_str(&format!(
                "    public void Method{index}() {{ Console.WriteLine({index}); }}\n"
            ));
            index += 1;
        }
        body.push_str("}\n");
        body.into_bytes()
    };

    let project_id = ingest(
        &harness,
        "mixed",
        &[
            ("src/a.cs", padded_source("public class A { }\n", 2 * 1024)),
            ("src/b.cs", big_cs),
            ("data/large.json", vec![b'{'; 300 * 1024]),
        ],
    )
    .await;

    harness
        .bus
        .send(StartAnalysisCommand::new(project_id))
        .await
        .unwrap();
    drain(&harness).await;

    let project = harness.stores.get(project_id).await.unwrap().unwrap();
    assert_eq!(project.status, ProjectStatus::Completed);
    // Skipped files never become file records.
    assert_eq!(project.file_count, 2);

    let chunks = harness.stores.chunks_for(project_id);
    assert!(!chunks.is_empty());
    assert!(chunks.iter().all(|c| c.file_path == "src/b.cs"));
    for chunk in &chunks {
        assert!(chunk.invariants_hold(), "bad chunk {chunk:?}");
    }

    let indexed = harness.vectors.count(Some(project_id)).await.unwrap();
    assert_eq!(indexed, chunks.len());
}

#[tokio::test]
async fn binary_files_are_skipped() {
    let harness = default_harness();
    let project_id = ingest(
        &harness,
        "binaries",
        &[
            ("code.cs", padded_source("public class C { }\n", 5 * 1024)),
            ("image.png", vec![0u8; 15 * 1024]),
            ("archive.zip", vec![0u8; 50 * 1024]),
            ("db.dll", vec![0u8; 100 * 1024]),
        ],
    )
    .await;

    harness
        .bus
        .send(StartAnalysisCommand::new(project_id))
        .await
        .unwrap();
    drain(&harness).await;

    let project = harness.stores.get(project_id).await.unwrap().unwrap();
    assert_eq!(project.status, ProjectStatus::Completed);
    assert_eq!(project.file_count, 1);
    assert_eq!(harness.vectors.count(Some(project_id)).await.unwrap(), 0);
}

#[tokio::test]
async fn excluded_paths_are_skipped() {
    let harness = default_harness();
    let project_id = ingest(
        &harness,
        "excluded",
        &[
            ("src/app.cs", padded_source("public class App { }\n", 5 * 1024)),
            (
                "node_modules/pkg/index.js",
                padded_source("module.exports = 1;\n", 5 * 1024),
            ),
            ("bin/app.dll", vec![0u8; 5 * 1024]),
            (".git/objects/abc", vec![0u8; 5 * 1024]),
        ],
    )
    .await;

    harness
        .bus
        .send(StartAnalysisCommand::new(project_id))
        .await
        .unwrap();
    drain(&harness).await;

    let project = harness.stores.get(project_id).await.unwrap().unwrap();
    assert_eq!(project.status, ProjectStatus::Completed);
    assert_eq!(project.file_count, 1);
    let files = harness.stores.files(project_id).await.unwrap();
    assert_eq!(files[0].relative_path, "src/app.cs");
}

#[tokio::test]
async fn approval_gate_fails_without_flag() {
    let mut config = ArchrevConfig::default();
    config.router.approval_threshold_tokens = 10;
    let harness = build_harness(config, Arc::new(StubEmbedder::new()), Arc::new(StubChat));

    let project_id = ingest(
        &harness,
        "needs-approval",
        &[("src/app.cs", padded_source("public class App { }\n", 4096))],
    )
    .await;

    harness
        .bus
        .send(StartAnalysisCommand::new(project_id))
        .await
        .unwrap();
    drain(&harness).await;

    let project = harness.stores.get(project_id).await.unwrap().unwrap();
    assert_eq!(project.status, ProjectStatus::Failed);
    assert_eq!(
        project.error_message.as_deref(),
        Some("Project.ApprovalRequired")
    );

    // The same command with the approval flag goes through after a reset.
    harness.runner.reset(project_id).await.unwrap();
    harness
        .bus
        .send(StartAnalysisCommand::new(project_id).approved())
        .await
        .unwrap();
    drain(&harness).await;
    let project = harness.stores.get(project_id).await.unwrap().unwrap();
    assert_eq!(project.status, ProjectStatus::Completed);
}

#[tokio::test]
async fn transient_embedding_failure_redelivers_then_completes() {
    /// Fails enough calls to exhaust one delivery's in-job retries, then
    /// recovers so the bus-level redelivery path completes the job.
    struct FlakyEmbedder {
        inner: StubEmbedder,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for FlakyEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(archrev_rs::core::errors::ArchrevError::transient(
                    "Embedding.RateLimited",
                    "try later",
                ));
            }
            self.inner.embed(texts).await
        }
    }

    // Defaults allow 4 in-job attempts per delivery; 4 failures burn the
    // first delivery entirely and the second delivery succeeds.
    let harness = build_harness(
        ArchrevConfig::default(),
        Arc::new(FlakyEmbedder {
            inner: StubEmbedder::new(),
            failures_left: AtomicUsize::new(4),
        }),
        Arc::new(StubChat),
    );

    let project_id = ingest(
        &harness,
        "flaky",
        &[(
            "src/service.cs",
            padded_source("public class Service { }\n", 64 * 1024),
        )],
    )
    .await;

    harness
        .bus
        .send(StartAnalysisCommand::new(project_id))
        .await
        .unwrap();
    drain(&harness).await;

    let project = harness.stores.get(project_id).await.unwrap().unwrap();
    assert_eq!(
        project.status,
        ProjectStatus::Completed,
        "error: {:?}",
        project.error_message
    );
}

#[tokio::test]
async fn delete_then_reingest_yields_fresh_state() {
    let harness = default_harness();
    let files = [(
        "src/core.cs",
        padded_source("public class Core { }\n", 64 * 1024),
    )];

    let project_id = ingest(&harness, "cycle", &files).await;
    harness
        .bus
        .send(StartAnalysisCommand::new(project_id))
        .await
        .unwrap();
    drain(&harness).await;

    assert!(harness.vectors.count(Some(project_id)).await.unwrap() > 0);
    let first_chunks = harness.stores.chunks_for(project_id);
    assert!(!first_chunks.is_empty());

    harness.runner.delete(project_id).await.unwrap();
    assert!(harness.stores.get(project_id).await.unwrap().is_none());
    assert_eq!(harness.vectors.count(Some(project_id)).await.unwrap(), 0);
    assert!(harness.stores.chunks_for(project_id).is_empty());
    assert!(harness
        .stores
        .get_by_project(project_id)
        .await
        .unwrap()
        .is_none());

    // Same archive, fresh project: a complete new set of chunks.
    let second_id = ingest(&harness, "cycle", &files).await;
    harness
        .bus
        .send(StartAnalysisCommand::new(second_id))
        .await
        .unwrap();
    drain(&harness).await;

    let second = harness.stores.get(second_id).await.unwrap().unwrap();
    assert_eq!(second.status, ProjectStatus::Completed);
    let second_chunks = harness.stores.chunks_for(second_id);
    assert_eq!(second_chunks.len(), first_chunks.len());
    // Chunk identity is project-scoped, so hashes differ across projects.
    assert_ne!(second_chunks[0].chunk_hash, first_chunks[0].chunk_hash);
}

#[tokio::test]
async fn stuck_indexing_fails_with_watchdog_code() {
    /// Blocks until the test releases it, simulating a stalled provider.
    struct BlockedEmbedder {
        release: Arc<tokio::sync::Notify>,
        inner: StubEmbedder,
    }

    #[async_trait]
    impl EmbeddingProvider for BlockedEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.release.notified().await;
            self.inner.embed(texts).await
        }
    }

    let release = Arc::new(tokio::sync::Notify::new());
    let mut config = ArchrevConfig::default();
    config.watchdog.max_heartbeat_interval_seconds = 1;
    config.watchdog.auto_cancel_stuck = true;
    let harness = build_harness(
        config,
        Arc::new(BlockedEmbedder {
            release: release.clone(),
            inner: StubEmbedder::new(),
        }),
        Arc::new(StubChat),
    );

    let project_id = ingest(
        &harness,
        "stuck",
        &[(
            "src/slow.cs",
            padded_source("public class Slow { }\n", 64 * 1024),
        )],
    )
    .await;

    harness
        .bus
        .send(StartAnalysisCommand::new(project_id))
        .await
        .unwrap();

    let runner = harness.runner.clone();
    let bus = harness.bus.clone();
    let job = tokio::spawn(async move {
        while let Some(delivery) = bus.receive().await {
            runner.process_delivery(delivery).await;
        }
    });

    // Let the heartbeat go silent past the one-second threshold; sweep
    // until the batch is declared stuck.
    let mut stuck = Vec::new();
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        stuck = harness.watchdog.sweep();
        if !stuck.is_empty() {
            break;
        }
    }
    assert_eq!(stuck, vec![project_id]);

    // Unblock the provider; the runner observes the cancelled batch token.
    release.notify_waiters();
    job.await.unwrap();

    let project = harness.stores.get(project_id).await.unwrap().unwrap();
    assert_eq!(project.status, ProjectStatus::Failed);
    assert_eq!(project.error_message.as_deref(), Some("Watchdog.Stuck"));

    let events = harness.bus.events();
    assert!(events.iter().any(|e| matches!(
        e,
        AnalysisEvent::Failed { error_message, .. } if error_message == "Watchdog.Stuck"
    )));
}

#[tokio::test(start_paused = true)]
async fn rate_limit_saturation_completes_without_deadlock() {
    /// Records the peak number of concurrent provider calls.
    struct GaugedEmbedder {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for GaugedEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(texts.iter().map(|_| vec![0.5f32; DIMENSION]).collect())
        }
    }

    let provider = Arc::new(GaugedEmbedder {
        in_flight: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });

    let mut config = ArchrevConfig::default();
    config.embedding.embedding_dimension = DIMENSION;
    // A deliberately starved budget: every batch overflows the period and
    // has to wait for rollovers.
    config.embedding.embedding_tokens_per_minute = 500;
    let client = EmbeddingClient::new(
        provider.clone(),
        &config.embedding,
        &config.resilience,
    );

    let texts: Vec<String> = (0..200)
        .map(|i| format!("fn generated_{i}() {{ compute({i}); }}"))
        .collect();

    let vectors = client
        .embed_all(&texts, &CancellationToken::new(), |_, _| {})
        .await
        .unwrap();

    assert_eq!(vectors.len(), 200);
    assert!(
        provider.peak.load(Ordering::SeqCst)
            <= ArchrevConfig::default().embedding.embedding_concurrency,
        "provider concurrency exceeded the gate"
    );
}

#[tokio::test]
async fn rejected_command_does_not_touch_project() {
    let harness = default_harness();
    let project_id = ingest(
        &harness,
        "busy",
        &[("src/app.cs", padded_source("public class App { }\n", 1024))],
    )
    .await;

    // Move the project out of FilesReady by hand.
    let mut project = harness.stores.get(project_id).await.unwrap().unwrap();
    project.transition(ProjectStatus::Queued).unwrap();
    project.transition(ProjectStatus::Analyzing).unwrap();
    harness.stores.upsert(project).await.unwrap();

    harness
        .bus
        .send(StartAnalysisCommand::new(project_id))
        .await
        .unwrap();
    drain(&harness).await;

    // Still Analyzing: the rejected command only produced an event.
    let project = harness.stores.get(project_id).await.unwrap().unwrap();
    assert_eq!(project.status, ProjectStatus::Analyzing);
    assert_eq!(
        harness
            .runner
            .get_report(project_id)
            .await
            .unwrap_err()
            .error_code(),
        "Report.NotReady"
    );
    assert!(harness.bus.events().iter().any(|e| matches!(
        e,
        AnalysisEvent::Failed { error_message, .. } if error_message == "Project.AlreadyAnalyzing"
    )));
}

#[tokio::test]
async fn findings_survive_into_sorted_report() {
    // A chat stub that reports one real finding per cluster call.
    struct FindingChat;

    #[async_trait]
    impl ChatClient for FindingChat {
        async fn complete(&self, _prompt: &str, label: &str) -> Result<String> {
            Ok(match label {
                "cluster-analysis" => r#"[{"file_path": "src/app.cs",
                    "severity": "High", "category": "Security",
                    "description": "Credentials flow through logs",
                    "explanation": "Request logging includes auth headers.",
                    "suggested_fix": "Redact sensitive headers",
                    "confidence": 0.9}]"#
                    .to_string(),
                "report-narrative" => "Logging leaks credentials.".to_string(),
                _ => "[]".to_string(),
            })
        }
    }

    let harness = build_harness(
        ArchrevConfig::default(),
        Arc::new(StubEmbedder::new()),
        Arc::new(FindingChat),
    );

    let project_id = ingest(
        &harness,
        "findings",
        &[(
            "src/app.cs",
            padded_source("public class App { }\n", 2048),
        )],
    )
    .await;

    harness
        .bus
        .send(StartAnalysisCommand::new(project_id))
        .await
        .unwrap();
    drain(&harness).await;

    let (report, findings) = harness
        .stores
        .get_by_project(project_id)
        .await
        .unwrap()
        .unwrap();

    assert!(report.high_count >= 1);
    assert_eq!(findings[0].severity, Severity::High);
    assert!(report.summary.starts_with("Logging leaks credentials."));
    // One High finding costs ten points before the structure findings.
    assert!(report.health_score <= 90);
}
