//! Archrev worker binary.
//!
//! Builds the whole engine in one composition root — stores, vector index,
//! embedding and chat clients, watchdog, progress hub, bus, and the job
//! runner — then consumes analysis commands until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use archrev_rs::agents::advisor::ArchitectureAdvisorAgent;
use archrev_rs::agents::code_quality::CodeQualityAgent;
use archrev_rs::agents::llm::{ChatClient, HttpChatClient};
use archrev_rs::agents::orchestrator::AgentOrchestrator;
use archrev_rs::agents::security::SecurityAgent;
use archrev_rs::agents::structure::StructureAgent;
use archrev_rs::core::config::ArchrevConfig;
use archrev_rs::embedding::client::{EmbeddingClient, HttpEmbeddingProvider};
use archrev_rs::report::aggregator::ReportAggregator;
use archrev_rs::runtime::bus::InMemoryBus;
use archrev_rs::runtime::job::JobRunner;
use archrev_rs::runtime::progress::ProgressHub;
use archrev_rs::runtime::watchdog::Watchdog;
use archrev_rs::storage::blob::FsBlobStorage;
use archrev_rs::storage::records::InMemoryStores;
use archrev_rs::vector::memory::InMemoryVectorIndex;
use archrev_rs::vector::qdrant::QdrantHttpIndex;
use archrev_rs::vector::store::VectorIndex;

#[derive(Parser)]
#[command(name = "archrev", version, about = "Architecture review worker")]
struct Cli {
    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker loop
    Serve {
        /// YAML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Blob storage root directory
        #[arg(long, default_value = ".archrev/blobs")]
        blob_root: PathBuf,

        /// Use the embedded vector index instead of the HTTP service
        #[arg(long)]
        in_memory_vectors: bool,
    },
    /// Print the default configuration as YAML
    PrintDefaultConfig,
    /// Validate a configuration file
    ValidateConfig {
        /// YAML configuration file
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Serve {
            config,
            blob_root,
            in_memory_vectors,
        } => serve(config, blob_root, in_memory_vectors).await,
        Commands::PrintDefaultConfig => {
            println!("{}", serde_yaml::to_string(&ArchrevConfig::default())?);
            Ok(())
        }
        Commands::ValidateConfig { config } => {
            ArchrevConfig::from_yaml_file(&config)?;
            println!("{} is valid", config.display());
            Ok(())
        }
    }
}

async fn serve(
    config_path: Option<PathBuf>,
    blob_root: PathBuf,
    in_memory_vectors: bool,
) -> anyhow::Result<()> {
    let mut config = match config_path {
        Some(path) => ArchrevConfig::from_yaml_file(path)?,
        None => ArchrevConfig::default(),
    };
    if let Ok(key) = std::env::var("ARCHREV_EMBEDDING_API_KEY") {
        config.embedding.api_key = Some(key);
    }
    if let Ok(key) = std::env::var("ARCHREV_CHAT_API_KEY") {
        config.analysis.chat_api_key = Some(key);
    }
    config.validate()?;

    // Composition root: every collaborator constructed here, by hand.
    let stores = Arc::new(InMemoryStores::new());
    let blobs = Arc::new(FsBlobStorage::new(blob_root));
    let vectors: Arc<dyn VectorIndex> = if in_memory_vectors {
        Arc::new(InMemoryVectorIndex::new(
            config.vector.clone(),
            config.embedding.embedding_dimension,
        ))
    } else {
        Arc::new(QdrantHttpIndex::new(
            config.vector.clone(),
            config.embedding.embedding_dimension,
            &config.resilience,
        ))
    };

    let embedder = Arc::new(EmbeddingClient::new(
        Arc::new(HttpEmbeddingProvider::new(config.embedding.clone())),
        &config.embedding,
        &config.resilience,
    ));
    let chat: Arc<dyn ChatClient> =
        Arc::new(HttpChatClient::new(&config.analysis, &config.resilience));

    let orchestrator = AgentOrchestrator::new(vec![
        Box::new(StructureAgent::new()),
        Box::new(CodeQualityAgent::new(
            Arc::clone(&chat),
            config.analysis.clone(),
        )),
        Box::new(SecurityAgent::new(Arc::clone(&chat))),
        Box::new(ArchitectureAdvisorAgent::new(Arc::clone(&chat))),
    ]);
    let aggregator = ReportAggregator::new(Arc::clone(&chat), stores.clone());

    let watchdog = Arc::new(Watchdog::new(config.watchdog.clone()));
    let progress = Arc::new(ProgressHub::new());
    let bus = Arc::new(InMemoryBus::new(config.resilience.max_retry_attempts + 1));

    let runner = Arc::new(JobRunner::new(
        config,
        stores.clone(),
        stores.clone(),
        stores.clone(),
        stores.clone(),
        blobs,
        vectors,
        embedder,
        orchestrator,
        aggregator,
        Arc::clone(&watchdog),
        progress,
        bus,
    ));

    let shutdown = CancellationToken::new();
    let sweeper = tokio::spawn(Arc::clone(&watchdog).run_sweeper(shutdown.clone()));
    let consume = tokio::spawn(Arc::clone(&runner).run(shutdown.clone()));

    info!("archrev worker running; ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    shutdown.cancel();

    let _ = consume.await;
    let _ = sweeper.await;
    Ok(())
}
