//! # chatvault
//!
//! CLI for the hybrid semantic + lexical chat search core. Message ingestion
//! itself is a library call (`chatvault_retrieval::chunk::chunk_thread`) for
//! an external importer to drive; this binary only runs schema migrations,
//! drives the vector indexer, and starts the HTTP surface.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use chatvault_retrieval::config::{self, Config};
use chatvault_retrieval::embedding::EmbeddingClient;
use chatvault_retrieval::hybrid::HybridService;
use chatvault_retrieval::indexer::VectorIndexer;
use chatvault_retrieval::lexical::LexicalSearcher;
use chatvault_retrieval::migrate;
use chatvault_retrieval::server;
use chatvault_retrieval::store::ChunkStore;
use chatvault_retrieval::vector::MilvusVectorStore;
use chatvault_retrieval::vector_search::VectorSearcher;

#[derive(Parser)]
#[command(name = "chatvault", about = "Hybrid semantic + lexical search over a local chat archive", version)]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, global = true, default_value = "./config/chatvault.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database schema migrations (chunks table, FTS5 mirror, triggers).
    Migrate,

    /// Start the HTTP search surface.
    Serve,

    /// Run one pass of the Vector Indexer over unsynced indexable chunks.
    Index,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Migrate => run_migrate(&config).await,
        Commands::Serve => run_serve(&config).await,
        Commands::Index => run_index(&config).await,
    }
}

async fn run_migrate(config: &Config) -> anyhow::Result<()> {
    migrate::run_migrations(config).await?;
    info!("migrations applied");
    Ok(())
}

async fn build_components(
    config: &Config,
) -> anyhow::Result<(ChunkStore, EmbeddingClient, Arc<MilvusVectorStore>)> {
    let pool = chatvault_retrieval::db::connect(config).await?;
    let store = ChunkStore::new(pool, config.hybrid.bm25.table.clone());
    let embedder = EmbeddingClient::new(&config.embedding)?;
    let vectors = Arc::new(MilvusVectorStore::connect(&config.milvus, config.embedding.dimension).await?);
    Ok((store, embedder, vectors))
}

async fn run_serve(config: &Config) -> anyhow::Result<()> {
    let (store, embedder, vectors) = build_components(config).await?;

    let lexical = LexicalSearcher::new(store.clone());
    let vector_search = VectorSearcher::new(embedder.clone(), vectors.clone(), config);
    let service = HybridService::new(store, lexical, vector_search, vectors, embedder, config.clone());

    server::run_server(config, service).await
}

async fn run_index(config: &Config) -> anyhow::Result<()> {
    let (store, embedder, vectors) = build_components(config).await?;
    let indexer = VectorIndexer::new(store, embedder, vectors, config);

    let cancel = CancellationToken::new();
    let stats = indexer.run_once(&cancel).await?;
    info!(batches = stats.batches, chunks_embedded = stats.chunks_embedded, "indexer pass complete");
    Ok(())
}
