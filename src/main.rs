//! # clinrag CLI
//!
//! The `clinrag` binary drives the indexing pipeline and query surface
//! from the command line and hosts the HTTP API.
//!
//! ## Usage
//!
//! ```bash
//! clinrag --config ./config/clinrag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `clinrag init` | Create the SQLite database and run schema migrations |
//! | `clinrag index` | Pull, flatten, embed, and index records |
//! | `clinrag status` | Show per-kind index stats and sync watermarks |
//! | `clinrag query "<prompt>"` | Ask a one-off question over the index |
//! | `clinrag serve` | Start the HTTP API |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clinrag::config;
use clinrag::connector::PracticeConnector;
use clinrag::db;
use clinrag::embedding::EmbeddingClient;
use clinrag::etl::EtlPipeline;
use clinrag::generation::GenerationClient;
use clinrag::migrate;
use clinrag::rag::RagEngine;
use clinrag::registry::KindRegistry;
use clinrag::server;
use clinrag::session::SessionCache;
use clinrag::store::VectorStore;

/// clinrag — index clinical practice records and query them with
/// retrieval-augmented generation.
#[derive(Parser)]
#[command(
    name = "clinrag",
    about = "Index clinical practice records and answer questions over them",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/clinrag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and the record_index and
    /// sync_watermarks tables. Idempotent.
    Init,

    /// Pull records from the practice system and index them.
    ///
    /// Defaults to an incremental sync of the appointment and
    /// prescription kinds; name kinds explicitly with `--kind`.
    Index {
        /// Kind to index (repeatable). Defaults to appointment and
        /// prescription.
        #[arg(long = "kind")]
        kinds: Vec<String>,

        /// Maximum number of records to fetch per kind.
        #[arg(long)]
        limit: Option<usize>,

        /// Ignore the source-side synced flags and re-fetch everything.
        #[arg(long)]
        full_reindex: bool,
    },

    /// Show per-kind index statistics and sync watermarks.
    Status,

    /// Ask a one-off question over the indexed records.
    Query {
        /// The natural-language question.
        prompt: String,

        /// Restrict retrieval to one patient code.
        #[arg(long)]
        patient: Option<String>,
    },

    /// Start the HTTP API server.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Index {
            kinds,
            limit,
            full_reindex,
        } => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;

            let registry = Arc::new(KindRegistry::builtin());
            let etl = EtlPipeline::new(
                pool.clone(),
                Arc::new(PracticeConnector::new(&cfg.source)?),
                Arc::new(EmbeddingClient::new(&cfg.embedding)?),
                registry.clone(),
                cfg.chunking.clone(),
            );

            let kinds: Vec<String> = if kinds.is_empty() {
                registry.default_names().into_iter().map(String::from).collect()
            } else {
                kinds
            };

            let results = etl
                .run_full_indexing(&kinds, limit, !full_reindex)
                .await;

            for (kind, outcome) in &results {
                println!("{}", kind);
                match &outcome.error {
                    Some(error) => println!("  error: {}", error),
                    None => {
                        println!("  records indexed: {}", outcome.records_indexed);
                        println!("  chunks created: {}", outcome.chunks_created);
                    }
                }
            }
            println!("ok");

            pool.close().await;
        }
        Commands::Status => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;

            let store = VectorStore::new(pool.clone());
            let stats = store.index_stats().await?;
            let watermarks = clinrag::watermark::load_watermarks(&pool).await?;

            println!("{:<14} {:>10} {:>10}", "KIND", "RECORDS", "CHUNKS");
            for kind in &stats {
                println!(
                    "{:<14} {:>10} {:>10}",
                    kind.source_kind, kind.unique_records, kind.total_chunks
                );
            }
            if stats.is_empty() {
                println!("(index is empty)");
            }

            println!();
            println!("{:<14} {:<22} {:<22}", "KIND", "LAST INDEXED", "LAST WRITE SEEN");
            for wm in &watermarks {
                println!(
                    "{:<14} {:<22} {:<22}",
                    wm.source_kind,
                    wm.last_indexed_at.format("%Y-%m-%d %H:%M:%S"),
                    wm.last_write_date.format("%Y-%m-%d %H:%M:%S")
                );
            }
            if watermarks.is_empty() {
                println!("(no syncs recorded)");
            }

            pool.close().await;
        }
        Commands::Query { prompt, patient } => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;

            let rag = RagEngine::new(
                VectorStore::new(pool.clone()),
                Arc::new(EmbeddingClient::new(&cfg.embedding)?),
                Arc::new(GenerationClient::new(&cfg.generation)?),
                Arc::new(SessionCache::new(Duration::from_secs(
                    cfg.chat.session_ttl_secs,
                ))),
                cfg.retrieval.top_k,
            );

            let outcome = rag.query(&prompt, patient.as_deref()).await?;

            println!("{}", outcome.response);
            println!();
            println!("sources: {}", outcome.sources.len());
            for (i, source) in outcome.sources.iter().enumerate() {
                println!(
                    "  {}. [{:.3}] {}",
                    i + 1,
                    source.similarity,
                    source.content.replace('\n', " ")
                );
            }

            pool.close().await;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
