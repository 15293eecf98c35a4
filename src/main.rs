//! # Clausebase CLI (`clausebase`)
//!
//! The `clausebase` binary initializes the database and runs the API server
//! with its processing queue.
//!
//! ## Usage
//!
//! ```bash
//! clausebase --config ./config/clausebase.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `clausebase init` | Create the SQLite database and run schema migrations |
//! | `clausebase serve` | Start the HTTP server and processing queue |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use clausebase::config::load_config;
use clausebase::db::connect;
use clausebase::embedding::{create_embedder, EmbeddingGenerator};
use clausebase::events::EventBus;
use clausebase::extract::create_extractor;
use clausebase::metadata::create_metadata_extractor;
use clausebase::migrate::run_migrations;
use clausebase::queue::{PipelineDeps, ProcessingQueue};
use clausebase::server::{run_server, AppState};
use clausebase::storage::{create_storage, ObjectStorage};
use clausebase::store::Store;
use clausebase::vector_store::{SqliteVectorStore, VectorStore};

/// Contract document processing backend.
///
/// All settings are read from the TOML file given by `--config`. See
/// `config/clausebase.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "clausebase",
    about = "Clausebase — contract upload, indexing, and metadata extraction backend",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/clausebase.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. Idempotent;
    /// running it multiple times is safe.
    Init,

    /// Start the HTTP server and the processing queue.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = connect(&config).await?;
            run_migrations(&pool).await?;
            println!("Database initialized at {}", config.db.path.display());
        }
        Commands::Serve => {
            let pool = connect(&config).await?;
            run_migrations(&pool).await?;

            let store = Store::new(pool.clone());
            let storage: Arc<dyn ObjectStorage> = Arc::from(create_storage(&config.storage)?);
            let embedder: Arc<dyn EmbeddingGenerator> =
                Arc::from(create_embedder(&config.embedding)?);
            let vectors: Arc<dyn VectorStore> = Arc::new(SqliteVectorStore::new(pool));
            let deps = PipelineDeps {
                storage: Arc::clone(&storage),
                extractor: create_extractor(&config.extraction)?,
                embedder: Arc::clone(&embedder),
                metadata: create_metadata_extractor(&config.metadata)?,
            };

            let events = EventBus::new();
            let queue = ProcessingQueue::new(
                &config,
                store.clone(),
                Arc::clone(&vectors),
                deps,
                events.clone(),
            );
            queue.start();

            run_server(AppState {
                config: Arc::new(config),
                store,
                queue,
                events,
                storage,
                embedder,
                vectors,
            })
            .await?;
        }
    }

    Ok(())
}
