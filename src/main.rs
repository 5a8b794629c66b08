//! # Roadwise CLI
//!
//! The `roadwise` binary drives the retrieval-augmented answering engine for
//! road-traffic law questions.
//!
//! ## Usage
//!
//! ```bash
//! roadwise --config ./config/roadwise.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `roadwise init` | Create the SQLite database and run schema migrations |
//! | `roadwise ingest <path>` | Extract, chunk, embed, and index a document |
//! | `roadwise ask "<question>"` | Ask a question grounded in the indexed corpus |
//! | `roadwise reset <session-id>` | Forget a session's conversation history |
//!
//! Sessions live in process memory only, so each CLI invocation starts with
//! no conversation history; `ask --session` and `reset` matter when the
//! engine is embedded in a longer-lived process via [`roadwise::RagEngine`].
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! roadwise init
//!
//! # Ingest a statute PDF
//! roadwise ingest ./statutes/road-traffic-act.pdf
//!
//! # Ask a question
//! roadwise ask "What is the speed limit in residential zones?"
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use roadwise::answer::HttpGenerator;
use roadwise::config;
use roadwise::embedding::HttpEmbedder;
use roadwise::index::SqliteIndex;
use roadwise::RagEngine;

/// Roadwise — retrieval-augmented answering over road-traffic law documents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file; a missing file falls back to built-in defaults.
#[derive(Parser)]
#[command(
    name = "roadwise",
    about = "Roadwise — retrieval-augmented answering over road-traffic law documents",
    version,
    long_about = "Roadwise ingests statute and regulation documents (PDF, plain text, Markdown), \
    chunks and embeds them into a local SQLite vector index, and answers questions grounded in \
    the retrieved passages with page-level citations."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/roadwise.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and the chunk and vector tables.
    /// Idempotent: running it again is safe.
    Init,

    /// Ingest a document (or a directory of documents) into the index.
    ///
    /// Extracts page texts, chunks them with token overlap, embeds every
    /// chunk, and replaces whatever the index previously held for each file.
    /// Re-ingesting an unchanged file leaves the index unchanged. For a
    /// directory, unsupported files are skipped.
    Ingest {
        /// Path to a PDF, .txt, or .md file, or a directory to walk.
        path: PathBuf,
    },

    /// Ask a question grounded in the indexed corpus.
    ///
    /// Retrieves the most relevant passages, assembles them with the
    /// session's history into a prompt, and prints the generated answer with
    /// its citations. Each CLI run is its own process and starts with no
    /// sessions, so every `ask` here is effectively one-shot.
    Ask {
        /// The question to answer.
        question: String,

        /// Session id to continue. Only meaningful within one process
        /// (embedded or scripted use); has no effect across CLI runs.
        #[arg(long)]
        session: Option<String>,
    },

    /// Forget a session's conversation history. Sessions are held in
    /// process memory, so this applies within one process only.
    Reset {
        /// Session id to forget.
        session_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("roadwise=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let cfg = if cli.config.exists() {
        config::load_config(&cli.config)?
    } else {
        config::Config::default()
    };

    match cli.command {
        Commands::Init => {
            let index = SqliteIndex::open(&cfg.storage.db_path).await?;
            index.close().await;
            println!("Database initialized at {}", cfg.storage.db_path.display());
        }
        Commands::Ingest { path } => {
            let engine = build_engine(cfg).await?;
            let reports = if path.is_dir() {
                engine.ingest_dir(&path).await?
            } else {
                vec![engine.ingest(&path).await?]
            };
            for report in &reports {
                println!(
                    "Ingested '{}' ({}): {} pages, {} chunks",
                    report.title, report.document_id, report.page_count, report.chunk_count
                );
            }
        }
        Commands::Ask { question, session } => {
            let engine = build_engine(cfg).await?;
            let outcome = engine.ask(session.as_deref(), &question).await?;

            println!("{}", outcome.answer.text);
            if !outcome.answer.citations.is_empty() {
                println!();
                println!("Sources:");
                for citation in &outcome.answer.citations {
                    println!("  {}", citation.marker());
                }
            }
        }
        Commands::Reset { session_id } => {
            let engine = build_engine(cfg).await?;
            match engine.reset_session(&session_id) {
                Ok(()) => println!("Session {} forgotten.", session_id),
                Err(roadwise::RagError::SessionNotFound(id)) => {
                    println!("No session {} found.", id)
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    Ok(())
}

async fn build_engine(cfg: config::Config) -> Result<RagEngine> {
    let index = Arc::new(SqliteIndex::open(&cfg.storage.db_path).await?);
    let embedder = Arc::new(HttpEmbedder::new(&cfg.embedding)?);
    let generator = Arc::new(HttpGenerator::new(&cfg.generation)?);
    Ok(RagEngine::new(cfg, index, embedder, generator))
}
