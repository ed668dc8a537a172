//! # Document RAG CLI (`docrag`)
//!
//! ## Usage
//!
//! ```bash
//! docrag --config ./config/docrag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docrag init` | Create the metadata tables and the vector index schema |
//! | `docrag serve` | Start the HTTP API |
//! | `docrag upload <path>` | Store a file and record it as a document |
//! | `docrag process <doc_id>` | Extract, chunk, embed and index a document |
//! | `docrag ask "<question>"` | Answer a question from indexed fragments |
//! | `docrag session create <user>` | Create a session |
//! | `docrag session get <id>` | Show a session |
//! | `docrag documents` | List uploaded documents |
//! | `docrag blobs` | List stored blobs |
//!
//! ## Examples
//!
//! ```bash
//! docrag init
//! docrag upload ./handbook.pdf
//! docrag process 6f1c...
//! docrag ask "What is the refund policy?" --doc-id 6f1c... --top-k 3
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use doc_rag::app::App;
use doc_rag::config;
use doc_rag::query::ChatQuery;
use doc_rag::server;

/// Document RAG: upload documents, index them as embedded fragments,
/// and answer questions grounded in them.
#[derive(Parser)]
#[command(name = "docrag", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docrag.toml")]
    config: PathBuf,

    /// Enable debug logging (overridden by `RUST_LOG`).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the metadata database and the vector index.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Start the HTTP server on `[server].bind`.
    Serve,

    /// Upload a local file.
    Upload {
        path: PathBuf,

        /// Attach the document to an existing session.
        #[arg(long)]
        session: Option<String>,
    },

    /// Run the ingestion pipeline for an uploaded document.
    Process { doc_id: String },

    /// Ask a question.
    Ask {
        query: String,

        /// Restrict retrieval to one document.
        #[arg(long)]
        doc_id: Option<String>,

        /// Number of context fragments (default: `[retrieval].top_k`).
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Manage sessions.
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// List uploaded documents.
    Documents {
        #[arg(long)]
        session: Option<String>,
    },

    /// List blobs in storage.
    Blobs {
        #[arg(long, default_value = "")]
        prefix: String,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// Create a session for a user.
    Create { user_id: String },
    /// Show a session.
    Get { id: String },
}

fn setup_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    if let Commands::Serve = cli.command {
        return server::run_server(&cfg).await;
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let app = App::from_config(&cfg).await?;

    match cli.command {
        Commands::Init => {
            app.ensure_index().await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {}
        Commands::Upload { path, session } => {
            let bytes = tokio::fs::read(&path).await?;
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "upload".to_string());
            let doc = app
                .upload(&file_name, &bytes, session.as_deref(), &cancel)
                .await?;
            println!("Uploaded {} as document {}", doc.name, doc.id);
            println!("  blob: {}", doc.blob_url);
        }
        Commands::Process { doc_id } => {
            let report = app.process(&doc_id, &cancel).await?;
            println!(
                "Processed document {}: {} chunks indexed",
                report.doc_id, report.num_chunks
            );
        }
        Commands::Ask {
            query,
            doc_id,
            top_k,
        } => {
            let answer = app
                .ask(
                    &ChatQuery {
                        query,
                        doc_id,
                        top_k,
                    },
                    &cancel,
                )
                .await?;
            println!("{}", answer.answer);
            println!();
            println!("Context ({} fragments):", answer.context_chunks.len());
            for (i, chunk) in answer.context_chunks.iter().enumerate() {
                let preview: String = chunk.chars().take(120).collect();
                println!("  {}. {}", i + 1, preview.replace('\n', " "));
            }
        }
        Commands::Session { action } => match action {
            SessionAction::Create { user_id } => {
                let session = app.create_session(&user_id).await?;
                println!("Created session {} for {}", session.id, session.user_id);
            }
            SessionAction::Get { id } => match app.get_session(&id).await? {
                Some(session) => {
                    println!("id:         {}", session.id);
                    println!("user:       {}", session.user_id);
                    println!("created_at: {}", session.created_at.to_rfc3339());
                }
                None => anyhow::bail!("session not found: {}", id),
            },
        },
        Commands::Documents { session } => {
            let docs = app.list_documents(session.as_deref()).await?;
            if docs.is_empty() {
                println!("No documents.");
            }
            for doc in docs {
                let fragments = app.indexed_fragments(Some(&doc.id)).await?;
                println!(
                    "{}  {}  {} fragments  {}",
                    doc.id,
                    doc.created_at.format("%Y-%m-%d %H:%M:%S"),
                    fragments,
                    doc.name
                );
            }
        }
        Commands::Blobs { prefix } => {
            for name in app.list_blobs(&prefix, &cancel).await? {
                println!("{}", name);
            }
        }
    }

    Ok(())
}
