//! # Agentic RAG CLI (`rag`)
//!
//! Runs the ingestion pipeline stage by stage or end to end, asks the
//! routing agent questions, and starts the chat server.
//!
//! ## Usage
//!
//! ```bash
//! rag --config ./config/rag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rag ingest <path>` | OCR, chunk, embed and load a file or directory |
//! | `rag ocr <file>` | OCR one PDF or image |
//! | `rag chunk <ocr result>` | Chunk an OCR result or markdown file |
//! | `rag embed <chunks>` | Embed a chunk file |
//! | `rag load <embeddings>` | Load an embedding file into the vector store |
//! | `rag collection create/delete` | Manage vector store collections |
//! | `rag ask "<question>"` | One turn with the routing agent |
//! | `rag eval <questions>` | Answer a batch of questions |
//! | `rag serve` | Start the HTTP/WebSocket chat server |
//!
//! ## Examples
//!
//! ```bash
//! # Ingest a folder of scanned rulebooks into one collection
//! rag ingest ./docs --collection rules --recreate
//!
//! # Rerun chunking with another strategy, then embed and load
//! rag chunk data/processed/ocr_result_<id>.json --strategy page-overlap
//! rag embed data/processed/chunked_<id>.json
//! rag load data/processed/embeddings_<id>.json --collection rules
//!
//! # Ask a question
//! rag ask "Quanto dura un tempo di gioco?"
//! ```

use agentic_rag::chunk::ChunkStrategy;
use agentic_rag::config::{self, Config};
use agentic_rag::conversation::{ConversationHandler, StdoutSink};
use agentic_rag::models::InputMessage;
use agentic_rag::{evaluate, ingest, logging, server};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use uuid::Uuid;

const DEFAULT_CONFIG: &str = "./config/rag.toml";

/// Agentic RAG CLI: document ingestion and a tool-calling question
/// answering agent.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/rag.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "rag",
    about = "OCR-to-vector-store ingestion and a tool-calling agent for document question answering",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/rag.toml`; built-in defaults are used when that
    /// file does not exist. Environment variables (`QDRANT_URL`,
    /// `AZURE_OPENAI_ENDPOINT`, ...) override file values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the whole pipeline for a file or every PDF/image in a directory.
    Ingest {
        /// File or directory to ingest.
        path: PathBuf,

        /// Target collection. Defaults to `vector_store.collection`, else
        /// the document id.
        #[arg(long)]
        collection: Option<String>,

        /// Chunking strategy (overrides `chunking.strategy`).
        #[arg(long, value_enum)]
        strategy: Option<ChunkStrategy>,

        /// Drop each target collection before loading.
        #[arg(long)]
        recreate: bool,
    },

    /// OCR a PDF or image and save the result under `ocr.output_dir`.
    Ocr {
        file: PathBuf,
    },

    /// Chunk an OCR result (`ocr_result_<id>.json`) or a markdown file.
    Chunk {
        input: PathBuf,

        #[arg(long, value_enum)]
        strategy: Option<ChunkStrategy>,
    },

    /// Embed a chunk file, reusing vectors of unchanged chunks.
    Embed {
        input: PathBuf,

        /// Override the batch size from config (texts per API call).
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Load an embedding file into the vector store.
    Load {
        input: PathBuf,

        #[arg(long)]
        collection: Option<String>,
    },

    /// Manage vector store collections.
    Collection {
        #[command(subcommand)]
        action: CollectionAction,
    },

    /// Ask the routing agent one question.
    ///
    /// Prints the user message, every tool call and result, and the answer.
    Ask {
        question: String,

        /// Continue a conversation (only meaningful with an id reused
        /// within one process, e.g. by the server).
        #[arg(long)]
        conversation_id: Option<String>,
    },

    /// Answer every question of a file and write the answers as JSON.
    Eval {
        /// JSON array of strings, or one question per line.
        questions: PathBuf,

        /// Output file. Defaults to `tmp/qa_<collection>_<timestamp>.json`.
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Start the chat server on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum CollectionAction {
    /// Create an empty collection.
    Create {
        name: String,

        /// Vector dimension. Defaults to `embedding.dims`.
        #[arg(long)]
        dims: Option<usize>,
    },
    /// Delete a collection and all its points.
    Delete {
        name: String,
    },
}

fn load(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(p) => config::load_config(p),
        None => config::load_config_or_default(Path::new(DEFAULT_CONFIG), true),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let cfg = load(cli.config.as_deref())?;
    logging::init(&cfg.logging, cli.verbose);

    match cli.command {
        Commands::Ingest {
            path,
            collection,
            strategy,
            recreate,
        } => {
            ingest::run_ingest(&cfg, &path, collection.as_deref(), strategy, recreate).await?;
        }
        Commands::Ocr { file } => {
            let (document_id, artifacts) = ingest::run_ocr(&cfg, &file).await?;
            println!("document: {}", document_id);
            println!("  json: {}", artifacts.json.display());
            println!("  markdown: {}", artifacts.markdown.display());
        }
        Commands::Chunk { input, strategy } => {
            let path = ingest::run_chunk(&cfg, &input, strategy)?;
            println!("{}", path.display());
        }
        Commands::Embed { input, batch_size } => {
            let path = ingest::run_embed(&cfg, &input, batch_size).await?;
            println!("{}", path.display());
        }
        Commands::Load { input, collection } => {
            let points = ingest::run_load(&cfg, &input, collection.as_deref()).await?;
            println!("{} points loaded", points);
        }
        Commands::Collection { action } => match action {
            CollectionAction::Create { name, dims } => {
                let dims = dims.or(cfg.embedding.dims).ok_or_else(|| {
                    anyhow::anyhow!("--dims is required when embedding.dims is not configured")
                })?;
                ingest::create_collection(&cfg, &name, dims).await?;
                println!("Collection {} created ({} dims).", name, dims);
            }
            CollectionAction::Delete { name } => {
                ingest::delete_collection(&cfg, &name).await?;
                println!("Collection {} deleted.", name);
            }
        },
        Commands::Ask {
            question,
            conversation_id,
        } => {
            let handler = ConversationHandler::from_config(&cfg)?;
            let conversation_id =
                conversation_id.unwrap_or_else(|| Uuid::new_v4().simple().to_string());
            let input = InputMessage::new(conversation_id, cfg.agent.user_id.as_str(), question);
            handler.handle(&input, &StdoutSink).await?;
        }
        Commands::Eval { questions, output } => {
            evaluate::run_eval(&cfg, &questions, output.as_deref()).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
