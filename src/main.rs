//! # Support RAG CLI (`srag`)
//!
//! The `srag` binary builds the knowledge index from a markdown help corpus,
//! answers questions from the command line and serves the HTTP API.
//!
//! ## Usage
//!
//! ```bash
//! srag --config ./config/srag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `srag ingest` | Chunk and embed the corpus, write the index directory |
//! | `srag search "<query>"` | Show the packed retrieval result for a query |
//! | `srag ask "<question>"` | Answer a question with the configured model |
//! | `srag chat` | Interactive question loop over stdin |
//! | `srag serve` | Start the HTTP API |
//! | `srag config` | Print the effective configuration |
//!
//! ## Examples
//!
//! ```bash
//! # Build the index from ./knowledge_base
//! srag ingest
//!
//! # Inspect what would be sent to the model
//! srag search "how do I lock timesheets"
//!
//! # Full answer as JSON, without writing the query log
//! srag ask "Can I track time offline?" --json --no-log
//!
//! # Several questions against one warm engine
//! srag chat --debug
//!
//! # Serve POST /v1/query with debug logging
//! srag --log debug serve
//! ```

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use support_rag::{answer, config, ingest, search, server};

/// Support RAG: retrieval-augmented answers from a help-center corpus.
#[derive(Parser)]
#[command(
    name = "srag",
    about = "Retrieval-augmented support answers from a markdown help corpus",
    version,
    long_about = "Support RAG ingests a markdown help corpus into a hybrid BM25 + embedding \
    index and answers support questions with a local model, returning a validated JSON payload \
    with confidence, cited sources and a routing decision."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/srag.toml`. Relative paths inside the file
    /// resolve against the file's directory.
    #[arg(long, global = true, default_value = "./config/srag.toml")]
    config: PathBuf,

    /// Log filter (e.g. `info`, `debug`, `support_rag=trace`).
    ///
    /// Overrides `RUST_LOG`. Logs go to stderr.
    #[arg(long, global = true)]
    log: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Build the knowledge index from the corpus.
    ///
    /// Parses front matter, drops suppressed and duplicate articles, chunks
    /// every section, embeds the chunks and writes `[index].dir`.
    Ingest {
        /// Report counts without embedding or writing the index.
        #[arg(long)]
        dry_run: bool,
    },

    /// Run retrieval only and print the packed context.
    Search {
        /// The search query string.
        query: String,

        /// Maximum number of chunks to pack.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Answer a question.
    Ask {
        /// The question to answer.
        question: String,

        /// Print the full answer payload as JSON.
        #[arg(long)]
        json: bool,

        /// Print timing, retrieval and routing details.
        #[arg(long)]
        debug: bool,

        /// Do not append to the query log.
        #[arg(long)]
        no_log: bool,
    },

    /// Answer questions interactively, one per line.
    ///
    /// Keeps a single engine for the session so the cache, rate limiter
    /// and circuit breaker carry over between questions.
    Chat {
        /// Print timing, retrieval and cache details after each answer.
        #[arg(long)]
        debug: bool,

        /// Do not append to the query log.
        #[arg(long)]
        no_log: bool,
    },

    /// Start the HTTP server.
    ///
    /// Binds to `[server].bind` and serves `POST /v1/query`, `GET /health`
    /// and `GET /v1/metrics`. A missing index starts the server degraded.
    Serve,

    /// Print the effective configuration after validation.
    Config,
}

fn init_tracing(filter: Option<&str>) {
    let filter = match filter {
        Some(f) => EnvFilter::new(f),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log.as_deref());

    let cfg = config::load_config(&cli.config)?;
    let base_dir = cli
        .config
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .to_path_buf();

    match cli.command {
        Commands::Ingest { dry_run } => {
            ingest::run_ingest(&cfg, &base_dir, dry_run).await?;
        }
        Commands::Search { query, limit } => {
            search::run_search(&cfg, &base_dir, &query, limit).await?;
        }
        Commands::Ask {
            question,
            json,
            debug,
            no_log,
        } => {
            answer::run_ask(&cfg, &base_dir, &question, json, debug, no_log).await?;
        }
        Commands::Chat { debug, no_log } => {
            answer::run_chat(&cfg, &base_dir, debug, no_log).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg, &base_dir).await?;
        }
        Commands::Config => {
            config::print_summary(&cfg, &cli.config, &base_dir);
        }
    }

    Ok(())
}
