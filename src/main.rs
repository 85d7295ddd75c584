//! # Course RAG CLI (`course-rag`)
//!
//! ## Usage
//!
//! ```bash
//! course-rag --config ./config/course-rag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `course-rag serve` | Start the HTTP API |
//! | `course-rag ask "<question>"` | Answer one question and print sources |
//! | `course-rag query "<text>"` | Embed and search only; print ranked matches |
//!
//! Logging goes to stderr and is controlled by `RUST_LOG`
//! (default `info,course_rag=info`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use course_rag::{ask_cmd, config, server};

#[derive(Parser)]
#[command(
    name = "course-rag",
    about = "Course RAG — retrieval-augmented question answering over a course catalogue",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/course-rag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server.
    ///
    /// Binds to `[server].bind` and serves `/`, `/health`, `/version`,
    /// and `/ask` until Ctrl+C or SIGTERM.
    Serve,

    /// Answer a question through the full pipeline.
    Ask {
        /// The question. Multiple words are joined with spaces.
        #[arg(required = true, num_args = 1..)]
        question: Vec<String>,

        /// Number of course records to retrieve.
        #[arg(long)]
        top_k: Option<usize>,

        /// Print the JSON answer envelope instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Embed text and print the nearest course records.
    Query {
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,

        #[arg(long)]
        top_k: Option<usize>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,course_rag=info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Ask {
            question,
            top_k,
            json,
        } => {
            ask_cmd::run_ask(&cfg, &question.join(" "), top_k, json).await?;
        }
        Commands::Query { text, top_k } => {
            ask_cmd::run_query(&cfg, &text.join(" "), top_k).await?;
        }
    }

    Ok(())
}
