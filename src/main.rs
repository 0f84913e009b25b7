//! # docindex CLI
//!
//! ```bash
//! docindex --config ./config/docindex.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docindex init` | Create the store schema |
//! | `docindex index` | Load, split, embed and write every document |
//! | `docindex index --distributed` | Same, on a pool of embedding workers |
//! | `docindex query "<question>"` | Retrieve nodes and synthesize an answer |
//! | `docindex stats` | Document and node counts |
//!
//! Logging goes to stderr and is controlled by `RUST_LOG` (default `warn`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use docindex::config;
use docindex::progress::ProgressMode;
use docindex::retrieve::QueryMode;
use docindex::{batch, pipeline, query, stats, store};

/// Index markdown documents into a vector store and query them.
#[derive(Parser)]
#[command(name = "docindex", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docindex.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the store schema. Safe to run more than once.
    Init,

    /// Index every document under `[source] root`.
    ///
    /// Each document's previous nodes are replaced, so re-indexing an
    /// unchanged tree leaves the store unchanged.
    Index {
        /// Embed on a pool of `[batch] workers` instead of sequentially.
        #[arg(long)]
        distributed: bool,

        /// Report file, document and node counts without embedding or writing.
        #[arg(long)]
        dry_run: bool,

        /// Progress on stderr: `human` or `json`. Bare `--progress` means
        /// `human`; without the flag, human progress is shown on a TTY.
        #[arg(long, num_args = 0..=1, default_missing_value = "human", value_name = "MODE")]
        progress: Option<String>,
    },

    /// Ask a question over the indexed documents.
    ///
    /// Prompts on stdin when no query is given.
    Query {
        query: Option<String>,

        /// `default` (vector), `text` (keyword) or `hybrid`.
        #[arg(long)]
        mode: Option<QueryMode>,

        /// Number of nodes to retrieve.
        #[arg(long)]
        top_k: Option<usize>,

        /// Print the retrieved nodes instead of a synthesized answer.
        #[arg(long)]
        no_synthesize: bool,

        /// Also print the nodes the answer was built from.
        #[arg(long)]
        show_sources: bool,
    },

    /// Show document and node counts.
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let vector_store = store::open_store(&cfg, store::configured_dims(&cfg)).await?;
            vector_store.ensure_schema().await?;
            println!("Store initialized: {}", store::describe(&cfg));
        }
        Commands::Index {
            distributed,
            dry_run,
            progress,
        } => {
            let mode = match progress.as_deref() {
                Some(s) => ProgressMode::parse(s)?,
                None => ProgressMode::default_for_tty(),
            };
            let reporter = mode.reporter();
            if distributed {
                batch::run_batch_index(&cfg, dry_run, reporter.as_ref()).await?;
            } else {
                pipeline::run_index(&cfg, dry_run, reporter.as_ref()).await?;
            }
        }
        Commands::Query {
            query,
            mode,
            top_k,
            no_synthesize,
            show_sources,
        } => {
            query::run_query(&cfg, query, mode, top_k, !no_synthesize, show_sources).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}
