//! # catsync
//!
//! Keeps a searchable product catalog in sync with the upstream catalog API.
//!
//! ## Usage
//!
//! ```bash
//! catsync --config ./config/catsync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `catsync pull` | Fetch the whole catalog into the canonical dataset |
//! | `catsync sync` | Delta sync: fetch changes, merge, update the index, advance the watermark |
//! | `catsync embed rebuild` | Rebuild the vector index from the dataset |
//! | `catsync embed refresh` | Append dataset records missing from the index |
//! | `catsync search "<query>"` | Semantic product search |
//! | `catsync extract` | Extract specs from PDF product manuals |
//! | `catsync status` | Watermark, dataset, and index overview |
//!
//! Diagnostics go to stderr and are filtered with `RUST_LOG` (default `warn`).

use catalog_sync::progress::ProgressMode;
use catalog_sync::{config, extract, pipeline, search, status};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Incremental product catalog sync and semantic index.
#[derive(Parser)]
#[command(name = "catsync", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/catsync.toml")]
    config: PathBuf,

    /// Progress on stderr: auto (human when stderr is a TTY), off, human, or json.
    #[arg(long, global = true, value_enum, default_value_t = ProgressMode::Auto)]
    progress: ProgressMode,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch every product and merge it into the canonical dataset.
    ///
    /// Writes a raw snapshot alongside. Does not touch the index or the
    /// watermark.
    Pull {
        /// Records per upstream page (defaults to upstream.page_size).
        #[arg(long)]
        page_size: Option<usize>,
    },

    /// Fetch products changed since the last sync and bring the dataset
    /// and index up to date.
    ///
    /// The watermark advances only after the dataset and index are saved.
    Sync {
        /// Records per upstream page (defaults to upstream.page_size).
        #[arg(long)]
        page_size: Option<usize>,
    },

    /// Manage the vector index.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Semantic search over indexed products.
    Search {
        /// Free-text query.
        query: String,

        /// Maximum number of results.
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Extract typed specs from PDF product manuals.
    Extract,

    /// Show watermark, dataset, and index health.
    Status,
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Discard the index and embed every dataset record.
    Rebuild {
        /// Texts per embedding request (defaults to embedding.batch_size).
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Embed only dataset records missing from the index.
    Refresh {
        /// Texts per embedding request (defaults to embedding.batch_size).
        #[arg(long)]
        batch_size: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Pull { page_size } => {
            pipeline::run_pull(&cfg, page_size, cli.progress).await?;
        }
        Commands::Sync { page_size } => {
            pipeline::run_sync(&cfg, page_size, cli.progress).await?;
        }
        Commands::Embed { action } => match action {
            EmbedAction::Rebuild { batch_size } => {
                pipeline::run_embed(&cfg, true, batch_size, cli.progress).await?;
            }
            EmbedAction::Refresh { batch_size } => {
                pipeline::run_embed(&cfg, false, batch_size, cli.progress).await?;
            }
        },
        Commands::Search { query, limit } => {
            search::run_search(&cfg, &query, limit).await?;
        }
        Commands::Extract => {
            extract::run_extract(&cfg)?;
        }
        Commands::Status => {
            status::run_status(&cfg)?;
        }
    }

    Ok(())
}
