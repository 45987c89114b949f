//! Pipeline orchestration.
//!
//! A delta sync is one sequential pass:
//!
//! ```text
//! watermark → fetch → flatten/normalize → merge → persist dataset
//!           → embed → persist index + metadata → advance watermark
//! ```
//!
//! Every fatal error returns before the watermark is written, so the next
//! run re-fetches the same window; the merge is keyed by SKU, which makes
//! re-applying a delta harmless. Only one sync may run at a time against a
//! data directory; nothing here locks the artifacts.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::client::{CatalogClient, CatalogSource};
use crate::config::{Config, StorageConfig};
use crate::embedding::{self, EmbeddingProvider};
use crate::error::PipelineError;
use crate::fetch::{fetch_since, FetchOptions};
use crate::flatten::flatten;
use crate::index::{self, ProductIndex};
use crate::merge::{merge, CanonicalDataset, MergeStats};
use crate::models::{format_timestamp, Product};
use crate::progress::{ProgressMode, SyncProgressReporter};
use crate::storage;
use crate::watermark::WatermarkStore;

/// Everything one run needs besides its upstream source and embedder.
pub struct RunContext {
    pub storage: StorageConfig,
    pub fetch: FetchOptions,
    pub batch_size: usize,
    pub progress: Box<dyn SyncProgressReporter>,
}

impl RunContext {
    pub fn from_config(
        config: &Config,
        page_size: Option<usize>,
        batch_size: Option<usize>,
        progress: ProgressMode,
    ) -> Self {
        Self {
            storage: config.storage.clone(),
            fetch: FetchOptions::from_config(&config.upstream, page_size),
            batch_size: batch_size.unwrap_or(config.embedding.batch_size),
            progress: progress.reporter(),
        }
    }

    fn watermark(&self) -> WatermarkStore {
        WatermarkStore::new(self.storage.state_path())
    }

    fn load_index(&self) -> Result<Option<ProductIndex>> {
        ProductIndex::load(&self.storage.index_path(), &self.storage.metadata_path())
    }

    fn save_index(&self, built: &ProductIndex) -> Result<()> {
        built.save(&self.storage.index_path(), &self.storage.metadata_path())
    }
}

/// What happened to the index during a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    Rebuilt { vectors: usize },
    Refreshed { appended: usize, total: usize },
    /// Embeddings are not configured.
    Skipped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub fetched: usize,
    pub flattened: usize,
    pub merge: MergeStats,
    pub dataset_size: usize,
    pub index: IndexOutcome,
    pub watermark: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PullReport {
    pub fetched: usize,
    pub flattened: usize,
    pub merge: MergeStats,
    pub dataset_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbedReport {
    pub records: usize,
    pub embedded: usize,
    pub total: usize,
}

/// Run one delta sync.
///
/// With `embedder = None` the index stage is skipped and the watermark
/// advances once the dataset is persisted.
pub async fn delta_sync(
    ctx: &RunContext,
    source: &mut dyn CatalogSource,
    embedder: Option<&dyn EmbeddingProvider>,
) -> Result<SyncReport> {
    let watermark = ctx.watermark();
    let since = watermark.get()?;
    // Fail on a half-written index before spending any upstream quota.
    let existing_index = match embedder {
        Some(_) => ctx.load_index()?,
        None => None,
    };
    let dataset = CanonicalDataset::load(&ctx.storage.dataset_path())?;
    info!(since = %format_timestamp(&since), dataset = dataset.len(), "starting delta sync");

    let raw = fetch_since(source, Some(since), &ctx.fetch, ctx.progress.as_ref()).await?;
    let newest = raw.iter().filter_map(|r| r.updated_at()).max();
    let deltas = flatten(&raw);
    let flattened = deltas.len();

    let (dataset, merge_stats) = merge(dataset, deltas);
    dataset
        .save(&ctx.storage.dataset_path())
        .context("Failed to persist canonical dataset")?;

    let index = match embedder {
        Some(embedder) => update_index(ctx, embedder, existing_index, dataset.records()).await?,
        None => {
            warn!("embeddings disabled, index not updated");
            IndexOutcome::Skipped
        }
    };

    let watermark_value = match newest {
        Some(ts) => watermark.set(ts)?,
        None => since,
    };

    Ok(SyncReport {
        fetched: raw.len(),
        flattened,
        merge: merge_stats,
        dataset_size: dataset.len(),
        index,
        watermark: watermark_value,
    })
}

async fn update_index(
    ctx: &RunContext,
    embedder: &dyn EmbeddingProvider,
    existing: Option<ProductIndex>,
    records: &[Product],
) -> Result<IndexOutcome> {
    let progress = ctx.progress.as_ref();
    let outcome = match existing {
        Some(existing) => {
            let (refreshed, stats) =
                index::refresh(embedder, existing, records, ctx.batch_size, progress).await?;
            if stats.appended > 0 {
                ctx.save_index(&refreshed)?;
            }
            IndexOutcome::Refreshed {
                appended: stats.appended,
                total: stats.total,
            }
        }
        None => {
            info!("no index found, building from scratch");
            let built = index::rebuild(embedder, records, ctx.batch_size, progress).await?;
            ctx.save_index(&built)?;
            IndexOutcome::Rebuilt {
                vectors: built.len(),
            }
        }
    };
    Ok(outcome)
}

/// Fetch the whole catalog, snapshot it, and merge it into the dataset.
///
/// Leaves the index and the watermark alone.
pub async fn full_pull(ctx: &RunContext, source: &mut dyn CatalogSource) -> Result<PullReport> {
    let dataset = CanonicalDataset::load(&ctx.storage.dataset_path())?;
    let raw = fetch_since(source, None, &ctx.fetch, ctx.progress.as_ref()).await?;
    storage::write_json_atomic(&ctx.storage.raw_path(), &raw)
        .context("Failed to write raw snapshot")?;

    let deltas = flatten(&raw);
    let flattened = deltas.len();
    let (dataset, merge_stats) = merge(dataset, deltas);
    dataset.save(&ctx.storage.dataset_path())?;

    Ok(PullReport {
        fetched: raw.len(),
        flattened,
        merge: merge_stats,
        dataset_size: dataset.len(),
    })
}

fn load_dataset_required(ctx: &RunContext) -> Result<CanonicalDataset> {
    let path = ctx.storage.dataset_path();
    let records: Vec<Product> =
        storage::read_json(&path)?.ok_or(PipelineError::MissingArtifact {
            what: "canonical dataset",
            path,
        })?;
    Ok(CanonicalDataset::from_records(records))
}

/// Rebuild the index and metadata from the whole dataset.
pub async fn embed_rebuild(
    ctx: &RunContext,
    embedder: &dyn EmbeddingProvider,
) -> Result<EmbedReport> {
    let dataset = load_dataset_required(ctx)?;
    let built = index::rebuild(
        embedder,
        dataset.records(),
        ctx.batch_size,
        ctx.progress.as_ref(),
    )
    .await?;
    ctx.save_index(&built)?;
    Ok(EmbedReport {
        records: dataset.len(),
        embedded: built.len(),
        total: built.len(),
    })
}

/// Append dataset records missing from an existing index.
pub async fn embed_refresh(
    ctx: &RunContext,
    embedder: &dyn EmbeddingProvider,
) -> Result<EmbedReport> {
    let existing =
        ProductIndex::load_required(&ctx.storage.index_path(), &ctx.storage.metadata_path())?;
    let dataset = load_dataset_required(ctx)?;
    let (refreshed, stats) = index::refresh(
        embedder,
        existing,
        dataset.records(),
        ctx.batch_size,
        ctx.progress.as_ref(),
    )
    .await?;
    if stats.appended > 0 {
        ctx.save_index(&refreshed)?;
    }
    Ok(EmbedReport {
        records: dataset.len(),
        embedded: stats.appended,
        total: stats.total,
    })
}

// ============ CLI entry points ============

pub async fn run_sync(
    config: &Config,
    page_size: Option<usize>,
    progress: ProgressMode,
) -> Result<()> {
    let ctx = RunContext::from_config(config, page_size, None, progress);
    let embedder = if config.embedding.is_enabled() {
        Some(embedding::create_provider(&config.embedding)?)
    } else {
        None
    };
    let mut client = CatalogClient::connect(&config.upstream).await?;
    let report = delta_sync(&ctx, &mut client, embedder.as_deref()).await?;

    println!("sync");
    println!("  fetched: {} records", report.fetched);
    println!("  flattened: {} products", report.flattened);
    println!("  added: {}", report.merge.added);
    println!("  updated: {}", report.merge.updated);
    println!("  dataset: {} products", report.dataset_size);
    match report.index {
        IndexOutcome::Rebuilt { vectors } => println!("  index: rebuilt, {} vectors", vectors),
        IndexOutcome::Refreshed { appended, total } => {
            println!("  index: appended {}, {} vectors", appended, total)
        }
        IndexOutcome::Skipped => println!("  index: skipped (embeddings disabled)"),
    }
    println!("  watermark: {}", format_timestamp(&report.watermark));
    println!("ok");
    Ok(())
}

pub async fn run_pull(
    config: &Config,
    page_size: Option<usize>,
    progress: ProgressMode,
) -> Result<()> {
    let ctx = RunContext::from_config(config, page_size, None, progress);
    let mut client = CatalogClient::connect(&config.upstream).await?;
    let report = full_pull(&ctx, &mut client).await?;

    println!("pull");
    println!("  fetched: {} records", report.fetched);
    println!("  flattened: {} products", report.flattened);
    println!("  added: {}", report.merge.added);
    println!("  updated: {}", report.merge.updated);
    println!("  dataset: {} products", report.dataset_size);
    println!("  snapshot: {}", ctx.storage.raw_path().display());
    println!("ok");
    Ok(())
}

pub async fn run_embed(
    config: &Config,
    rebuild: bool,
    batch_size: Option<usize>,
    progress: ProgressMode,
) -> Result<()> {
    if !config.embedding.is_enabled() {
        anyhow::bail!("Embeddings are disabled. Set [embedding] provider in config.");
    }
    let ctx = RunContext::from_config(config, None, batch_size, progress);
    let embedder = embedding::create_provider(&config.embedding)?;

    let (label, report) = if rebuild {
        ("embed rebuild", embed_rebuild(&ctx, embedder.as_ref()).await?)
    } else {
        ("embed refresh", embed_refresh(&ctx, embedder.as_ref()).await?)
    };

    println!("{}", label);
    println!("  dataset: {} products", report.records);
    println!("  embedded: {}", report.embedded);
    println!("  vectors: {}", report.total);
    println!("ok");
    Ok(())
}
