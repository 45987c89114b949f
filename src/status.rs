//! Pipeline health overview.
//!
//! Summarizes the watermark, the canonical dataset, and the index without
//! modifying anything. Used by `catsync status` to confirm that syncs and
//! embeddings are keeping up, and to surface a misaligned index before the
//! next refresh trips over it.

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::index::{IndexMetadataEntry, VectorIndex};
use crate::merge::CanonicalDataset;
use crate::models::format_timestamp;
use crate::storage;
use crate::watermark::WatermarkStore;

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineStatus {
    /// `None` before the first successful sync.
    pub watermark: Option<DateTime<Utc>>,
    pub products: usize,
    pub variants: usize,
    pub vectors: Option<usize>,
    pub metadata: Option<usize>,
}

impl PipelineStatus {
    pub fn aligned(&self) -> bool {
        self.vectors.unwrap_or(0) == self.metadata.unwrap_or(0)
    }
}

pub fn collect_status(config: &Config) -> Result<PipelineStatus> {
    let store = WatermarkStore::new(config.storage.state_path());
    let watermark = if store.path().exists() {
        Some(store.get()?)
    } else {
        None
    };

    let dataset = CanonicalDataset::load(&config.storage.dataset_path())?;
    let variants = dataset.records().iter().filter(|p| p.is_variant).count();

    // Counted independently so a broken pair is still reported.
    let vectors = match storage::read_bytes(&config.storage.index_path())? {
        Some(bytes) => Some(VectorIndex::from_bytes(&bytes)?.len()),
        None => None,
    };
    let metadata = storage::read_json::<Vec<IndexMetadataEntry>>(&config.storage.metadata_path())?
        .map(|m| m.len());

    Ok(PipelineStatus {
        watermark,
        products: dataset.len() - variants,
        variants,
        vectors,
        metadata,
    })
}

pub fn run_status(config: &Config) -> Result<()> {
    let status = collect_status(config)?;
    let count = |n: Option<usize>| n.map_or_else(|| "missing".to_string(), |n| n.to_string());

    println!("catsync status");
    println!("==============");
    println!();
    println!("  Data dir:    {}", config.storage.data_dir.display());
    println!(
        "  Watermark:   {}",
        status
            .watermark
            .map_or_else(|| "never synced".to_string(), |ts| format_timestamp(&ts))
    );
    println!();
    println!("  Products:    {}", status.products);
    println!("  Variants:    {}", status.variants);
    println!("  Vectors:     {}", count(status.vectors));
    println!("  Metadata:    {}", count(status.metadata));
    println!(
        "  Aligned:     {}",
        if status.aligned() { "yes" } else { "NO" }
    );
    if !status.aligned() {
        println!();
        println!("  Index and metadata disagree; run `catsync embed rebuild`.");
    }
    Ok(())
}
