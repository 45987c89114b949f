//! Semantic product search over the persisted index.

use anyhow::{bail, Result};
use serde::Serialize;

use crate::config::Config;
use crate::embedding::{self, normalize_l2, EmbeddingProvider};
use crate::index::ProductIndex;

/// One ranked match.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub sku: String,
    pub name: String,
    /// Cosine similarity in `[-1, 1]`.
    pub score: f32,
}

/// Rank indexed products against `query`, best first.
pub async fn search_products(
    embedder: &dyn EmbeddingProvider,
    index: &ProductIndex,
    query: &str,
    limit: usize,
) -> Result<Vec<SearchHit>> {
    index.verify()?;
    if query.trim().is_empty() || index.is_empty() || limit == 0 {
        return Ok(Vec::new());
    }

    let mut vector = embedding::embed_query(embedder, query).await?;
    normalize_l2(&mut vector);

    let hits = index
        .index
        .search(&vector, limit)?
        .into_iter()
        .filter_map(|(ordinal, score)| {
            index.metadata.get(ordinal).map(|meta| SearchHit {
                sku: meta.sku.clone(),
                name: meta.name.clone(),
                score,
            })
        })
        .collect();
    Ok(hits)
}

pub async fn run_search(config: &Config, query: &str, limit: usize) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }
    if !config.embedding.is_enabled() {
        bail!("Search requires embeddings. Set [embedding] provider in config.");
    }

    let index = ProductIndex::load_required(
        &config.storage.index_path(),
        &config.storage.metadata_path(),
    )?;
    let embedder = embedding::create_provider(&config.embedding)?;
    let hits = search_products(embedder.as_ref(), &index, query, limit).await?;

    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        let name = if hit.name.is_empty() {
            "(unnamed)"
        } else {
            hit.name.as_str()
        };
        println!("{}. [{:.2}] {} / {}", i + 1, hit.score, hit.sku, name);
    }
    Ok(())
}
