//! Vector index and its metadata sidecar.
//!
//! The index is an append-only list of unit-length vectors; the metadata
//! file holds one `{sku, name}` entry per vector at the same ordinal. The
//! two are only ever built, loaded, and saved together as a
//! [`ProductIndex`], and alignment is checked on every load and after every
//! rebuild or refresh. A mismatch is a fatal [`PipelineError::Integrity`].
//!
//! # Binary format
//!
//! ```text
//! offset  size  field
//! 0       4     magic  "CSVI"
//! 4       4     format version (u32 LE, currently 1)
//! 8       4     dims (u32 LE)
//! 12      8     vector count (u64 LE)
//! 20      ...   count × dims f32 LE
//! ```

use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::embedding::{blob_to_vec, build_text, normalize_l2, vec_to_blob, EmbeddingProvider};
use crate::error::PipelineError;
use crate::models::Product;
use crate::progress::{SyncProgressEvent, SyncProgressReporter};
use crate::storage;

const MAGIC: &[u8; 4] = b"CSVI";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 20;

/// Flat inner-product index over unit vectors.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorIndex {
    dims: usize,
    data: Vec<f32>,
}

impl VectorIndex {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            data: Vec::new(),
        }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn len(&self) -> usize {
        if self.dims == 0 {
            0
        } else {
            self.data.len() / self.dims
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a vector, normalizing it to unit length.
    pub fn add(&mut self, mut vector: Vec<f32>) -> Result<()> {
        if vector.len() != self.dims {
            return Err(PipelineError::DimensionMismatch {
                expected: self.dims,
                actual: vector.len(),
            }
            .into());
        }
        normalize_l2(&mut vector);
        self.data.extend_from_slice(&vector);
        Ok(())
    }

    pub fn vector(&self, ordinal: usize) -> Option<&[f32]> {
        let start = ordinal.checked_mul(self.dims)?;
        self.data.get(start..start + self.dims)
    }

    /// Top `k` ordinals by inner product with `query`, best first.
    ///
    /// `query` is expected to be unit length, making the score a cosine
    /// similarity.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(usize, f32)>> {
        if query.len() != self.dims {
            return Err(PipelineError::DimensionMismatch {
                expected: self.dims,
                actual: query.len(),
            }
            .into());
        }
        let mut scored: Vec<(usize, f32)> = (0..self.len())
            .filter_map(|i| self.vector(i).map(|v| (i, dot(v, query))))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);
        Ok(scored)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.data.len() * 4);
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&(self.dims as u32).to_le_bytes());
        bytes.extend_from_slice(&(self.len() as u64).to_le_bytes());
        bytes.extend_from_slice(&vec_to_blob(&self.data));
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN || &bytes[0..4] != MAGIC {
            return Err(PipelineError::CorruptIndex("missing index header".into()).into());
        }
        let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if version != FORMAT_VERSION {
            return Err(
                PipelineError::CorruptIndex(format!("unsupported format version {}", version))
                    .into(),
            );
        }
        let dims = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
        let mut count_bytes = [0u8; 8];
        count_bytes.copy_from_slice(&bytes[12..20]);
        let count = u64::from_le_bytes(count_bytes) as usize;

        let body = &bytes[HEADER_LEN..];
        let expected = count
            .checked_mul(dims)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| PipelineError::CorruptIndex("header overflows".into()))?;
        if body.len() != expected {
            return Err(PipelineError::CorruptIndex(format!(
                "header declares {} vectors of {} dims ({} bytes), found {} bytes",
                count,
                dims,
                expected,
                body.len()
            ))
            .into());
        }

        Ok(Self {
            dims,
            data: blob_to_vec(body),
        })
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Metadata for one indexed vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMetadataEntry {
    pub sku: String,
    pub name: String,
}

impl From<&Product> for IndexMetadataEntry {
    fn from(product: &Product) -> Self {
        Self {
            sku: product.sku.clone(),
            name: product.display_name().to_string(),
        }
    }
}

/// Vector index plus its ordinally aligned metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductIndex {
    pub index: VectorIndex,
    pub metadata: Vec<IndexMetadataEntry>,
}

/// Result of an incremental refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshStats {
    pub appended: usize,
    pub total: usize,
}

impl ProductIndex {
    pub fn empty(dims: usize) -> Self {
        Self {
            index: VectorIndex::new(dims),
            metadata: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.metadata.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty()
    }

    /// Fail unless vector count equals metadata length.
    pub fn verify(&self) -> Result<()> {
        if self.index.len() != self.metadata.len() {
            return Err(PipelineError::Integrity {
                vectors: self.index.len(),
                metadata: self.metadata.len(),
            }
            .into());
        }
        Ok(())
    }

    /// Load both artifacts. `None` when neither exists; one without the
    /// other is an integrity error.
    pub fn load(index_path: &Path, metadata_path: &Path) -> Result<Option<Self>> {
        let bytes = storage::read_bytes(index_path)?;
        let metadata: Option<Vec<IndexMetadataEntry>> = storage::read_json(metadata_path)?;

        let loaded = match (bytes, metadata) {
            (None, None) => return Ok(None),
            (Some(bytes), Some(metadata)) => Self {
                index: VectorIndex::from_bytes(&bytes)
                    .with_context(|| format!("Failed to load {}", index_path.display()))?,
                metadata,
            },
            (Some(bytes), None) => {
                let index = VectorIndex::from_bytes(&bytes)?;
                return Err(PipelineError::Integrity {
                    vectors: index.len(),
                    metadata: 0,
                }
                .into());
            }
            (None, Some(metadata)) => {
                return Err(PipelineError::Integrity {
                    vectors: 0,
                    metadata: metadata.len(),
                }
                .into());
            }
        };
        loaded.verify()?;
        Ok(Some(loaded))
    }

    /// Like [`ProductIndex::load`], but a missing index is fatal.
    pub fn load_required(index_path: &Path, metadata_path: &Path) -> Result<Self> {
        Self::load(index_path, metadata_path)?.ok_or_else(|| {
            PipelineError::MissingArtifact {
                what: "vector index",
                path: index_path.to_path_buf(),
            }
            .into()
        })
    }

    /// Persist vectors then metadata. Each file is replaced atomically.
    pub fn save(&self, index_path: &Path, metadata_path: &Path) -> Result<()> {
        self.verify()?;
        storage::write_bytes_atomic(index_path, &self.index.to_bytes())?;
        storage::write_json_atomic(metadata_path, &self.metadata)?;
        Ok(())
    }

    fn append(&mut self, vectors: Vec<Vec<f32>>, entries: Vec<IndexMetadataEntry>) -> Result<()> {
        if vectors.len() != entries.len() {
            return Err(PipelineError::Integrity {
                vectors: vectors.len(),
                metadata: entries.len(),
            }
            .into());
        }
        for vector in vectors {
            self.index.add(vector)?;
        }
        self.metadata.extend(entries);
        self.verify()
    }
}

/// Build a fresh index over `records`, in order.
pub async fn rebuild(
    embedder: &dyn EmbeddingProvider,
    records: &[Product],
    batch_size: usize,
    progress: &dyn SyncProgressReporter,
) -> Result<ProductIndex> {
    let mut built = ProductIndex::empty(embedder.dims());
    let vectors = embed_all(embedder, records, batch_size, progress).await?;
    built.append(vectors, records.iter().map(IndexMetadataEntry::from).collect())?;
    info!(vectors = built.len(), "rebuilt vector index");
    Ok(built)
}

/// Append records whose SKU is not yet in the metadata.
///
/// Already-indexed records are not re-embedded even if their content
/// changed; [`rebuild`] is the remedy for stale entries.
pub async fn refresh(
    embedder: &dyn EmbeddingProvider,
    mut existing: ProductIndex,
    latest: &[Product],
    batch_size: usize,
    progress: &dyn SyncProgressReporter,
) -> Result<(ProductIndex, RefreshStats)> {
    existing.verify()?;

    let mut seen: HashSet<&str> = existing.metadata.iter().map(|m| m.sku.as_str()).collect();
    let missing: Vec<Product> = latest
        .iter()
        .filter(|p| seen.insert(p.sku.as_str()))
        .cloned()
        .collect();

    if missing.is_empty() {
        debug!("index already covers every record");
        let total = existing.len();
        return Ok((existing, RefreshStats { appended: 0, total }));
    }

    if existing.index.dims() != embedder.dims() {
        return Err(PipelineError::DimensionMismatch {
            expected: existing.index.dims(),
            actual: embedder.dims(),
        }
        .into());
    }

    let vectors = embed_all(embedder, &missing, batch_size, progress).await?;
    existing.append(vectors, missing.iter().map(IndexMetadataEntry::from).collect())?;

    let stats = RefreshStats {
        appended: missing.len(),
        total: existing.len(),
    };
    info!(appended = stats.appended, total = stats.total, "refreshed vector index");
    Ok((existing, stats))
}

/// Embed `records` batch by batch, preserving order.
async fn embed_all(
    embedder: &dyn EmbeddingProvider,
    records: &[Product],
    batch_size: usize,
    progress: &dyn SyncProgressReporter,
) -> Result<Vec<Vec<f32>>> {
    if batch_size == 0 {
        bail!("batch size must be > 0");
    }
    let total = records.len() as u64;
    let mut vectors = Vec::with_capacity(records.len());

    for batch in records.chunks(batch_size) {
        let texts: Vec<String> = batch.iter().map(build_text).collect();
        let embedded = embedder
            .embed(&texts)
            .await
            .with_context(|| format!("Embedding failed ({})", embedder.model_name()))?;
        if embedded.len() != texts.len() {
            bail!(
                "Embedding provider returned {} vectors for {} texts",
                embedded.len(),
                texts.len()
            );
        }
        vectors.extend(embedded);
        progress.report(SyncProgressEvent::Embedding {
            n: vectors.len() as u64,
            total,
        });
    }

    Ok(vectors)
}
