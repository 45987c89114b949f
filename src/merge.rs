//! Canonical dataset and the merge engine.
//!
//! The canonical dataset is the accumulated, de-duplicated product table
//! keyed by SKU. Deltas are merged field by field: a delta value that is
//! present overwrites, an absent one keeps whatever the dataset already
//! held. Existing rows keep their position; new SKUs are appended in the
//! order they arrive.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;

use crate::models::Product;
use crate::storage;

/// Counts from one merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub added: usize,
    pub updated: usize,
}

/// Ordered product table with SKU lookup.
#[derive(Debug, Clone, Default)]
pub struct CanonicalDataset {
    records: Vec<Product>,
    positions: HashMap<String, usize>,
}

impl CanonicalDataset {
    /// Build from stored rows. A repeated SKU collapses into its first
    /// position with later rows merged over it.
    pub fn from_records(records: Vec<Product>) -> Self {
        let mut dataset = Self::default();
        dataset.apply(records);
        dataset
    }

    /// Load the dataset file; a missing file is an empty dataset.
    pub fn load(path: &Path) -> Result<Self> {
        let records: Vec<Product> = storage::read_json(path)?.unwrap_or_default();
        Ok(Self::from_records(records))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        storage::write_json_atomic(path, &self.records)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Product] {
        &self.records
    }

    pub fn get(&self, sku: &str) -> Option<&Product> {
        self.positions.get(sku).map(|&i| &self.records[i])
    }

    pub fn into_records(self) -> Vec<Product> {
        self.records
    }

    /// Merge `deltas` in place.
    pub fn apply(&mut self, deltas: impl IntoIterator<Item = Product>) -> MergeStats {
        let mut stats = MergeStats::default();
        for delta in deltas {
            match self.positions.get(&delta.sku) {
                Some(&i) => {
                    overlay(&mut self.records[i], &delta);
                    stats.updated += 1;
                }
                None => {
                    self.positions.insert(delta.sku.clone(), self.records.len());
                    self.records.push(delta);
                    stats.added += 1;
                }
            }
        }
        stats
    }
}

/// Merge `deltas` into `existing`, returning the new dataset.
pub fn merge(mut existing: CanonicalDataset, deltas: Vec<Product>) -> (CanonicalDataset, MergeStats) {
    let stats = existing.apply(deltas);
    (existing, stats)
}

fn overlay(dst: &mut Product, src: &Product) {
    overwrite(&mut dst.name, &src.name);
    overwrite(&mut dst.description, &src.description);
    overwrite(&mut dst.features, &src.features);
    overwrite(&mut dst.price, &src.price);
    overwrite(&mut dst.weight_kg, &src.weight_kg);
    overwrite(&mut dst.dimensions, &src.dimensions);
    overwrite(&mut dst.capacity, &src.capacity);
    overwrite(&mut dst.material, &src.material);
    overwrite(&mut dst.corrosion_resistant, &src.corrosion_resistant);
    overwrite(&mut dst.uom, &src.uom);
    overwrite(&mut dst.country_of_manufacture, &src.country_of_manufacture);
    overwrite(&mut dst.category_id, &src.category_id);
    overwrite(&mut dst.updated_at, &src.updated_at);
    // The variant flag and its parent move together. A delta without a
    // parent (a variant also listed top-level) leaves the pair alone.
    if src.parent_sku.is_some() {
        dst.is_variant = src.is_variant;
        dst.parent_sku.clone_from(&src.parent_sku);
    }
}

fn overwrite<T: Clone>(dst: &mut Option<T>, src: &Option<T>) {
    if src.is_some() {
        dst.clone_from(src);
    }
}
