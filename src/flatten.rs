//! Parent/variant flattening with attribute inheritance.
//!
//! Each upstream record becomes its parent product followed by one product
//! per nested `children` / `bundle_items` entry. A variant only inherits a
//! field from its parent when its own value is absent.

use serde_json::Value;
use tracing::warn;

use crate::models::{Product, RawRecord};
use crate::normalize::normalize_record;

/// Flatten upstream records into an ordered list of products.
///
/// Ordering: each parent precedes its own variants, and parent groups keep
/// their input order. Malformed entries (non-object children, missing SKUs)
/// are skipped with a warning rather than aborting the pass.
pub fn flatten(records: &[RawRecord]) -> Vec<Product> {
    let mut out = Vec::with_capacity(records.len());

    for record in records {
        let Some(parent) = normalize_record(record) else {
            warn!("skipping upstream record without a sku");
            continue;
        };

        let variants: Vec<Product> = record
            .nested()
            .filter_map(|child| variant_of(&parent, child))
            .collect();

        out.push(parent);
        out.extend(variants);
    }

    out
}

fn variant_of(parent: &Product, child: &Value) -> Option<Product> {
    let Value::Object(fields) = child else {
        warn!(parent = %parent.sku, "skipping non-object variant entry");
        return None;
    };
    let Some(mut variant) = normalize_record(&RawRecord::new(fields.clone())) else {
        warn!(parent = %parent.sku, "skipping variant without a sku");
        return None;
    };
    variant.is_variant = true;
    variant.parent_sku = Some(parent.sku.clone());
    inherit(&mut variant, parent);
    Some(variant)
}

fn fill<T: Clone>(child: &mut Option<T>, parent: &Option<T>) {
    if child.is_none() {
        child.clone_from(parent);
    }
}

/// Copy parent values into fields the variant left absent.
fn inherit(variant: &mut Product, parent: &Product) {
    fill(&mut variant.description, &parent.description);
    fill(&mut variant.features, &parent.features);
    fill(&mut variant.capacity, &parent.capacity);
    fill(&mut variant.dimensions, &parent.dimensions);
    fill(&mut variant.material, &parent.material);
    fill(&mut variant.corrosion_resistant, &parent.corrosion_resistant);
    fill(&mut variant.uom, &parent.uom);
    fill(
        &mut variant.country_of_manufacture,
        &parent.country_of_manufacture,
    );
}
