//! Product manual extraction: PDF text → typed specs.
//!
//! Scans the documents root for manuals, pulls their text, and annotates
//! each with the specs the manual states. The SKU comes from the file name
//! prefix before the first `_` (`DS3031_manual.pdf` → `DS3031`). A manual
//! that cannot be read is skipped with a warning; it never aborts the scan.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::{Config, DocumentsConfig};
use crate::models::{Capacity, Dimensions};
use crate::normalize::{self, clean_text};
use crate::storage;

pub const MIME_PDF: &str = "application/pdf";

/// Extraction error. The caller skips the document.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported content-type: {0}")]
    UnsupportedContentType(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
}

/// Extract plain text from binary content.
pub fn extract_text(bytes: &[u8], content_type: &str) -> Result<String, ExtractError> {
    match content_type {
        MIME_PDF => pdf_extract::extract_text_from_mem(bytes)
            .map_err(|e| ExtractError::Pdf(e.to_string())),
        _ => Err(ExtractError::UnsupportedContentType(
            content_type.to_string(),
        )),
    }
}

fn content_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .as_deref()
    {
        Some("pdf") => MIME_PDF,
        _ => "application/octet-stream",
    }
}

static WEIGHT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bweight[:\s]+(\d+(?:\.\d+)?)\s*kg\b").unwrap());
static POWER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bpower[:\s]+(\d+(?:\.\d+)?)\s*w\b").unwrap());
static MATERIAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bmaterial[: \t]+([a-z][a-z \t]*[a-z])").unwrap());

/// Specs stated in one product manual.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManualSpecs {
    pub sku: String,
    pub dimensions: Option<Dimensions>,
    pub weight_kg: Option<f64>,
    pub power_w: Option<f64>,
    pub material: Option<String>,
    pub capacity: Option<Capacity>,
}

/// Annotate manual text. Missing specs are `None`.
pub fn extract_specs(sku: &str, raw_text: &str) -> ManualSpecs {
    // Line breaks bound the material value, so match it before cleaning.
    let material = MATERIAL
        .captures(raw_text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string());

    let text = clean_text(raw_text);
    let fields = normalize::normalize(&text, sku, "");
    let number = |re: &Regex| {
        re.captures(&text)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok())
    };

    ManualSpecs {
        sku: sku.to_string(),
        dimensions: fields.dimensions,
        weight_kg: number(&WEIGHT),
        power_w: number(&POWER),
        material: normalize::detect_material(material, &text),
        capacity: fields.capacity,
    }
}

/// SKU encoded in a manual's file name.
pub fn sku_from_file_name(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_string_lossy();
    let sku = stem.split('_').next()?.trim();
    if sku.is_empty() {
        None
    } else {
        Some(sku.to_string())
    }
}

/// Manual files under the documents root, sorted by path.
pub fn scan_manuals(docs: &DocumentsConfig) -> Result<Vec<PathBuf>> {
    let root = &docs.root;
    if !root.exists() {
        warn!(root = %root.display(), "documents root does not exist");
        return Ok(Vec::new());
    }

    let include_set = build_globset(&docs.include_globs)?;
    let exclude_set = build_globset(&docs.exclude_globs)?;

    let mut paths = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().to_string();

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }
        paths.push(path.to_path_buf());
    }

    paths.sort();
    Ok(paths)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

/// Outcome of an extraction pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractReport {
    pub documents: usize,
    pub extracted: Vec<ManualSpecs>,
    pub skipped: usize,
}

/// Extract specs from every manual and return them without writing.
pub fn extract_manuals(docs: &DocumentsConfig) -> Result<ExtractReport> {
    let paths = scan_manuals(docs)?;
    let mut report = ExtractReport {
        documents: paths.len(),
        ..ExtractReport::default()
    };

    for path in paths {
        let Some(sku) = sku_from_file_name(&path) else {
            warn!(path = %path.display(), "cannot derive SKU from file name, skipping");
            report.skipped += 1;
            continue;
        };
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read manual, skipping");
                report.skipped += 1;
                continue;
            }
        };
        match extract_text(&bytes, content_type_for(&path)) {
            Ok(text) => {
                debug!(sku = %sku, chars = text.len(), "extracted manual text");
                report.extracted.push(extract_specs(&sku, &text));
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping manual");
                report.skipped += 1;
            }
        }
    }

    Ok(report)
}

pub fn run_extract(config: &Config) -> Result<ExtractReport> {
    let report = extract_manuals(&config.documents)?;
    let output = config.specs_output_path();
    storage::write_json_atomic(&output, &report.extracted)?;

    println!("extract");
    println!("  documents: {}", report.documents);
    println!("  extracted: {}", report.extracted.len());
    println!("  skipped: {}", report.skipped);
    println!("  output: {}", output.display());
    println!("ok");
    Ok(report)
}
