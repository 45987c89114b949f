//! TOML configuration.
//!
//! ```toml
//! [upstream]
//! base_url = "https://shop.example.com/rest"
//! page_size = 100
//! page_delay_ms = 1000
//!
//! [storage]
//! data_dir = "./data"
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [documents]
//! root = "./data/manuals"
//! ```
//!
//! Upstream credentials are read from `CATALOG_API_USERNAME` and
//! `CATALOG_API_PASSWORD`, never from the file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub documents: DocumentsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,
    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_products_endpoint")]
    pub products_endpoint: String,
    #[serde(default = "default_token_endpoint")]
    pub token_endpoint: String,
}

fn default_page_size() -> usize {
    100
}
fn default_page_delay_ms() -> u64 {
    1000
}
fn default_upstream_timeout() -> u64 {
    20
}
fn default_products_endpoint() -> String {
    "/V1/products".to_string()
}
fn default_token_endpoint() -> String {
    "/V1/integration/admin/token".to_string()
}

/// Where pipeline artifacts live. Each file defaults to a path under
/// `data_dir` and can be overridden individually.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub state_file: Option<PathBuf>,
    #[serde(default)]
    pub dataset_file: Option<PathBuf>,
    #[serde(default)]
    pub raw_file: Option<PathBuf>,
    #[serde(default)]
    pub index_file: Option<PathBuf>,
    #[serde(default)]
    pub metadata_file: Option<PathBuf>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            state_file: None,
            dataset_file: None,
            raw_file: None,
            index_file: None,
            metadata_file: None,
        }
    }
}

impl StorageConfig {
    fn resolve(&self, explicit: &Option<PathBuf>, relative: &str) -> PathBuf {
        explicit
            .clone()
            .unwrap_or_else(|| self.data_dir.join(relative))
    }

    pub fn state_path(&self) -> PathBuf {
        self.resolve(&self.state_file, "state.json")
    }

    pub fn dataset_path(&self) -> PathBuf {
        self.resolve(&self.dataset_file, "processed/products.json")
    }

    pub fn raw_path(&self) -> PathBuf {
        self.resolve(&self.raw_file, "raw/products_full.json")
    }

    pub fn index_path(&self) -> PathBuf {
        self.resolve(&self.index_file, "embeddings/product_index.bin")
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.resolve(&self.metadata_file, "embeddings/product_metadata.json")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DocumentsConfig {
    #[serde(default = "default_documents_root")]
    pub root: PathBuf,
    #[serde(default = "default_document_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub output: Option<PathBuf>,
}

fn default_documents_root() -> PathBuf {
    PathBuf::from("./data/manuals")
}

fn default_document_globs() -> Vec<String> {
    vec!["**/*.pdf".to_string(), "**/*.PDF".to_string()]
}

impl Default for DocumentsConfig {
    fn default() -> Self {
        Self {
            root: default_documents_root(),
            include_globs: default_document_globs(),
            exclude_globs: Vec::new(),
            output: None,
        }
    }
}

impl Config {
    /// Output path for extracted manual specs.
    pub fn specs_output_path(&self) -> PathBuf {
        self.documents
            .output
            .clone()
            .unwrap_or_else(|| self.storage.data_dir.join("processed/product_specs.json"))
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate upstream
    if config.upstream.base_url.trim().is_empty() {
        anyhow::bail!("upstream.base_url must not be empty");
    }
    if config.upstream.page_size == 0 {
        anyhow::bail!("upstream.page_size must be > 0");
    }

    // Validate embedding
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }

    Ok(config)
}
