//! Text → vector providers behind the [`EmbeddingProvider`] trait.
//!
//! | `embedding.provider` | Backend |
//! |----------------------|---------|
//! | `disabled` | [`DisabledProvider`], every call fails |
//! | `openai` | [`OpenAIProvider`], `POST /v1/embeddings` |
//! | `ollama` | [`OllamaProvider`], `POST {url}/api/embed` |
//! | `local` | `LocalProvider` via fastembed (feature `local-embeddings-fastembed`) |
//!
//! The HTTP providers share one retry loop: 429, 5xx, and transport errors
//! are retried with exponential backoff (1s, 2s, 4s, ... capped at 32s);
//! any other non-success status fails at once.
//!
//! The vector helpers the index is built on live here too.
//!
//! ```rust,no_run
//! # use catalog_sync::config::EmbeddingConfig;
//! # use catalog_sync::embedding::{create_provider, EmbeddingProvider};
//! let provider = create_provider(&EmbeddingConfig::default()).unwrap();
//! assert_eq!(provider.model_name(), "disabled");
//! ```

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::EmbeddingConfig;
use crate::models::Product;

/// A text → vector function.
///
/// Output order must match input order; the index assigns metadata
/// ordinals from it.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model_name(&self) -> &str;
    fn dims(&self) -> usize;
    /// One vector per text, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed a single query text.
pub async fn embed_query(provider: &dyn EmbeddingProvider, text: &str) -> Result<Vec<f32>> {
    provider
        .embed(&[text.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("{} returned no vector for the query", provider.model_name()))
}

pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("Embedding provider is disabled; set [embedding] provider in the config")
    }
}

// ============ HTTP transport ============

/// Model name and dimensionality, both mandatory for remote providers.
fn remote_model(config: &EmbeddingConfig, backend: &str) -> Result<(String, usize)> {
    let model = config
        .model
        .clone()
        .with_context(|| format!("embedding.model required for the {} provider", backend))?;
    let dims = config
        .dims
        .with_context(|| format!("embedding.dims required for the {} provider", backend))?;
    Ok((model, dims))
}

/// JSON-over-HTTP with the shared retry policy.
struct RetryingTransport {
    http: reqwest::Client,
    max_retries: u32,
    backend: &'static str,
}

impl RetryingTransport {
    fn new(config: &EmbeddingConfig, backend: &'static str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            max_retries: config.max_retries,
            backend,
        })
    }

    /// POST `body` to `url` and return the decoded JSON response.
    async fn post(&self, url: &str, bearer: Option<&str>, body: &Value) -> Result<Value> {
        let mut last_err = anyhow!("{} request was never attempted", self.backend);

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = backoff(attempt);
                warn!(backend = self.backend, attempt, ?delay, error = %last_err, "retrying embedding request");
                tokio::time::sleep(delay).await;
            }

            let mut request = self.http.post(url).json(body);
            if let Some(token) = bearer {
                request = request.bearer_auth(token);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    last_err = anyhow!("{} unreachable at {}: {}", self.backend, url, e);
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                debug!(backend = self.backend, attempt, "embedding request succeeded");
                return Ok(response.json().await?);
            }

            let text = response.text().await.unwrap_or_default();
            let err = anyhow!("{} API error {}: {}", self.backend, status, text);
            if status.as_u16() == 429 || status.is_server_error() {
                last_err = err;
                continue;
            }
            return Err(err);
        }

        Err(last_err.context(format!(
            "{} embedding failed after {} retries",
            self.backend, self.max_retries
        )))
    }
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1 << (attempt - 1).min(5))
}

/// A JSON array of numbers. `None` if any component is not a number.
fn float_array(value: &Value) -> Option<Vec<f32>> {
    value
        .as_array()?
        .iter()
        .map(|x| x.as_f64().map(|f| f as f32))
        .collect()
}

// ============ OpenAI ============

/// OpenAI embeddings API. Reads `OPENAI_API_KEY`.
pub struct OpenAIProvider {
    model: String,
    dims: usize,
    api_key: String,
    transport: RetryingTransport,
}

impl OpenAIProvider {
    const ENDPOINT: &'static str = "https://api.openai.com/v1/embeddings";

    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let (model, dims) = remote_model(config, "OpenAI")?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .context("OPENAI_API_KEY environment variable not set")?;
        Ok(Self {
            model,
            dims,
            api_key,
            transport: RetryingTransport::new(config, "OpenAI")?,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = json!({ "model": self.model, "input": texts });
        let response = self
            .transport
            .post(Self::ENDPOINT, Some(&self.api_key), &body)
            .await?;
        parse_openai_response(&response)
    }
}

/// `data[].embedding`, reordered by each item's `index`.
fn parse_openai_response(json: &Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(Value::as_array)
        .context("OpenAI response has no `data` array")?;

    let mut indexed = data
        .iter()
        .enumerate()
        .map(|(pos, item)| {
            let index = item
                .get("index")
                .and_then(Value::as_u64)
                .map_or(pos, |i| i as usize);
            item.get("embedding")
                .and_then(float_array)
                .map(|v| (index, v))
                .with_context(|| format!("OpenAI response item {} has no embedding", pos))
        })
        .collect::<Result<Vec<_>>>()?;

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama ============

/// A running Ollama instance (`ollama pull <model>` first).
pub struct OllamaProvider {
    model: String,
    dims: usize,
    endpoint: String,
    transport: RetryingTransport,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let (model, dims) = remote_model(config, "Ollama")?;
        let base = config.url.as_deref().unwrap_or("http://localhost:11434");
        Ok(Self {
            model,
            dims,
            endpoint: format!("{}/api/embed", base.trim_end_matches('/')),
            transport: RetryingTransport::new(config, "Ollama")?,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = json!({ "model": self.model, "input": texts });
        let response = self.transport.post(&self.endpoint, None, &body).await?;
        parse_ollama_response(&response)
    }
}

fn parse_ollama_response(json: &Value) -> Result<Vec<Vec<f32>>> {
    json.get("embeddings")
        .and_then(Value::as_array)
        .context("Ollama response has no `embeddings` array")?
        .iter()
        .map(|e| float_array(e).context("Ollama embedding is not a numeric array"))
        .collect()
}

// ============ Local (fastembed) ============

/// Supported local models and their output dimensionality.
#[cfg(feature = "local-embeddings-fastembed")]
const LOCAL_MODELS: &[(&str, usize)] = &[
    ("all-minilm-l6-v2", 384),
    ("bge-small-en-v1.5", 384),
    ("bge-base-en-v1.5", 768),
    ("bge-large-en-v1.5", 1024),
    ("nomic-embed-text-v1.5", 768),
    ("multilingual-e5-small", 384),
    ("multilingual-e5-base", 768),
    ("multilingual-e5-large", 1024),
];

#[cfg(feature = "local-embeddings-fastembed")]
fn fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    use fastembed::EmbeddingModel as M;
    Ok(match name {
        "all-minilm-l6-v2" => M::AllMiniLML6V2,
        "bge-small-en-v1.5" => M::BGESmallENV15,
        "bge-base-en-v1.5" => M::BGEBaseENV15,
        "bge-large-en-v1.5" => M::BGELargeENV15,
        "nomic-embed-text-v1.5" => M::NomicEmbedTextV15,
        "multilingual-e5-small" => M::MultilingualE5Small,
        "multilingual-e5-base" => M::MultilingualE5Base,
        "multilingual-e5-large" => M::MultilingualE5Large,
        other => bail!("Unknown local embedding model: '{}'", other),
    })
}

/// In-process inference. The model is downloaded on first use and kept
/// loaded for the rest of the run.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalProvider {
    model_name: String,
    dims: usize,
    batch_size: usize,
    model: std::sync::Arc<std::sync::Mutex<Option<fastembed::TextEmbedding>>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
        let native_dims = LOCAL_MODELS
            .iter()
            .find(|(name, _)| *name == model_name)
            .map(|(_, dims)| *dims)
            .with_context(|| format!("Unknown local embedding model: '{}'", model_name))?;
        Ok(Self {
            dims: config.dims.unwrap_or(native_dims),
            model_name,
            batch_size: config.batch_size,
            model: Default::default(),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl EmbeddingProvider for LocalProvider {
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let slot = self.model.clone();
        let name = self.model_name.clone();
        let batch_size = self.batch_size;
        let texts = texts.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut guard = slot
                .lock()
                .map_err(|_| anyhow!("local embedding model lock poisoned"))?;
            if guard.is_none() {
                let options = fastembed::InitOptions::new(fastembed_model(&name)?)
                    .with_show_download_progress(false);
                let loaded = fastembed::TextEmbedding::try_new(options)
                    .map_err(|e| anyhow!("Failed to load local model {}: {}", name, e))?;
                *guard = Some(loaded);
            }
            let model = guard
                .as_mut()
                .ok_or_else(|| anyhow!("local embedding model not loaded"))?;
            model
                .embed(texts, Some(batch_size))
                .map_err(|e| anyhow!("Local embedding failed: {}", e))
        })
        .await?
    }
}

/// Build the provider named by `embedding.provider`.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>> {
    Ok(match config.provider.as_str() {
        "disabled" => Box::new(DisabledProvider),
        "openai" => Box::new(OpenAIProvider::new(config)?),
        "ollama" => Box::new(OllamaProvider::new(config)?),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Box::new(LocalProvider::new(config)?),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings-fastembed"),
        other => bail!("Unknown embedding provider: {}", other),
    })
}

/// The text a product is embedded from:
/// `name. description. features. dimensions. capacity`, absent parts skipped.
///
/// Falls back to the SKU when every part is absent so the model never sees
/// an empty input.
pub fn build_text(product: &Product) -> String {
    let parts: Vec<String> = [
        product.name.clone(),
        product.description.clone(),
        product.features.clone(),
        product.dimensions.as_ref().map(|d| d.to_string()),
        product.capacity.as_ref().map(|c| c.to_string()),
    ]
    .into_iter()
    .flatten()
    .map(|s| s.trim().trim_end_matches('.').to_string())
    .filter(|s| !s.is_empty())
    .collect();

    if parts.is_empty() {
        product.sku.clone()
    } else {
        parts.join(". ")
    }
}

/// Scale `vec` to unit length in place. A zero vector is left as is.
pub fn normalize_l2(vec: &mut [f32]) {
    let norm = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in vec.iter_mut() {
            *x /= norm;
        }
    }
}

/// Encode a float vector as little-endian f32 bytes.
///
/// ```rust
/// use catalog_sync::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Decode bytes written by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .filter_map(|chunk| <[u8; 4]>::try_from(chunk).ok().map(f32::from_le_bytes))
        .collect()
}
