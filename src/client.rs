//! Upstream catalog API client.
//!
//! A thin wrapper over the catalog's REST API: admin-token authentication
//! and paginated product listing. Pagination policy, retry budget, and rate
//! limiting live in [`crate::fetch`]; this module only turns one page request
//! into one HTTP exchange.
//!
//! # Environment Variables
//!
//! - `CATALOG_API_USERNAME` (required)
//! - `CATALOG_API_PASSWORD` (required)
//!
//! # Request shape
//!
//! ```text
//! GET {base_url}/V1/products
//!     ?searchCriteria[currentPage]=1
//!     &searchCriteria[pageSize]=100
//!     &searchCriteria[filter_groups][0][filters][0][field]=updated_at
//!     &searchCriteria[filter_groups][0][filters][0][value]=2025-01-01T00:00:00
//!     &searchCriteria[filter_groups][0][filters][0][condition_type]=gt
//! ```

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::UpstreamConfig;
use crate::error::{FetchError, PipelineError};
use crate::models::RawRecord;

/// One page request against the upstream catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct PageQuery {
    /// 1-based page number.
    pub page: usize,
    pub page_size: usize,
    /// Only records with `updated_at` strictly after this instant.
    pub updated_after: Option<DateTime<Utc>>,
}

impl PageQuery {
    /// Query-string parameters in the catalog API's `searchCriteria` syntax.
    pub fn params(&self) -> Vec<(String, String)> {
        let mut params = vec![
            (
                "searchCriteria[currentPage]".to_string(),
                self.page.to_string(),
            ),
            (
                "searchCriteria[pageSize]".to_string(),
                self.page_size.to_string(),
            ),
        ];
        if let Some(ts) = self.updated_after {
            let filter = "searchCriteria[filter_groups][0][filters][0]";
            params.push((format!("{}[field]", filter), "updated_at".to_string()));
            // The catalog compares whole seconds. Filtering on the floor returns
            // a superset; the fetcher drops what is not strictly newer.
            let value = ts.format("%Y-%m-%dT%H:%M:%S").to_string();
            params.push((format!("{}[value]", filter), value));
            params.push((format!("{}[condition_type]", filter), "gt".to_string()));
        }
        params
    }
}

/// One page as the upstream answered it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    /// Object items, in upstream order.
    pub records: Vec<RawRecord>,
    /// Items upstream returned, counting the ones that were not objects.
    /// Paging decisions use this, not `records.len()`.
    pub raw_len: usize,
}

impl From<Vec<RawRecord>> for Page {
    fn from(records: Vec<RawRecord>) -> Self {
        Self {
            raw_len: records.len(),
            records,
        }
    }
}

/// A paginated source of upstream product records.
///
/// [`CatalogClient`] is the HTTP implementation; tests substitute an
/// in-memory source.
#[async_trait]
pub trait CatalogSource: Send {
    /// Fetch a single page. An expired credential must surface as
    /// [`FetchError::Unauthorized`] so the caller can re-authenticate.
    async fn fetch_page(&mut self, query: &PageQuery) -> Result<Page, FetchError>;

    /// Obtain a fresh credential.
    async fn reauthenticate(&mut self) -> Result<()>;
}

/// Admin credentials for the catalog API.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn from_env() -> Result<Self> {
        let username = std::env::var("CATALOG_API_USERNAME")
            .context("CATALOG_API_USERNAME environment variable not set")?;
        let password = std::env::var("CATALOG_API_PASSWORD")
            .context("CATALOG_API_PASSWORD environment variable not set")?;
        Ok(Self { username, password })
    }
}

/// HTTP client for the upstream catalog, authenticated with a bearer token.
pub struct CatalogClient {
    http: reqwest::Client,
    base_url: String,
    products_endpoint: String,
    token_endpoint: String,
    credentials: Credentials,
    token: String,
}

impl CatalogClient {
    /// Build a client from config and environment credentials, and obtain
    /// the initial token.
    pub async fn connect(config: &UpstreamConfig) -> Result<Self> {
        Self::connect_with(config, Credentials::from_env()?).await
    }

    pub async fn connect_with(config: &UpstreamConfig, credentials: Credentials) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        let mut client = Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            products_endpoint: config.products_endpoint.clone(),
            token_endpoint: config.token_endpoint.clone(),
            credentials,
            token: String::new(),
        };
        client.token = client.request_token().await?;
        Ok(client)
    }

    async fn request_token(&self) -> Result<String> {
        let url = format!("{}{}", self.base_url, self.token_endpoint);
        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({
                "username": self.credentials.username,
                "password": self.credentials.password,
            }))
            .send()
            .await
            .with_context(|| format!("Token request to {} failed", url))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PipelineError::Upstream {
                status: status.as_u16(),
                body: truncate(&body),
            }
            .into());
        }

        let token: String = resp
            .json()
            .await
            .context("Token response was not a JSON string")?;
        debug!("obtained upstream token");
        Ok(token)
    }
}

#[async_trait]
impl CatalogSource for CatalogClient {
    async fn fetch_page(&mut self, query: &PageQuery) -> Result<Page, FetchError> {
        let url = format!("{}{}", self.base_url, self.products_endpoint);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .header("Content-Type", "application/json")
            .query(&query.params())
            .send()
            .await?;

        let status = resp.status();
        if status.as_u16() == 401 {
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::Unauthorized(truncate(&body)));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::Status {
                status: status.as_u16(),
                body: truncate(&body),
            });
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))?;
        parse_page(&json)
    }

    async fn reauthenticate(&mut self) -> Result<()> {
        self.token = self.request_token().await?;
        Ok(())
    }
}

/// Extract the `items` array from a listing response.
///
/// A missing or null `items` is an empty page. A non-object item is skipped
/// with a warning but still counts toward the page length.
pub(crate) fn parse_page(json: &Value) -> Result<Page, FetchError> {
    let items = match json.get("items") {
        None | Some(Value::Null) => return Ok(Page::default()),
        Some(Value::Array(items)) => items,
        Some(_) => {
            return Err(FetchError::Decode(
                "`items` is not an array".to_string(),
            ))
        }
    };

    let mut records = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::Object(fields) => records.push(RawRecord::new(fields.clone())),
            other => warn!(item = %other, "skipping non-object item in upstream page"),
        }
    }
    Ok(Page {
        records,
        raw_len: items.len(),
    })
}

fn truncate(body: &str) -> String {
    body.chars().take(500).collect()
}
