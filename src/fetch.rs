//! Delta fetching: paginated retrieval of records changed since a watermark.
//!
//! Pages are requested strictly one at a time with a fixed delay between
//! them. Paging stops at the first short or empty page. A rejected
//! credential earns exactly one re-authentication and retry of the same
//! page; every other failure is fatal for the run.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::client::{CatalogSource, Page, PageQuery};
use crate::config::UpstreamConfig;
use crate::error::{FetchError, PipelineError};
use crate::models::RawRecord;
use crate::progress::{SyncProgressEvent, SyncProgressReporter};

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub page_size: usize,
    /// Pause between consecutive page requests.
    pub page_delay: Duration,
}

impl FetchOptions {
    pub fn from_config(config: &UpstreamConfig, page_size_override: Option<usize>) -> Self {
        Self {
            page_size: page_size_override.unwrap_or(config.page_size),
            page_delay: Duration::from_millis(config.page_delay_ms),
        }
    }
}

/// Fetch every record updated strictly after `watermark`.
///
/// `None` fetches the whole catalog (full pull). Records whose `updated_at`
/// is present and not after the watermark are dropped even if the upstream
/// returned them; records without a parseable `updated_at` are kept.
pub async fn fetch_since(
    source: &mut dyn CatalogSource,
    watermark: Option<DateTime<Utc>>,
    options: &FetchOptions,
    progress: &dyn SyncProgressReporter,
) -> Result<Vec<RawRecord>> {
    if options.page_size == 0 {
        anyhow::bail!("page size must be > 0");
    }

    let mut records: Vec<RawRecord> = Vec::new();
    let mut previous_skus: Vec<String> = Vec::new();
    let mut page = 1usize;

    loop {
        let query = PageQuery {
            page,
            page_size: options.page_size,
            updated_after: watermark,
        };
        let batch = fetch_page_with_reauth(source, &query).await?;
        // Length as upstream sent it; malformed items still fill the page.
        let upstream_len = batch.raw_len;

        if upstream_len == 0 {
            debug!(page, "empty page, stopping");
            break;
        }
        if batch.records.len() < upstream_len {
            warn!(
                page,
                skipped = upstream_len - batch.records.len(),
                "page contained non-record items"
            );
        }

        // The catalog answers a page number past the end with the last page again.
        let skus: Vec<String> = batch
            .records
            .iter()
            .map(|r| r.sku().unwrap_or_default().to_string())
            .collect();
        if page > 1 && !skus.is_empty() && skus == previous_skus {
            debug!(page, "page repeats the previous one, stopping");
            break;
        }
        previous_skus = skus;

        records.extend(batch.records);
        progress.report(SyncProgressEvent::Fetching {
            page,
            records: records.len() as u64,
        });

        if upstream_len < options.page_size {
            break;
        }

        page += 1;
        if !options.page_delay.is_zero() {
            tokio::time::sleep(options.page_delay).await;
        }
    }

    if let Some(wm) = watermark {
        let before = records.len();
        records.retain(|r| r.updated_at().map_or(true, |ts| ts > wm));
        if records.len() < before {
            debug!(
                dropped = before - records.len(),
                "dropped records not newer than the watermark"
            );
        }
    }

    Ok(records)
}

async fn fetch_page_with_reauth(
    source: &mut dyn CatalogSource,
    query: &PageQuery,
) -> Result<Page> {
    match source.fetch_page(query).await {
        Err(FetchError::Unauthorized(_)) => {
            warn!(page = query.page, "upstream credential rejected, re-authenticating");
            source
                .reauthenticate()
                .await
                .context("Re-authentication with the upstream catalog failed")?;
            // A second rejection of the same page is final.
            classify(source.fetch_page(query).await, query)
        }
        other => classify(other, query),
    }
}

fn classify(result: Result<Page, FetchError>, query: &PageQuery) -> Result<Page> {
    match result {
        Ok(page) => Ok(page),
        Err(FetchError::Status { status, body }) => {
            Err(PipelineError::Upstream { status, body }.into())
        }
        Err(FetchError::Unauthorized(body)) => Err(PipelineError::AuthenticationFailed(body).into()),
        Err(e) => Err(anyhow::Error::new(e))
            .with_context(|| format!("Failed to fetch upstream page {}", query.page)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::{json, Value};
    use std::collections::VecDeque;

    fn raw(value: Value) -> RawRecord {
        match value {
            Value::Object(map) => RawRecord::new(map),
            _ => panic!("test record must be an object"),
        }
    }

    fn records(skus: &[&str]) -> Vec<RawRecord> {
        skus.iter()
            .map(|s| raw(json!({"sku": s, "updated_at": "2025-03-01T00:00:00"})))
            .collect()
    }

    /// Replays a fixed script of page responses.
    struct ScriptedSource {
        responses: VecDeque<Result<Vec<RawRecord>, FetchError>>,
        queries: Vec<PageQuery>,
        reauths: usize,
    }

    impl ScriptedSource {
        fn new(responses: Vec<Result<Vec<RawRecord>, FetchError>>) -> Self {
            Self {
                responses: responses.into(),
                queries: Vec::new(),
                reauths: 0,
            }
        }
    }

    #[async_trait]
    impl CatalogSource for ScriptedSource {
        async fn fetch_page(&mut self, query: &PageQuery) -> Result<Page, FetchError> {
            self.queries.push(query.clone());
            self.responses
                .pop_front()
                .unwrap_or(Ok(Vec::new()))
                .map(Page::from)
        }

        async fn reauthenticate(&mut self) -> Result<()> {
            self.reauths += 1;
            Ok(())
        }
    }

    fn opts(page_size: usize) -> FetchOptions {
        FetchOptions {
            page_size,
            page_delay: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn stops_on_short_page() {
        let mut src = ScriptedSource::new(vec![
            Ok(records(&["A", "B"])),
            Ok(records(&["C"])),
            Ok(records(&["never"])),
        ]);
        let got = fetch_since(&mut src, None, &opts(2), &NoProgress).await.unwrap();
        assert_eq!(got.len(), 3);
        let pages: Vec<usize> = src.queries.iter().map(|q| q.page).collect();
        assert_eq!(pages, vec![1, 2]);
    }

    #[tokio::test]
    async fn stops_on_empty_page() {
        let mut src = ScriptedSource::new(vec![Ok(records(&["A", "B"])), Ok(vec![])]);
        let got = fetch_since(&mut src, None, &opts(2), &NoProgress).await.unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(src.queries.len(), 2);
    }

    #[tokio::test]
    async fn stops_when_upstream_repeats_last_page() {
        let mut src = ScriptedSource::new(vec![
            Ok(records(&["A", "B"])),
            Ok(records(&["A", "B"])),
        ]);
        let got = fetch_since(&mut src, None, &opts(2), &NoProgress).await.unwrap();
        assert_eq!(got.len(), 2);
    }

    #[tokio::test]
    async fn passes_watermark_filter_and_drops_stale_records() {
        let wm = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();
        let mut src = ScriptedSource::new(vec![Ok(vec![
            raw(json!({"sku": "old", "updated_at": "2025-01-15T00:00:00"})),
            raw(json!({"sku": "same", "updated_at": "2025-02-01T00:00:00"})),
            raw(json!({"sku": "new", "updated_at": "2025-02-02 08:00:00"})),
            raw(json!({"sku": "undated"})),
        ])]);
        let got = fetch_since(&mut src, Some(wm), &opts(10), &NoProgress)
            .await
            .unwrap();
        let skus: Vec<_> = got.iter().map(|r| r.sku().unwrap()).collect();
        assert_eq!(skus, vec!["new", "undated"]);
        assert_eq!(src.queries[0].updated_after, Some(wm));
    }

    #[tokio::test]
    async fn single_reauth_then_same_page_retried() {
        let mut src = ScriptedSource::new(vec![
            Ok(records(&["A", "B"])),
            Err(FetchError::Unauthorized("expired".into())),
            Ok(records(&["C"])),
        ]);
        let got = fetch_since(&mut src, None, &opts(2), &NoProgress).await.unwrap();
        assert_eq!(got.len(), 3);
        assert_eq!(src.reauths, 1);
        let pages: Vec<usize> = src.queries.iter().map(|q| q.page).collect();
        assert_eq!(pages, vec![1, 2, 2]);
    }

    #[tokio::test]
    async fn second_rejection_is_fatal() {
        let mut src = ScriptedSource::new(vec![
            Err(FetchError::Unauthorized("expired".into())),
            Err(FetchError::Unauthorized("still expired".into())),
        ]);
        let err = fetch_since(&mut src, None, &opts(2), &NoProgress)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::AuthenticationFailed(_))
        ));
        assert_eq!(src.reauths, 1);
    }

    #[tokio::test]
    async fn other_status_is_fatal_without_reauth() {
        let mut src = ScriptedSource::new(vec![
            Ok(records(&["A", "B"])),
            Err(FetchError::Status {
                status: 500,
                body: "boom".into(),
            }),
        ]);
        let err = fetch_since(&mut src, None, &opts(2), &NoProgress)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Upstream { status: 500, .. })
        ));
        assert_eq!(src.reauths, 0);
    }

    /// Serves raw JSON listing bodies through the client's page parser.
    struct JsonPages {
        bodies: VecDeque<Value>,
        queries: usize,
    }

    #[async_trait]
    impl CatalogSource for JsonPages {
        async fn fetch_page(&mut self, _query: &PageQuery) -> Result<Page, FetchError> {
            self.queries += 1;
            match self.bodies.pop_front() {
                Some(body) => crate::client::parse_page(&body),
                None => Ok(Page::default()),
            }
        }

        async fn reauthenticate(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn malformed_item_does_not_shorten_the_page() {
        let mut src = JsonPages {
            bodies: VecDeque::from(vec![
                json!({"items": [{"sku": "A"}, "junk"]}),
                json!({"items": [{"sku": "B"}, {"sku": "C"}]}),
                json!({"items": [{"sku": "D"}]}),
            ]),
            queries: 0,
        };
        let got = fetch_since(&mut src, None, &opts(2), &NoProgress).await.unwrap();
        let skus: Vec<_> = got.iter().map(|r| r.sku().unwrap()).collect();
        assert_eq!(skus, vec!["A", "B", "C", "D"]);
        assert_eq!(src.queries, 3);
    }

    #[tokio::test]
    async fn page_of_only_junk_keeps_paging() {
        let mut src = JsonPages {
            bodies: VecDeque::from(vec![
                json!({"items": [null, 7]}),
                json!({"items": [{"sku": "A"}]}),
            ]),
            queries: 0,
        };
        let got = fetch_since(&mut src, None, &opts(2), &NoProgress).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(src.queries, 2);
    }

    #[tokio::test]
    async fn fractional_watermark_drops_the_record_it_came_from() {
        let wm = crate::models::parse_timestamp("2025-02-03T10:00:00.5").unwrap();
        let mut src = ScriptedSource::new(vec![Ok(vec![
            raw(json!({"sku": "seen", "updated_at": "2025-02-03T10:00:00.5"})),
            raw(json!({"sku": "later", "updated_at": "2025-02-03T10:00:00.75"})),
        ])]);
        let got = fetch_since(&mut src, Some(wm), &opts(10), &NoProgress)
            .await
            .unwrap();
        let skus: Vec<_> = got.iter().map(|r| r.sku().unwrap()).collect();
        assert_eq!(skus, vec!["later"]);
    }

    #[tokio::test]
    async fn zero_page_size_rejected() {
        let mut src = ScriptedSource::new(vec![]);
        assert!(fetch_since(&mut src, None, &opts(0), &NoProgress).await.is_err());
        assert!(src.queries.is_empty());
    }

    #[tokio::test]
    async fn waits_between_pages() {
        let mut src = ScriptedSource::new(vec![
            Ok(records(&["A"])),
            Ok(records(&["B"])),
            Ok(vec![]),
        ]);
        let options = FetchOptions {
            page_size: 1,
            page_delay: Duration::from_millis(20),
        };
        let start = std::time::Instant::now();
        fetch_since(&mut src, None, &options, &NoProgress).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(40));
    }
}
