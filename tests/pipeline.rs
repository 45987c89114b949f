//! End-to-end pipeline runs against an in-memory catalog and a
//! deterministic embedder.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;

use catalog_sync::client::{CatalogSource, Page, PageQuery};
use catalog_sync::config::StorageConfig;
use catalog_sync::embedding::EmbeddingProvider;
use catalog_sync::error::{FetchError, PipelineError};
use catalog_sync::fetch::FetchOptions;
use catalog_sync::index::{IndexMetadataEntry, ProductIndex};
use catalog_sync::merge::CanonicalDataset;
use catalog_sync::models::{Capacity, RawRecord};
use catalog_sync::pipeline::{self, IndexOutcome, RunContext};
use catalog_sync::progress::NoProgress;

// ============ Test doubles ============

/// Upstream catalog that filters and pages like the real API.
struct FakeCatalog {
    records: Vec<RawRecord>,
    /// Pages that carry one extra non-record item upstream.
    junk_pages: Vec<usize>,
    failures: HashMap<usize, VecDeque<FetchError>>,
    queries: Vec<PageQuery>,
    reauths: usize,
}

impl FakeCatalog {
    fn new(records: Vec<Value>) -> Self {
        Self {
            records: records.into_iter().map(raw).collect(),
            junk_pages: Vec::new(),
            failures: HashMap::new(),
            queries: Vec::new(),
            reauths: 0,
        }
    }

    fn push(&mut self, record: Value) {
        self.records.push(raw(record));
    }

    fn fail_page(&mut self, page: usize, error: FetchError) {
        self.failures.entry(page).or_default().push_back(error);
    }
}

#[async_trait]
impl CatalogSource for FakeCatalog {
    async fn fetch_page(&mut self, query: &PageQuery) -> Result<Page, FetchError> {
        self.queries.push(query.clone());
        if let Some(err) = self.failures.get_mut(&query.page).and_then(|q| q.pop_front()) {
            return Err(err);
        }
        let matching: Vec<RawRecord> = self
            .records
            .iter()
            .filter(|r| match (query.updated_after, r.updated_at()) {
                (Some(after), Some(ts)) => ts > after,
                _ => true,
            })
            .cloned()
            .collect();
        // A junk item takes one slot on its page.
        let junk = self.junk_pages.contains(&query.page);
        let slots = query.page_size - usize::from(junk);
        let start = (query.page - 1) * query.page_size
            - self.junk_pages.iter().filter(|&&p| p < query.page).count();
        let records: Vec<RawRecord> = matching.into_iter().skip(start).take(slots).collect();
        Ok(Page {
            raw_len: records.len() + usize::from(junk),
            records,
        })
    }

    async fn reauthenticate(&mut self) -> Result<()> {
        self.reauths += 1;
        Ok(())
    }
}

/// Deterministic bag-of-bytes embedder.
struct HashEmbedder {
    calls: AtomicUsize,
    texts: AtomicUsize,
}

impl HashEmbedder {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            texts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash"
    }
    fn dims(&self) -> usize {
        8
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.texts.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts
            .iter()
            .map(|t| {
                let mut v = vec![0.0f32; 8];
                for (i, b) in t.bytes().enumerate() {
                    v[(i + b as usize) % 8] += 1.0;
                }
                v
            })
            .collect())
    }
}

// ============ Helpers ============

fn raw(value: Value) -> RawRecord {
    match value {
        Value::Object(map) => RawRecord::new(map),
        _ => panic!("test record must be an object"),
    }
}

fn context(tmp: &TempDir) -> RunContext {
    RunContext {
        storage: StorageConfig {
            data_dir: tmp.path().join("data"),
            ..StorageConfig::default()
        },
        fetch: FetchOptions {
            page_size: 2,
            page_delay: Duration::ZERO,
        },
        batch_size: 2,
        progress: Box::new(NoProgress),
    }
}

fn metadata_skus(ctx: &RunContext) -> Vec<String> {
    let raw = fs::read_to_string(ctx.storage.metadata_path()).unwrap();
    let entries: Vec<IndexMetadataEntry> = serde_json::from_str(&raw).unwrap();
    entries.into_iter().map(|e| e.sku).collect()
}

fn state_json(ctx: &RunContext) -> Value {
    serde_json::from_str(&fs::read_to_string(ctx.storage.state_path()).unwrap()).unwrap()
}

fn artifacts(ctx: &RunContext) -> Vec<Vec<u8>> {
    [
        ctx.storage.dataset_path(),
        ctx.storage.index_path(),
        ctx.storage.metadata_path(),
        ctx.storage.state_path(),
    ]
    .iter()
    .map(|p| fs::read(p).unwrap())
    .collect()
}

// ============ Tests ============

#[tokio::test]
async fn first_sync_builds_everything_and_advances_watermark() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(&tmp);
    let mut upstream = FakeCatalog::new(vec![json!({
        "sku": "P1",
        "updated_at": "2025-01-01T00:00:00"
    })]);
    let embedder = HashEmbedder::new();

    let report = pipeline::delta_sync(&ctx, &mut upstream, Some(&embedder))
        .await
        .unwrap();

    assert_eq!(report.fetched, 1);
    assert_eq!(report.dataset_size, 1);
    assert_eq!(report.index, IndexOutcome::Rebuilt { vectors: 1 });

    let index = ProductIndex::load(&ctx.storage.index_path(), &ctx.storage.metadata_path())
        .unwrap()
        .unwrap();
    assert_eq!(index.index.len(), 1);
    assert_eq!(metadata_skus(&ctx), vec!["P1"]);
    assert_eq!(state_json(&ctx)["last_sync_date"], "2025-01-01T00:00:00");

    // The first query asks for everything after the epoch.
    assert_eq!(
        upstream.queries[0].updated_after.map(|ts| ts.timestamp()),
        Some(0)
    );
}

#[tokio::test]
async fn second_sync_without_changes_is_a_no_op() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(&tmp);
    let mut upstream = FakeCatalog::new(vec![
        json!({"sku": "A", "name": "Slide", "updated_at": "2025-01-01T00:00:00"}),
        json!({"sku": "B", "name": "Hinge", "updated_at": "2025-01-02T00:00:00"}),
        json!({"sku": "C", "name": "Handle", "updated_at": "2025-01-03T00:00:00"}),
    ]);
    let embedder = HashEmbedder::new();

    pipeline::delta_sync(&ctx, &mut upstream, Some(&embedder))
        .await
        .unwrap();
    let before = artifacts(&ctx);
    let texts_before = embedder.texts.load(Ordering::SeqCst);

    let report = pipeline::delta_sync(&ctx, &mut upstream, Some(&embedder))
        .await
        .unwrap();

    assert_eq!(report.fetched, 0);
    assert_eq!(report.index, IndexOutcome::Refreshed { appended: 0, total: 3 });
    assert_eq!(artifacts(&ctx), before);
    assert_eq!(embedder.texts.load(Ordering::SeqCst), texts_before);
}

#[tokio::test]
async fn later_sync_merges_fields_and_appends_only_new_skus() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(&tmp);
    let mut upstream = FakeCatalog::new(vec![json!({
        "sku": "A1",
        "name": "Foo",
        "weight": 5,
        "updated_at": "2025-01-01T00:00:00"
    })]);
    let embedder = HashEmbedder::new();
    pipeline::delta_sync(&ctx, &mut upstream, Some(&embedder))
        .await
        .unwrap();

    // Sparse update to A1 plus a brand-new product.
    upstream.push(json!({"sku": "A1", "name": "Foo2", "updated_at": "2025-02-01T00:00:00"}));
    upstream.push(json!({"sku": "B7", "name": "Bar", "updated_at": "2025-02-03T10:00:00"}));

    let report = pipeline::delta_sync(&ctx, &mut upstream, Some(&embedder))
        .await
        .unwrap();
    assert_eq!(report.merge.added, 1);
    assert_eq!(report.merge.updated, 1);
    assert_eq!(report.index, IndexOutcome::Refreshed { appended: 1, total: 2 });

    let dataset = CanonicalDataset::load(&ctx.storage.dataset_path()).unwrap();
    let a1 = dataset.get("A1").unwrap();
    assert_eq!(a1.name.as_deref(), Some("Foo2"));
    assert_eq!(a1.weight_kg, Some(5.0));

    assert_eq!(metadata_skus(&ctx), vec!["A1", "B7"]);
    assert_eq!(state_json(&ctx)["last_sync_date"], "2025-02-03T10:00:00");
}

#[tokio::test]
async fn variants_are_flattened_and_indexed() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(&tmp);
    let mut upstream = FakeCatalog::new(vec![json!({
        "sku": "DA4120",
        "name": "Drawer slide",
        "description": "Load rating 100 kg",
        "updated_at": "2025-03-01T00:00:00",
        "children": [
            {"sku": "DA4120-0040", "name": "Drawer slide 400"},
            {"sku": "DA4120-0050", "name": "Drawer slide 500", "description": "Capacity 50 kg"},
            "not a record"
        ]
    })]);
    let embedder = HashEmbedder::new();

    let report = pipeline::delta_sync(&ctx, &mut upstream, Some(&embedder))
        .await
        .unwrap();
    assert_eq!(report.flattened, 3);
    assert_eq!(metadata_skus(&ctx), vec!["DA4120", "DA4120-0040", "DA4120-0050"]);

    let dataset = CanonicalDataset::load(&ctx.storage.dataset_path()).unwrap();
    let inherited = dataset.get("DA4120-0040").unwrap();
    assert!(inherited.is_variant);
    assert_eq!(inherited.parent_sku.as_deref(), Some("DA4120"));
    assert_eq!(
        inherited.capacity,
        Some(Capacity::Scalar {
            value: 100.0,
            unit: "kg".into()
        })
    );
    let own = dataset.get("DA4120-0050").unwrap();
    assert_eq!(
        own.capacity,
        Some(Capacity::Scalar {
            value: 50.0,
            unit: "kg".into()
        })
    );
}

#[tokio::test]
async fn expired_token_is_renewed_once() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(&tmp);
    let mut upstream = FakeCatalog::new(vec![
        json!({"sku": "A", "updated_at": "2025-01-01T00:00:00"}),
        json!({"sku": "B", "updated_at": "2025-01-01T00:00:00"}),
        json!({"sku": "C", "updated_at": "2025-01-05T00:00:00"}),
    ]);
    upstream.fail_page(2, FetchError::Unauthorized("token expired".into()));
    let embedder = HashEmbedder::new();

    let report = pipeline::delta_sync(&ctx, &mut upstream, Some(&embedder))
        .await
        .unwrap();
    assert_eq!(report.fetched, 3);
    assert_eq!(upstream.reauths, 1);
    assert_eq!(state_json(&ctx)["last_sync_date"], "2025-01-05T00:00:00");
}

#[tokio::test]
async fn repeated_rejection_is_fatal_and_persists_nothing() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(&tmp);
    let mut upstream = FakeCatalog::new(vec![json!({"sku": "A"})]);
    upstream.fail_page(1, FetchError::Unauthorized("nope".into()));
    upstream.fail_page(1, FetchError::Unauthorized("still nope".into()));
    let embedder = HashEmbedder::new();

    let err = pipeline::delta_sync(&ctx, &mut upstream, Some(&embedder))
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::AuthenticationFailed(_))
    ));
    assert_eq!(upstream.reauths, 1);
    assert!(!ctx.storage.state_path().exists());
    assert!(!ctx.storage.dataset_path().exists());
}

#[tokio::test]
async fn upstream_error_leaves_previous_state_untouched() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(&tmp);
    let mut upstream = FakeCatalog::new(vec![json!({
        "sku": "A",
        "updated_at": "2025-01-01T00:00:00"
    })]);
    let embedder = HashEmbedder::new();
    pipeline::delta_sync(&ctx, &mut upstream, Some(&embedder))
        .await
        .unwrap();
    let before = artifacts(&ctx);

    upstream.push(json!({"sku": "B", "updated_at": "2025-06-01T00:00:00"}));
    upstream.fail_page(
        1,
        FetchError::Status {
            status: 503,
            body: "maintenance".into(),
        },
    );

    let err = pipeline::delta_sync(&ctx, &mut upstream, Some(&embedder))
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::Upstream { status: 503, .. })
    ));
    assert_eq!(upstream.reauths, 0);
    assert_eq!(artifacts(&ctx), before);

    // The next run picks up the same window.
    let report = pipeline::delta_sync(&ctx, &mut upstream, Some(&embedder))
        .await
        .unwrap();
    assert_eq!(report.fetched, 1);
    assert_eq!(metadata_skus(&ctx), vec!["A", "B"]);
}

#[tokio::test]
async fn malformed_item_does_not_cut_the_sync_short() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(&tmp);
    let mut upstream = FakeCatalog::new(vec![
        json!({"sku": "A", "updated_at": "2025-05-01T00:00:00"}),
        json!({"sku": "B", "updated_at": "2025-03-01T00:00:00"}),
        json!({"sku": "C", "updated_at": "2025-04-01T00:00:00"}),
    ]);
    upstream.junk_pages.push(1);
    let embedder = HashEmbedder::new();

    let report = pipeline::delta_sync(&ctx, &mut upstream, Some(&embedder))
        .await
        .unwrap();
    assert_eq!(report.fetched, 3);
    assert_eq!(metadata_skus(&ctx), vec!["A", "B", "C"]);
    assert_eq!(state_json(&ctx)["last_sync_date"], "2025-05-01T00:00:00");
}

#[tokio::test]
async fn half_written_index_aborts_before_fetching() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(&tmp);
    fs::create_dir_all(ctx.storage.metadata_path().parent().unwrap()).unwrap();
    fs::write(ctx.storage.metadata_path(), r#"[{"sku": "A", "name": ""}]"#).unwrap();
    let mut upstream = FakeCatalog::new(vec![json!({"sku": "A"})]);
    let embedder = HashEmbedder::new();

    let err = pipeline::delta_sync(&ctx, &mut upstream, Some(&embedder))
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::Integrity { vectors: 0, metadata: 1 })
    ));
    assert!(upstream.queries.is_empty());
}

#[tokio::test]
async fn sync_without_embeddings_skips_index() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(&tmp);
    let mut upstream = FakeCatalog::new(vec![json!({
        "sku": "A",
        "updated_at": "2025-04-01T08:30:00"
    })]);

    let report = pipeline::delta_sync(&ctx, &mut upstream, None).await.unwrap();
    assert_eq!(report.index, IndexOutcome::Skipped);
    assert!(!ctx.storage.index_path().exists());
    assert_eq!(state_json(&ctx)["last_sync_date"], "2025-04-01T08:30:00");
}

#[tokio::test]
async fn full_pull_snapshots_and_merges_only() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(&tmp);
    let mut upstream = FakeCatalog::new(vec![
        json!({"sku": "A", "updated_at": "2025-01-01T00:00:00"}),
        json!({"sku": "B", "updated_at": "2025-01-02T00:00:00"}),
        json!({"sku": "C", "updated_at": "2025-01-03T00:00:00"}),
    ]);

    let report = pipeline::full_pull(&ctx, &mut upstream).await.unwrap();
    assert_eq!(report.fetched, 3);
    assert_eq!(report.dataset_size, 3);
    assert!(upstream.queries.iter().all(|q| q.updated_after.is_none()));

    let snapshot: Vec<Value> =
        serde_json::from_str(&fs::read_to_string(ctx.storage.raw_path()).unwrap()).unwrap();
    assert_eq!(snapshot.len(), 3);
    assert!(!ctx.storage.state_path().exists());
    assert!(!ctx.storage.index_path().exists());
}

#[tokio::test]
async fn embed_refresh_requires_existing_index() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(&tmp);
    CanonicalDataset::default()
        .save(&ctx.storage.dataset_path())
        .unwrap();

    let err = pipeline::embed_refresh(&ctx, &HashEmbedder::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::MissingArtifact { what: "vector index", .. })
    ));
}

#[tokio::test]
async fn rebuild_then_refresh_keeps_alignment() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(&tmp);
    let mut upstream = FakeCatalog::new(vec![
        json!({"sku": "A", "updated_at": "2025-01-01T00:00:00"}),
        json!({"sku": "B", "updated_at": "2025-01-01T00:00:00"}),
    ]);
    let embedder = HashEmbedder::new();
    pipeline::full_pull(&ctx, &mut upstream).await.unwrap();

    let rebuilt = pipeline::embed_rebuild(&ctx, &embedder).await.unwrap();
    assert_eq!(rebuilt.total, 2);

    upstream.push(json!({"sku": "C", "updated_at": "2025-01-09T00:00:00"}));
    pipeline::full_pull(&ctx, &mut upstream).await.unwrap();
    let refreshed = pipeline::embed_refresh(&ctx, &embedder).await.unwrap();
    assert_eq!(refreshed.embedded, 1);
    assert_eq!(refreshed.total, 3);

    let index = ProductIndex::load(&ctx.storage.index_path(), &ctx.storage.metadata_path())
        .unwrap()
        .unwrap();
    index.verify().unwrap();
    assert_eq!(index.index.len(), index.metadata.len());

    // A full pull never moves the watermark.
    assert!(!ctx.storage.state_path().exists());
}
