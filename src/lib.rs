//! # catalog-sync
//!
//! Incremental product catalog pipeline: keeps a canonical product dataset
//! and a semantic vector index in sync with an upstream catalog API.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────┐   ┌───────────┐   ┌─────────┐   ┌──────────────┐
//! │ Watermark │──▶│  Fetch   │──▶│  Flatten  │──▶│  Merge  │──▶│ Index + meta │
//! │ state.json│   │ paginated│   │ normalize │   │ by SKU  │   │ append-only  │
//! └─────▲─────┘   └──────────┘   └───────────┘   └─────────┘   └──────┬───────┘
//!       └──────────────────── advanced only on full success ──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Raw records, typed products, timestamps |
//! | [`normalize`] | Free text → typed dimensions/capacity, attribute mapping |
//! | [`flatten`] | Parent/variant expansion with attribute inheritance |
//! | [`watermark`] | Persisted last-sync instant |
//! | [`client`] | Upstream catalog API client |
//! | [`fetch`] | Paginated delta fetching |
//! | [`merge`] | Canonical dataset and field-level merge |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Vector index, metadata sidecar, rebuild/refresh |
//! | [`search`] | Semantic product search |
//! | [`extract`] | PDF manual spec extraction |
//! | [`pipeline`] | Run orchestration |
//! | [`status`] | Health overview |
//! | [`storage`] | Atomic artifact persistence |
//! | [`progress`] | Progress reporting |
//! | [`config`] | TOML configuration |
//! | [`error`] | Fatal error taxonomy |

pub mod client;
pub mod config;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod flatten;
pub mod index;
pub mod merge;
pub mod models;
pub mod normalize;
pub mod pipeline;
pub mod progress;
pub mod search;
pub mod status;
pub mod storage;
pub mod watermark;
