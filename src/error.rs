//! Fatal error taxonomy for a pipeline run.
//!
//! Command functions return [`anyhow::Result`]; the variants here are raised
//! inside that `anyhow::Error` so callers can classify a failure with
//! `err.downcast_ref::<PipelineError>()`. Every variant aborts the run
//! before the watermark is written.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The upstream rejected our credentials twice in a row.
    #[error("upstream authentication failed after re-authenticating: {0}")]
    AuthenticationFailed(String),

    /// Any non-2xx upstream response other than an expired credential.
    #[error("upstream request failed (HTTP {status}): {body}")]
    Upstream { status: u16, body: String },

    /// A prerequisite artifact does not exist.
    #[error("{what} not found at {}", path.display())]
    MissingArtifact { what: &'static str, path: PathBuf },

    /// Vector count and metadata length disagree.
    #[error("index integrity violation: {vectors} vectors but {metadata} metadata entries")]
    Integrity { vectors: usize, metadata: usize },

    #[error("vector index file is corrupt: {0}")]
    CorruptIndex(String),

    #[error("embedding dimension mismatch: index has {expected}, provider returned {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Failure of a single upstream page request.
///
/// Kept separate from [`PipelineError`] because `Unauthorized` is the one
/// case the fetcher recovers from locally.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("credential rejected (HTTP 401): {0}")]
    Unauthorized(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed response: {0}")]
    Decode(String),
}
