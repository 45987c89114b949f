//! Progress reporting for `pull`, `sync`, and `embed`.
//!
//! Events go to **stderr** so the stdout summary stays parseable. The fetch
//! phase has no known total; the embed phase counts texts against the batch
//! being embedded.

use std::io::Write;

use serde::Serialize;

/// A single progress event.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "phase", rename_all = "lowercase")]
pub enum SyncProgressEvent {
    /// `page` pages received, `records` records so far.
    Fetching { page: usize, records: u64 },
    /// `n` of `total` texts embedded.
    Embedding { n: u64, total: u64 },
}

pub trait SyncProgressReporter: Send + Sync {
    fn report(&self, event: SyncProgressEvent);
}

/// Human-readable lines: `fetch  page 3  300 records`, `embed  1,200 / 5,000 products`.
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match event {
            SyncProgressEvent::Fetching { page, records } => {
                format!("fetch  page {}  {} records", page, format_number(records))
            }
            SyncProgressEvent::Embedding { n, total } => format!(
                "embed  {} / {} products",
                format_number(n),
                format_number(total)
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "{}", line);
        let _ = stderr.flush();
    }
}

/// One JSON object per line, e.g.
/// `{"event":"progress","phase":"embedding","n":64,"total":200}`.
pub struct JsonProgress;

#[derive(Serialize)]
struct JsonLine {
    event: &'static str,
    #[serde(flatten)]
    body: SyncProgressEvent,
}

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = JsonLine {
            event: "progress",
            body: event,
        };
        if let Ok(json) = serde_json::to_string(&line) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", json);
            let _ = stderr.flush();
        }
    }
}

pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

/// Thousands separators: `1234567` → `1,234,567`.
fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let lead = digits.len() % 3;
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (i + 3 - lead) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Progress mode for the CLI.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    #[default]
    Auto,
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Resolve `Auto` against the current stderr.
    pub fn resolve(self) -> Self {
        match self {
            ProgressMode::Auto if atty::is(atty::Stream::Stderr) => ProgressMode::Human,
            ProgressMode::Auto => ProgressMode::Off,
            other => other,
        }
    }

    pub fn reporter(self) -> Box<dyn SyncProgressReporter> {
        match self.resolve() {
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
            ProgressMode::Off | ProgressMode::Auto => Box::new(NoProgress),
        }
    }
}
