//! Persisted sync watermark.
//!
//! The state file holds `{"last_sync_date": "<ISO-8601>"}`. No file means no
//! prior sync, which reads as the Unix epoch ("fetch everything").

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::models::{format_timestamp, parse_timestamp};
use crate::storage;

#[derive(Debug, Serialize, Deserialize)]
struct SyncState {
    last_sync_date: String,
}

/// File-backed store for the last successful sync instant.
#[derive(Debug, Clone)]
pub struct WatermarkStore {
    path: PathBuf,
}

impl WatermarkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The stored watermark, or the epoch when no state exists yet.
    pub fn get(&self) -> Result<DateTime<Utc>> {
        match storage::read_json::<SyncState>(&self.path)? {
            None => Ok(DateTime::UNIX_EPOCH),
            Some(state) => parse_timestamp(&state.last_sync_date).ok_or_else(|| {
                anyhow!(
                    "Invalid last_sync_date '{}' in {}",
                    state.last_sync_date,
                    self.path.display()
                )
            }),
        }
    }

    /// Persist a new watermark atomically and return the stored value.
    ///
    /// The watermark never moves backwards: a value older than the current
    /// one leaves the stored value in place.
    pub fn set(&self, ts: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let current = self.get()?;
        let next = if ts < current {
            warn!(
                requested = %format_timestamp(&ts),
                current = %format_timestamp(&current),
                "ignoring watermark regression"
            );
            current
        } else {
            ts
        };
        let state = SyncState {
            last_sync_date: format_timestamp(&next),
        };
        storage::write_json_atomic(&self.path, &state)?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn store() -> (TempDir, WatermarkStore) {
        let tmp = TempDir::new().unwrap();
        let store = WatermarkStore::new(tmp.path().join("state.json"));
        (tmp, store)
    }

    #[test]
    fn defaults_to_epoch() {
        let (_tmp, store) = store();
        assert_eq!(store.get().unwrap(), DateTime::UNIX_EPOCH);
        assert!(!store.path().exists());
    }

    #[test]
    fn set_then_get() {
        let (_tmp, store) = store();
        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        store.set(ts).unwrap();
        assert_eq!(store.get().unwrap(), ts);

        let raw = std::fs::read_to_string(store.path()).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["last_sync_date"], "2025-01-01T00:00:00");
    }

    #[test]
    fn never_moves_backwards() {
        let (_tmp, store) = store();
        let later = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let earlier = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        store.set(later).unwrap();
        assert_eq!(store.set(earlier).unwrap(), later);
        assert_eq!(store.get().unwrap(), later);
    }

    #[test]
    fn reads_state_written_by_other_tools() {
        let (_tmp, store) = store();
        std::fs::write(store.path(), r#"{"last_sync_date": "2025-11-12T09:30:00"}"#).unwrap();
        assert_eq!(
            store.get().unwrap(),
            Utc.with_ymd_and_hms(2025, 11, 12, 9, 30, 0).unwrap()
        );
    }

    #[test]
    fn corrupt_state_is_an_error() {
        let (_tmp, store) = store();
        std::fs::write(store.path(), r#"{"last_sync_date": "soon"}"#).unwrap();
        assert!(store.get().is_err());
    }
}
