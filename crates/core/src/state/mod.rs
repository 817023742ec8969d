//! Persisted page state.
//!
//! The [`PageStateStore`] owns every [`PageRecord`] between cycles. It is
//! loaded once at the start of a run, mutated in memory by the orchestrator
//! only, and written back through a [`StateBackend`] whose `save` must be
//! atomic.

pub mod file;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::StateError;
use crate::models::PageRecord;

pub use file::JsonStateFile;

/// Current on-disk format version.
pub const STATE_FORMAT_VERSION: u32 = 1;

/// Serialized form of the whole state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub format_version: u32,
    pub last_synced: Option<DateTime<Utc>>,
    pub pages: Vec<PageRecord>,
}

/// Storage for a [`StateSnapshot`].
pub trait StateBackend: Send + Sync {
    /// `Ok(None)` means nothing was ever saved: a first sync.
    fn load(&self) -> Result<Option<StateSnapshot>, StateError>;

    /// Replace the stored snapshot. A crash mid-save must leave either the
    /// old or the new snapshot observable, never a mix.
    fn save(&self, snapshot: &StateSnapshot) -> Result<(), StateError>;
}

/// In-memory page state for one run.
#[derive(Debug, Clone, Default)]
pub struct PageStateStore {
    records: BTreeMap<String, PageRecord>,
    last_synced: Option<DateTime<Utc>>,
}

impl PageStateStore {
    /// Load from `backend`; an absent state yields an empty store.
    pub fn load(backend: &dyn StateBackend) -> Result<Self, StateError> {
        match backend.load()? {
            None => {
                info!("no persisted state, treating as first sync");
                Ok(Self::default())
            }
            Some(snapshot) => {
                if snapshot.format_version != STATE_FORMAT_VERSION {
                    return Err(StateError::Corrupt {
                        path: "<state>".into(),
                        detail: format!(
                            "unsupported format version {}",
                            snapshot.format_version
                        ),
                    });
                }
                let mut records = BTreeMap::new();
                for record in snapshot.pages {
                    if records.insert(record.page_id.clone(), record).is_some() {
                        return Err(StateError::Corrupt {
                            path: "<state>".into(),
                            detail: "duplicate page_id".into(),
                        });
                    }
                }
                info!(pages = records.len(), "loaded page state");
                Ok(Self {
                    records,
                    last_synced: snapshot.last_synced,
                })
            }
        }
    }

    /// Write every record and `last_synced` through `backend`.
    pub fn save(
        &self,
        backend: &dyn StateBackend,
        last_synced: DateTime<Utc>,
    ) -> Result<(), StateError> {
        let snapshot = StateSnapshot {
            format_version: STATE_FORMAT_VERSION,
            last_synced: Some(last_synced),
            pages: self.records.values().cloned().collect(),
        };
        backend.save(&snapshot)?;
        debug!(pages = snapshot.pages.len(), "page state saved");
        Ok(())
    }

    pub fn get(&self, page_id: &str) -> Option<&PageRecord> {
        self.records.get(page_id)
    }

    /// Insert or replace a record. The remote version never goes backwards.
    pub fn upsert(&mut self, record: PageRecord) -> Result<(), StateError> {
        if let Some(current) = self.records.get(&record.page_id) {
            if record.remote_version < current.remote_version {
                return Err(StateError::VersionRegression {
                    page_id: record.page_id,
                    current: current.remote_version,
                    attempted: record.remote_version,
                });
            }
        }
        self.records.insert(record.page_id.clone(), record);
        Ok(())
    }

    pub fn remove(&mut self, page_id: &str) -> Option<PageRecord> {
        self.records.remove(page_id)
    }

    pub fn records(&self) -> impl Iterator<Item = &PageRecord> {
        self.records.values()
    }

    /// The record whose mirror file lives at `path`.
    pub fn find_by_path(&self, path: &Path) -> Option<&PageRecord> {
        self.records.values().find(|r| r.local_path == path)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last_synced(&self) -> Option<DateTime<Utc>> {
        self.last_synced
    }
}

/// Backend that keeps the serialized snapshot in memory.
///
/// Used by tests and by embedders that persist state themselves.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    data: Mutex<Option<String>>,
    saves: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the backend with raw serialized content.
    pub fn with_raw(raw: impl Into<String>) -> Self {
        Self {
            data: Mutex::new(Some(raw.into())),
            saves: AtomicUsize::new(0),
        }
    }

    /// Number of successful `save` calls.
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl StateBackend for MemoryBackend {
    fn load(&self) -> Result<Option<StateSnapshot>, StateError> {
        let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        match data.as_deref() {
            None => Ok(None),
            Some(raw) => serde_json::from_str(raw)
                .map(Some)
                .map_err(|e| StateError::Corrupt {
                    path: "<memory>".into(),
                    detail: e.to_string(),
                }),
        }
    }

    fn save(&self, snapshot: &StateSnapshot) -> Result<(), StateError> {
        let raw = serde_json::to_string(snapshot)
            .map_err(|e| StateError::Serialize(e.to_string()))?;
        *self.data.lock().unwrap_or_else(|e| e.into_inner()) = Some(raw);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, version: u64) -> PageRecord {
        PageRecord::new(id, format!("Page {}", id), format!("{}.md", id), version, "text", None)
    }

    #[test]
    fn test_empty_backend_is_first_sync() {
        let backend = MemoryBackend::new();
        let store = PageStateStore::load(&backend).unwrap();
        assert!(store.is_empty());
        assert!(store.last_synced().is_none());
    }

    #[test]
    fn test_round_trip_through_backend() {
        let backend = MemoryBackend::new();
        let mut store = PageStateStore::default();
        store.upsert(record("1", 3)).unwrap();
        store.upsert(record("2", 1)).unwrap();
        let now = Utc::now();
        store.save(&backend, now).unwrap();

        let loaded = PageStateStore::load(&backend).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get("1").unwrap().remote_version, 3);
        assert_eq!(loaded.last_synced(), Some(now));
        assert_eq!(backend.saves(), 1);
    }

    #[test]
    fn test_upsert_rejects_version_regression() {
        let mut store = PageStateStore::default();
        store.upsert(record("1", 5)).unwrap();
        let err = store.upsert(record("1", 4)).unwrap_err();
        assert!(matches!(err, StateError::VersionRegression { .. }));
        store.upsert(record("1", 5)).unwrap();
        store.upsert(record("1", 6)).unwrap();
        assert_eq!(store.get("1").unwrap().remote_version, 6);
    }

    #[test]
    fn test_remove_and_find_by_path() {
        let mut store = PageStateStore::default();
        store.upsert(record("1", 1)).unwrap();
        assert_eq!(
            store.find_by_path(Path::new("1.md")).map(|r| r.page_id.as_str()),
            Some("1")
        );
        assert!(store.remove("1").is_some());
        assert!(store.remove("1").is_none());
        assert!(store.find_by_path(Path::new("1.md")).is_none());
    }

    #[test]
    fn test_corrupt_state_is_an_error() {
        let backend = MemoryBackend::with_raw("{ not json");
        let err = PageStateStore::load(&backend).unwrap_err();
        assert!(matches!(err, StateError::Corrupt { .. }));
    }

    #[test]
    fn test_unknown_format_version_is_corrupt() {
        let backend =
            MemoryBackend::with_raw(r#"{"format_version":99,"last_synced":null,"pages":[]}"#);
        assert!(matches!(
            PageStateStore::load(&backend),
            Err(StateError::Corrupt { .. })
        ));
    }
}
