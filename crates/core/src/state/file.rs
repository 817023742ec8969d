//! JSON state file with atomic replace.

use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::{StateBackend, StateSnapshot};
use crate::errors::StateError;

/// State persisted as pretty-printed JSON at a fixed path.
///
/// Saves write a sibling temp file, fsync it, and rename it over the
/// target, so readers only ever observe a complete snapshot.
#[derive(Debug, Clone)]
pub struct JsonStateFile {
    path: PathBuf,
}

impl JsonStateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateBackend for JsonStateFile {
    fn load(&self) -> Result<Option<StateSnapshot>, StateError> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "state file absent");
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.path)?;
        let snapshot = serde_json::from_str(&raw).map_err(|e| StateError::Corrupt {
            path: self.path.display().to_string(),
            detail: e.to_string(),
        })?;
        Ok(Some(snapshot))
    }

    fn save(&self, snapshot: &StateSnapshot) -> Result<(), StateError> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let body = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| StateError::Serialize(e.to_string()))?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&body)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| StateError::IoError(e.error))?;

        info!(path = %self.path.display(), pages = snapshot.pages.len(), "state file written");
        Ok(())
    }
}
