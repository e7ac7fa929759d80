//! Outcome of the most recent sync, persisted to `status.json`.
//!
//! Only the sync engine writes the status. Everyone else reads a snapshot.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use crate::config::write_json_atomic;
use crate::error::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncStatus {
    pub last_url: Option<String>,
    pub last_saved_path: Option<String>,
    pub last_result: Option<String>,
    pub last_error: Option<String>,
    /// RFC 3339
    pub last_run: Option<String>,
}

impl SyncStatus {
    pub fn is_success(&self) -> bool {
        self.last_result.is_some() && self.last_error.is_none()
    }

    /// Text a UI should show: the error if there is one, otherwise the result.
    pub fn summary(&self) -> Option<&str> {
        self.last_error.as_deref().or(self.last_result.as_deref())
    }
}

#[derive(Debug)]
pub struct StatusStore {
    path: PathBuf,
    current: RwLock<SyncStatus>,
}

impl StatusStore {
    /// Opens the store, restoring the last persisted status if readable.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let current = std::fs::read_to_string(&path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();
        Self {
            path,
            current: RwLock::new(current),
        }
    }

    pub fn get(&self) -> SyncStatus {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replaces the current status and writes it to disk.
    ///
    /// The in-memory record is updated even when the write fails, so callers
    /// always observe the latest attempt.
    pub(crate) fn replace(&self, status: SyncStatus) -> Result<()> {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = status.clone();
        write_json_atomic(&self.path, &status)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
