//! # Image Cache
//!
//! Maps image identifiers to downloaded files under `cache/`.
//!
//! ```text
//! cache/
//! ├── index.json            identifier -> CacheEntry
//! ├── 2024-05-01-UHD.jpg
//! └── 2024-05-02-UHD.jpg
//! ```
//!
//! Files are published with an atomic rename from a temp file in the same
//! directory, so a reader never sees a half-written image under its final
//! name. Entries whose file vanished or is empty are dropped on lookup.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::config::write_json_atomic;
use crate::error::Result;

const INDEX_FILE: &str = "index.json";

/// One downloaded image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub identifier: String,
    pub local_path: PathBuf,
    /// RFC 3339, UTC
    pub downloaded_at: String,
}

#[derive(Debug)]
pub struct CacheStore {
    dir: PathBuf,
    entries: Mutex<BTreeMap<String, CacheEntry>>,
}

impl CacheStore {
    /// Opens the cache rooted at `dir`, reading its index if present.
    ///
    /// The directory is created lazily on the first `store`.
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let entries = read_index(&dir.join(INDEX_FILE));
        Self {
            dir,
            entries: Mutex::new(entries),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the cached file for `identifier`, if it is still valid.
    ///
    /// A missing or zero-length file counts as a miss and its entry is removed.
    pub fn lookup(&self, identifier: &str) -> Option<PathBuf> {
        let mut entries = self.lock();
        let path = entries.get(identifier)?.local_path.clone();

        if is_valid_file(&path) {
            return Some(path);
        }

        tracing::warn!(identifier, path = %path.display(), "dropping stale cache entry");
        entries.remove(identifier);
        let _ = std::fs::remove_file(&path);
        if let Err(e) = self.save_index(&entries) {
            tracing::warn!("failed to rewrite cache index: {e}");
        }
        None
    }

    /// Writes `bytes` as the image for `identifier` and records the entry.
    ///
    /// The file is written to a `.incoming-*` temp file, synced, and renamed
    /// into place; the index is rewritten afterwards. If the index cannot be
    /// saved the new file is removed again.
    ///
    /// # Arguments
    /// * `identifier` - Cache key, sanitised into the file name
    /// * `bytes` - Verified image data (JPEG or PNG)
    ///
    /// # Returns
    /// * `Ok(PathBuf)` - Final path of the cached image
    /// * `Err(SyncError::Io)` - The directory, file, or index could not be written
    pub fn store(&self, identifier: &str, bytes: &[u8]) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let target = self.dir.join(file_name_for(identifier, bytes));

        let mut tmp = tempfile::Builder::new()
            .prefix(".incoming-")
            .tempfile_in(&self.dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&target).map_err(|e| e.error)?;

        let mut entries = self.lock();
        let entry = CacheEntry {
            identifier: identifier.to_string(),
            local_path: target.clone(),
            downloaded_at: Utc::now().to_rfc3339(),
        };
        let previous = entries.insert(identifier.to_string(), entry);

        if let Err(e) = self.save_index(&entries) {
            // Roll back so the index and the directory stay consistent.
            match previous {
                Some(prev) => {
                    entries.insert(identifier.to_string(), prev);
                }
                None => {
                    entries.remove(identifier);
                    let _ = std::fs::remove_file(&target);
                }
            }
            return Err(e);
        }

        if let Some(prev) = previous.filter(|p| p.local_path != target) {
            let _ = std::fs::remove_file(&prev.local_path);
        }

        tracing::debug!(identifier, path = %target.display(), "image cached");
        Ok(target)
    }

    /// Deletes every cached file and entry, returning how many files were removed.
    ///
    /// Deletion is best-effort per file. Orphaned files in the cache directory
    /// (left behind by crashes) are removed and counted too. Only a failure to
    /// rewrite the index is reported as an error.
    pub fn clear(&self) -> Result<usize> {
        let mut entries = self.lock();
        let mut removed = 0;

        for entry in entries.values() {
            match std::fs::remove_file(&entry.local_path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %entry.local_path.display(), "failed to delete: {e}"),
            }
        }

        if let Ok(dir) = std::fs::read_dir(&self.dir) {
            for path in dir.flatten().map(|e| e.path()) {
                if path.file_name().is_some_and(|n| n == INDEX_FILE) || !path.is_file() {
                    continue;
                }
                match std::fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) => tracing::warn!(path = %path.display(), "failed to delete: {e}"),
                }
            }
        }

        entries.clear();
        if self.dir.exists() {
            self.save_index(&entries)?;
        }
        tracing::info!(removed, "cache cleared");
        Ok(removed)
    }

    /// All entries, most recently downloaded first.
    pub fn entries(&self) -> Vec<CacheEntry> {
        let mut list: Vec<CacheEntry> = self.lock().values().cloned().collect();
        list.sort_by(|a, b| b.downloaded_at.cmp(&a.downloaded_at));
        list
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn save_index(&self, entries: &BTreeMap<String, CacheEntry>) -> Result<()> {
        write_json_atomic(&self.dir.join(INDEX_FILE), entries)
    }
}

fn read_index(path: &Path) -> BTreeMap<String, CacheEntry> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|content| match serde_json::from_str(&content) {
            Ok(entries) => Some(entries),
            Err(e) => {
                tracing::warn!(path = %path.display(), "ignoring malformed cache index: {e}");
                None
            }
        })
        .unwrap_or_default()
}

fn is_valid_file(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

/// Deterministic file name: sanitised identifier plus an extension from the magic bytes.
fn file_name_for(identifier: &str, bytes: &[u8]) -> String {
    let stem: String = identifier
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect();
    let stem = stem.trim_start_matches('.');
    let stem = if stem.is_empty() { "image" } else { stem };
    let ext = if bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47]) { "png" } else { "jpg" };
    format!("{stem}.{ext}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 1, 2, 3];

    #[test]
    fn test_store_then_lookup() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheStore::open(tmp.path().join("cache"));

        assert!(cache.lookup("2024-05-01-UHD").is_none());
        let path = cache.store("2024-05-01-UHD", JPEG).unwrap();
        assert_eq!(path.file_name().unwrap(), "2024-05-01-UHD.jpg");
        assert_eq!(std::fs::read(&path).unwrap(), JPEG);
        assert_eq!(cache.lookup("2024-05-01-UHD"), Some(path));
    }

    #[test]
    fn test_index_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("cache");
        let path = CacheStore::open(&dir).store("day", JPEG).unwrap();

        let reopened = CacheStore::open(&dir);
        assert_eq!(reopened.lookup("day"), Some(path));
        assert_eq!(reopened.entries().len(), 1);
    }

    #[test]
    fn test_lookup_heals_missing_and_empty_files() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheStore::open(tmp.path());

        let gone = cache.store("gone", JPEG).unwrap();
        std::fs::remove_file(&gone).unwrap();
        let empty = cache.store("empty", JPEG).unwrap();
        std::fs::write(&empty, b"").unwrap();

        assert!(cache.lookup("gone").is_none());
        assert!(cache.lookup("empty").is_none());
        assert!(cache.entries().is_empty());
        assert!(CacheStore::open(tmp.path()).entries().is_empty());
    }

    #[test]
    fn test_overwrite_same_identifier() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheStore::open(tmp.path());

        cache.store("day", JPEG).unwrap();
        let png = [0x89, 0x50, 0x4E, 0x47, 9];
        let path = cache.store("day", &png).unwrap();

        assert_eq!(path.extension().unwrap(), "png");
        assert_eq!(cache.lookup("day"), Some(path));
        assert!(!tmp.path().join("day.jpg").exists());
        assert_eq!(cache.entries().len(), 1);
    }

    #[test]
    fn test_clear_counts_only_existing_files() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheStore::open(tmp.path());

        for id in ["a", "b", "c", "stale"] {
            cache.store(id, JPEG).unwrap();
        }
        std::fs::remove_file(tmp.path().join("stale.jpg")).unwrap();

        assert_eq!(cache.clear().unwrap(), 3);
        for id in ["a", "b", "c", "stale"] {
            assert!(cache.lookup(id).is_none());
        }
        assert!(!tmp.path().join("a.jpg").exists());
        assert!(tmp.path().join(INDEX_FILE).exists());
    }

    #[test]
    fn test_clear_sweeps_orphans() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheStore::open(tmp.path());
        cache.store("a", JPEG).unwrap();
        std::fs::write(tmp.path().join(".incoming-abc"), b"partial").unwrap();

        assert_eq!(cache.clear().unwrap(), 2);
        assert!(!tmp.path().join(".incoming-abc").exists());
    }

    #[test]
    fn test_clear_on_missing_dir() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheStore::open(tmp.path().join("never-created"));
        assert_eq!(cache.clear().unwrap(), 0);
    }

    #[test]
    fn test_file_name_is_sanitised() {
        assert_eq!(file_name_for("../etc/passwd", JPEG), "_etc_passwd.jpg");
        assert_eq!(file_name_for("", JPEG), "image.jpg");
    }
}
