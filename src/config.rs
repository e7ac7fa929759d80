//! # Configuration Module
//!
//! Handles user settings persistence and the on-disk layout of the application.
//!
//! ## Storage Layout
//! Everything lives under one application-data directory:
//! ```text
//! ~/.local/share/bingscape/
//! ├── settings.json   user settings
//! ├── status.json     outcome of the most recent sync
//! └── cache/          downloaded images + index.json
//! ```
//! Set `BINGSCAPE_DATA_DIR` to relocate the whole tree.

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};

use crate::error::{Result, SyncError};

/// Environment variable that overrides the data directory.
pub const DATA_DIR_ENV: &str = "BINGSCAPE_DATA_DIR";

const APP_DIR_NAME: &str = "bingscape";

/// Returns the application data directory.
///
/// `$BINGSCAPE_DATA_DIR` wins; otherwise `dirs::data_dir()/bingscape`,
/// falling back to `./bingscape` when no data directory is known.
pub fn app_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(dir);
    }
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

/// Image resolution requested from Bing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    /// 3840x2160 and up
    #[default]
    #[serde(rename = "UHD")]
    Uhd,
    /// 1920x1080
    #[serde(rename = "HD", alias = "1920x1080")]
    Hd,
}

impl Resolution {
    /// Short tag used in identifiers and the settings file.
    pub fn as_str(self) -> &'static str {
        match self {
            Resolution::Uhd => "UHD",
            Resolution::Hd => "HD",
        }
    }

    /// Suffix Bing uses for this resolution in image URLs.
    pub fn url_suffix(self) -> &'static str {
        match self {
            Resolution::Uhd => "UHD",
            Resolution::Hd => "1920x1080",
        }
    }
}

impl std::str::FromStr for Resolution {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "UHD" | "4K" => Ok(Resolution::Uhd),
            "HD" | "1920X1080" => Ok(Resolution::Hd),
            other => Err(SyncError::Config(format!("unknown resolution: {other}"))),
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User settings, persisted to `settings.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Whether the hourly scheduler runs syncs
    pub auto_enabled: bool,
    /// Apply to every connected display (false = main display only)
    pub apply_all: bool,
    pub resolution: Resolution,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_enabled: true,
            apply_all: true,
            resolution: Resolution::Uhd,
        }
    }
}

/// Serialises `value` as pretty JSON and atomically replaces `path` with it.
///
/// The data is written to a temp file in the same directory and renamed over
/// the target, so readers see either the old or the new content.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| SyncError::Config(format!("{} has no parent directory", path.display())))?;
    std::fs::create_dir_all(parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    serde_json::to_writer_pretty(&mut tmp, value)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| SyncError::Io(e.error))?;
    Ok(())
}

/// Persisted settings with a single-writer guard.
///
/// Reads return a snapshot of the in-memory copy. Writes go to disk first and
/// only then replace the in-memory copy, so a failed save changes nothing.
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    current: RwLock<Settings>,
    write_lock: Mutex<()>,
}

impl SettingsStore {
    /// Opens the store at `path`, loading whatever is on disk (or defaults).
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let current = read_settings(&path);
        Self {
            path,
            current: RwLock::new(current),
            write_lock: Mutex::new(()),
        }
    }

    /// Re-reads settings from disk, refreshing the in-memory copy.
    ///
    /// Returns defaults when no settings file exists.
    pub fn load(&self) -> Settings {
        let settings = read_settings(&self.path);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = settings.clone();
        settings
    }

    /// Current settings snapshot (no disk access).
    pub fn get(&self) -> Settings {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Persists `settings` and makes them current.
    pub fn save(&self, settings: &Settings) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.persist(settings)
    }

    /// Applies `change` to the current settings and persists the result.
    pub fn update(&self, change: impl FnOnce(&mut Settings)) -> Result<Settings> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = self.get();
        change(&mut next);
        self.persist(&next)?;
        Ok(next)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, settings: &Settings) -> Result<()> {
        write_json_atomic(&self.path, settings)
            .map_err(|e| SyncError::Config(format!("failed to save settings: {e}")))?;
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = settings.clone();
        tracing::debug!(path = %self.path.display(), ?settings, "settings saved");
        Ok(())
    }
}

fn read_settings(path: &Path) -> Settings {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Settings::default(),
        Err(e) => {
            tracing::warn!(path = %path.display(), "cannot read settings, using defaults: {e}");
            return Settings::default();
        }
    };
    serde_json::from_str(&content).unwrap_or_else(|e| {
        tracing::warn!(path = %path.display(), "malformed settings, using defaults: {e}");
        Settings::default()
    })
}
