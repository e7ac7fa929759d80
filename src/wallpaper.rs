//! # Wallpaper Applier
//!
//! Applies a local image to the main display or to every connected display.
//! Displays are enumerated on every call because monitors come and go between
//! syncs. A failure on one display does not stop the others; the call only
//! fails when no display could be updated.

use std::path::Path;

use crate::error::{DisplayFailure, Result, SyncError};

/// Which displays a sync should update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayTarget {
    Main,
    AllDisplays,
}

impl DisplayTarget {
    pub fn from_apply_all(apply_all: bool) -> Self {
        if apply_all {
            DisplayTarget::AllDisplays
        } else {
            DisplayTarget::Main
        }
    }
}

/// A connected output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Display {
    pub name: String,
    pub primary: bool,
}

impl Display {
    pub fn new(name: impl Into<String>, primary: bool) -> Self {
        Self { name: name.into(), primary }
    }
}

/// Platform hooks for enumerating displays and setting their background.
///
/// Calls are synchronous; the sync engine runs them on a blocking thread.
pub trait DesktopBackend: Send + Sync {
    /// Currently connected displays.
    fn displays(&self) -> std::result::Result<Vec<Display>, String>;

    /// Sets the background of one display to `path`.
    fn set_wallpaper(&self, display: &Display, path: &Path) -> std::result::Result<(), String>;

    /// Called once after all per-display calls, with the displays that succeeded.
    fn commit(&self, _applied: &[Display]) -> std::result::Result<(), String> {
        Ok(())
    }
}

/// Outcome of a (possibly partial) successful apply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: Vec<String>,
    pub failed: Vec<DisplayFailure>,
}

impl ApplyReport {
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// Applies `path` to the displays selected by `target`.
///
/// Displays are enumerated fresh on each call. Every selected display is
/// attempted even after a failure, then `commit` runs once with the displays
/// that succeeded.
///
/// # Arguments
/// * `backend` - Platform hooks used to enumerate and set backgrounds
/// * `path` - Local image file; must exist
/// * `target` - Main display only, or all connected displays
///
/// # Returns
/// * `Ok(ApplyReport)` - At least one display was updated
/// * `Err(SyncError::Platform)` - Every display failed (or none could be
///   enumerated); lists each display with its reason
pub fn apply(backend: &dyn DesktopBackend, path: &Path, target: DisplayTarget) -> Result<ApplyReport> {
    let displays = backend.displays().map_err(|reason| {
        SyncError::Platform(vec![DisplayFailure {
            display: "display enumeration".to_string(),
            reason,
        }])
    })?;

    let selected = select_displays(displays, target);
    if selected.is_empty() {
        return Err(SyncError::Platform(vec![DisplayFailure {
            display: "display enumeration".to_string(),
            reason: "no displays found".to_string(),
        }]));
    }

    if !path.is_file() {
        let reason = format!("path inaccessible: {}", path.display());
        return Err(SyncError::Platform(
            selected
                .into_iter()
                .map(|d| DisplayFailure { display: d.name, reason: reason.clone() })
                .collect(),
        ));
    }

    let mut applied = Vec::new();
    let mut failed = Vec::new();
    for output in selected {
        match backend.set_wallpaper(&output, path) {
            Ok(()) => {
                tracing::debug!(output = %output.name, "wallpaper set");
                applied.push(output);
            }
            Err(reason) => {
                tracing::warn!(output = %output.name, "failed to set wallpaper: {reason}");
                failed.push(DisplayFailure { display: output.name, reason });
            }
        }
    }

    if applied.is_empty() {
        return Err(SyncError::Platform(failed));
    }

    if let Err(reason) = backend.commit(&applied) {
        failed.extend(applied.into_iter().map(|d| DisplayFailure {
            display: d.name,
            reason: reason.clone(),
        }));
        return Err(SyncError::Platform(failed));
    }

    Ok(ApplyReport {
        applied: applied.into_iter().map(|d| d.name).collect(),
        failed,
    })
}

fn select_displays(displays: Vec<Display>, target: DisplayTarget) -> Vec<Display> {
    match target {
        DisplayTarget::AllDisplays => displays,
        DisplayTarget::Main => displays
            .iter()
            .find(|d| d.primary)
            .or_else(|| displays.first())
            .cloned()
            .into_iter()
            .collect(),
    }
}
