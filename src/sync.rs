//! # Sync Engine
//!
//! One sync is: fetch today's descriptor → look it up in the cache →
//! download on a miss → apply to the selected displays → record the status.
//!
//! Stage errors are folded into the returned [`SyncStatus`]; the only error
//! [`SyncEngine::sync`] itself returns is [`SyncError::Busy`]. At most one
//! sync runs at a time: a request that arrives while another is in flight is
//! rejected instead of queued.

use chrono::Utc;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, MutexGuard};

use crate::bing::MetadataSource;
use crate::cache::CacheStore;
use crate::config::SettingsStore;
use crate::download::ImageDownloader;
use crate::error::{Result, SyncError};
use crate::status::{StatusStore, SyncStatus};
use crate::wallpaper::{self, ApplyReport, DesktopBackend, DisplayTarget};

/// The step of a sync that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Metadata,
    Download,
    Cache,
    Apply,
}

impl Stage {
    /// Whether retrying later could plausibly succeed.
    pub fn is_transient(self) -> bool {
        matches!(self, Stage::Metadata | Stage::Download)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Metadata => "Metadata fetch",
            Stage::Download => "Download",
            Stage::Cache => "Cache write",
            Stage::Apply => "Apply",
        })
    }
}

/// Status of a finished sync plus which stage failed, if any.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub status: SyncStatus,
    pub failed_stage: Option<Stage>,
    /// Whether the image was served from the cache
    pub cache_hit: bool,
}

/// What a sync attempt learned before it finished or failed.
#[derive(Default)]
struct Attempt {
    url: Option<String>,
    saved_path: Option<PathBuf>,
    cache_hit: bool,
}

pub struct SyncEngine {
    settings: Arc<SettingsStore>,
    status: Arc<StatusStore>,
    cache: Arc<CacheStore>,
    metadata: Arc<dyn MetadataSource>,
    downloader: Arc<dyn ImageDownloader>,
    desktop: Arc<dyn DesktopBackend>,
    in_flight: Mutex<()>,
    updates: watch::Sender<SyncStatus>,
}

impl SyncEngine {
    /// Wires an engine to its stores and collaborators.
    ///
    /// # Arguments
    /// * `settings` - Read at the start of every sync for the resolution
    /// * `status` - Written after every sync; also seeds the watch channel
    /// * `cache` - Identifier → file store consulted before downloading
    /// * `metadata` - Source of today's image descriptor
    /// * `downloader` - Fetches image bytes on a cache miss
    /// * `desktop` - Platform backend the image is applied through
    pub fn new(
        settings: Arc<SettingsStore>,
        status: Arc<StatusStore>,
        cache: Arc<CacheStore>,
        metadata: Arc<dyn MetadataSource>,
        downloader: Arc<dyn ImageDownloader>,
        desktop: Arc<dyn DesktopBackend>,
    ) -> Self {
        let (updates, _) = watch::channel(status.get());
        Self {
            settings,
            status,
            cache,
            metadata,
            downloader,
            desktop,
            in_flight: Mutex::new(()),
            updates,
        }
    }

    /// Runs one sync and returns the resulting status.
    pub async fn sync(&self, apply_all: bool) -> Result<SyncStatus> {
        self.sync_with_report(apply_all).await.map(|r| r.status)
    }

    /// Like [`sync`](Self::sync) but also reports the failed stage.
    ///
    /// # Arguments
    /// * `apply_all` - Apply to every display (`true`) or only the main one
    ///
    /// # Returns
    /// * `Ok(SyncReport)` - The recorded status, successful or not
    /// * `Err(SyncError::Busy)` - Another sync holds the engine
    pub async fn sync_with_report(&self, apply_all: bool) -> Result<SyncReport> {
        let _guard = self.in_flight.try_lock().map_err(|_| SyncError::Busy)?;

        let target = DisplayTarget::from_apply_all(apply_all);
        let mut attempt = Attempt::default();
        let outcome = self.run(target, &mut attempt).await;

        let (last_result, last_error, failed_stage) = match outcome {
            Ok(report) => (Some(result_message(target, &report)), None, None),
            Err((stage, e)) => {
                tracing::warn!(%stage, "sync failed: {e}");
                (None, Some(format!("{stage} failed: {e}")), Some(stage))
            }
        };

        let status = SyncStatus {
            last_url: attempt.url,
            last_saved_path: attempt.saved_path.map(|p| p.display().to_string()),
            last_result,
            last_error,
            last_run: Some(Utc::now().to_rfc3339()),
        };

        if let Err(e) = self.status.replace(status.clone()) {
            tracing::warn!(path = %self.status.path().display(), "failed to persist status: {e}");
        }
        self.updates.send_replace(status.clone());

        Ok(SyncReport {
            status,
            failed_stage,
            cache_hit: attempt.cache_hit,
        })
    }

    async fn run(
        &self,
        target: DisplayTarget,
        attempt: &mut Attempt,
    ) -> std::result::Result<ApplyReport, (Stage, SyncError)> {
        let resolution = self.settings.get().resolution;
        let descriptor = self
            .metadata
            .fetch_today(resolution)
            .await
            .map_err(|e| (Stage::Metadata, e))?;
        tracing::info!(
            identifier = %descriptor.identifier,
            title = descriptor.title.as_deref().unwrap_or(""),
            "today's image"
        );
        attempt.url = Some(descriptor.url.clone());

        let cache = self.cache.clone();
        let identifier = descriptor.identifier.clone();
        let cached = tokio::task::spawn_blocking(move || cache.lookup(&identifier))
            .await
            .map_err(|e| (Stage::Cache, SyncError::Io(std::io::Error::other(e))))?;

        let path = match cached {
            Some(path) => {
                tracing::info!(path = %path.display(), "cache hit, skipping download");
                attempt.cache_hit = true;
                path
            }
            None => {
                let bytes = self
                    .downloader
                    .download(&descriptor.url)
                    .await
                    .map_err(|e| (Stage::Download, e))?;
                tracing::info!(len = bytes.len(), "downloaded {}", descriptor.url);

                let cache = self.cache.clone();
                let identifier = descriptor.identifier.clone();
                tokio::task::spawn_blocking(move || cache.store(&identifier, &bytes))
                    .await
                    .map_err(|e| (Stage::Cache, SyncError::Io(std::io::Error::other(e))))?
                    .map_err(|e| (Stage::Cache, e))?
            }
        };
        attempt.saved_path = Some(path.clone());

        let desktop = self.desktop.clone();
        tokio::task::spawn_blocking(move || wallpaper::apply(desktop.as_ref(), &path, target))
            .await
            .map_err(|e| (Stage::Apply, SyncError::Io(std::io::Error::other(e))))?
            .map_err(|e| (Stage::Apply, e))
    }

    /// Receiver that observes every new status.
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.updates.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.in_flight.try_lock().is_err()
    }

    /// Holds off syncs while the caller works on shared state (e.g. clearing the cache).
    pub(crate) fn try_exclusive(&self) -> Result<MutexGuard<'_, ()>> {
        self.in_flight.try_lock().map_err(|_| SyncError::Busy)
    }
}

fn result_message(target: DisplayTarget, report: &ApplyReport) -> String {
    if report.is_partial() {
        let total = report.applied.len() + report.failed.len();
        return format!(
            "Applied to {} of {} displays (failed: {})",
            report.applied.len(),
            total,
            crate::error::join_failures(&report.failed)
        );
    }
    match target {
        DisplayTarget::AllDisplays => "Applied to all displays".to_string(),
        DisplayTarget::Main => "Applied to main display".to_string(),
    }
}
