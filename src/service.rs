//! # Wallpaper Service Module
//!
//! The command surface of the daemon, plus its D-Bus interface.
//!
//! [`Service`] owns the stores, the sync engine and the scheduler. Every
//! front-end (D-Bus, the CLI in-process fallback) goes through it, so all syncs
//! funnel into the engine's single-flight guard.
//!
//! ## D-Bus Interface
//!
//! Service name: `io.github.bingscape.Wallpaper1`
//! Object path: `/io/github/bingscape/Wallpaper1`
//!
//! ### Methods
//! - `SyncWallpaper(apply_all: bool) -> status_json`
//! - `GetStatus() -> status_json`
//! - `GetSettings() -> settings_json`
//! - `SetAutoSync(enabled: bool, apply_all: bool)`
//! - `SetResolution(resolution: String)` - "UHD" or "HD"
//! - `ClearCache() -> summary`
//!
//! ### Signals
//! - `StatusChanged(status_json)` - after every sync attempt
//! - `SettingsChanged(settings_json)` - after every settings change

use std::path::Path;
use std::sync::Arc;
use zbus::{interface, SignalContext};

use crate::bing::{BingClient, MetadataSource};
use crate::cache::CacheStore;
use crate::config::{app_data_dir, Resolution, Settings, SettingsStore};
use crate::desktop::default_backend;
use crate::download::ImageDownloader;
use crate::error::Result;
use crate::scheduler::Scheduler;
use crate::status::{StatusStore, SyncStatus};
use crate::sync::{SyncEngine, SyncReport};
use crate::wallpaper::DesktopBackend;

/// D-Bus service name
pub const SERVICE_NAME: &str = "io.github.bingscape.Wallpaper1";

/// D-Bus object path
pub const OBJECT_PATH: &str = "/io/github/bingscape/Wallpaper1";

pub struct Service {
    settings: Arc<SettingsStore>,
    status: Arc<StatusStore>,
    cache: Arc<CacheStore>,
    engine: Arc<SyncEngine>,
    scheduler: Scheduler,
}

impl Service {
    /// Builds a service whose state lives under `data_dir`.
    ///
    /// # Arguments
    /// * `data_dir` - Root for `settings.json`, `status.json` and `cache/`
    /// * `metadata` - Source of today's image descriptor
    /// * `downloader` - Image downloader used on cache misses
    /// * `desktop` - Platform wallpaper backend
    ///
    /// The scheduler is created stopped; call `scheduler().start()` to run it.
    pub fn open(
        data_dir: &Path,
        metadata: Arc<dyn MetadataSource>,
        downloader: Arc<dyn ImageDownloader>,
        desktop: Arc<dyn DesktopBackend>,
    ) -> Self {
        let settings = Arc::new(SettingsStore::open(data_dir.join("settings.json")));
        let status = Arc::new(StatusStore::open(data_dir.join("status.json")));
        let cache = Arc::new(CacheStore::open(data_dir.join("cache")));
        let engine = Arc::new(SyncEngine::new(
            settings.clone(),
            status.clone(),
            cache.clone(),
            metadata,
            downloader,
            desktop,
        ));
        Self::from_parts(settings, status, cache, engine)
    }

    /// Service backed by Bing and the platform's desktop backend.
    pub fn open_default() -> Result<Self> {
        let bing = Arc::new(BingClient::new()?);
        let data_dir = app_data_dir();
        tracing::debug!(data_dir = %data_dir.display(), "opening service");
        Ok(Self::open(&data_dir, bing.clone(), bing, default_backend()))
    }

    pub fn from_parts(
        settings: Arc<SettingsStore>,
        status: Arc<StatusStore>,
        cache: Arc<CacheStore>,
        engine: Arc<SyncEngine>,
    ) -> Self {
        let scheduler = Scheduler::new(engine.clone(), settings.clone());
        Self {
            settings,
            status,
            cache,
            engine,
            scheduler,
        }
    }

    /// Runs one sync; fails only with `SyncError::Busy`.
    pub async fn sync_wallpaper(&self, apply_all: bool) -> Result<SyncStatus> {
        self.engine.sync(apply_all).await
    }

    pub async fn sync_with_report(&self, apply_all: bool) -> Result<SyncReport> {
        self.engine.sync_with_report(apply_all).await
    }

    pub fn get_status(&self) -> SyncStatus {
        self.status.get()
    }

    pub fn get_settings(&self) -> Settings {
        self.settings.get()
    }

    /// Persists the auto-sync flag and display target.
    ///
    /// The running scheduler picks the change up on its next tick.
    pub fn set_auto_sync(&self, enabled: bool, apply_all: bool) -> Result<Settings> {
        let settings = self.settings.update(|s| {
            s.auto_enabled = enabled;
            s.apply_all = apply_all;
        })?;
        tracing::info!(enabled, apply_all, "auto sync updated");
        Ok(settings)
    }

    pub fn set_resolution(&self, resolution: Resolution) -> Result<Settings> {
        let settings = self.settings.update(|s| s.resolution = resolution)?;
        tracing::info!(%resolution, "resolution updated");
        Ok(settings)
    }

    /// Deletes all cached images and returns a summary for display.
    ///
    /// Refused with `SyncError::Busy` while a sync is running.
    pub async fn clear_cache(&self) -> Result<String> {
        let _exclusive = self.engine.try_exclusive()?;
        let cache = self.cache.clone();
        let removed = tokio::task::spawn_blocking(move || cache.clear())
            .await
            .map_err(|e| crate::error::SyncError::Io(std::io::Error::other(e)))??;
        Ok(match removed {
            0 => "Cache was already empty".to_string(),
            1 => "Cache cleared: removed 1 file".to_string(),
            n => format!("Cache cleared: removed {n} files"),
        })
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }
}

/// The D-Bus object; a thin adapter over [`Service`].
pub struct WallpaperService {
    service: Arc<Service>,
}

impl WallpaperService {
    pub fn new(service: Arc<Service>) -> Self {
        Self { service }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn failed(e: crate::error::SyncError) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

#[interface(name = "io.github.bingscape.Wallpaper1")]
impl WallpaperService {
    /// Run one sync and return the resulting status as JSON.
    ///
    /// `StatusChanged` is emitted by the daemon's status forwarder.
    async fn sync_wallpaper(&self, apply_all: bool) -> zbus::fdo::Result<String> {
        let status = self.service.sync_wallpaper(apply_all).await.map_err(failed)?;
        to_json(&status)
    }

    async fn get_status(&self) -> zbus::fdo::Result<String> {
        to_json(&self.service.get_status())
    }

    async fn get_settings(&self) -> zbus::fdo::Result<String> {
        to_json(&self.service.get_settings())
    }

    async fn set_auto_sync(
        &self,
        enabled: bool,
        apply_all: bool,
        #[zbus(signal_context)] ctx: SignalContext<'_>,
    ) -> zbus::fdo::Result<()> {
        let settings = self.service.set_auto_sync(enabled, apply_all).map_err(failed)?;
        Self::settings_changed(&ctx, &to_json(&settings)?).await?;
        Ok(())
    }

    async fn set_resolution(
        &self,
        resolution: String,
        #[zbus(signal_context)] ctx: SignalContext<'_>,
    ) -> zbus::fdo::Result<()> {
        let resolution: Resolution = resolution
            .parse()
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("{e}")))?;
        let settings = self.service.set_resolution(resolution).map_err(failed)?;
        Self::settings_changed(&ctx, &to_json(&settings)?).await?;
        Ok(())
    }

    async fn clear_cache(&self) -> zbus::fdo::Result<String> {
        self.service.clear_cache().await.map_err(failed)
    }

    // === Signals ===

    #[zbus(signal)]
    async fn status_changed(ctx: &SignalContext<'_>, status: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn settings_changed(ctx: &SignalContext<'_>, settings: &str) -> zbus::Result<()>;
}

/// Emits `StatusChanged` from the object registered at [`OBJECT_PATH`].
pub async fn emit_status_changed(connection: &zbus::Connection, status: &SyncStatus) -> zbus::Result<()> {
    let json = serde_json::to_string(status).map_err(|e| zbus::Error::Failure(e.to_string()))?;
    let iface = connection
        .object_server()
        .interface::<_, WallpaperService>(OBJECT_PATH)
        .await?;
    WallpaperService::status_changed(iface.signal_context(), &json).await
}
