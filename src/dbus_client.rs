//! # D-Bus Client Module
//!
//! Client side of the daemon's D-Bus interface. The CLI uses it to route
//! commands to a running daemon so that syncs and settings changes go through
//! the daemon's single engine instead of a second process.
//!
//! ```ignore
//! let client = WallpaperClient::connect().await?;
//! let status = client.sync_wallpaper(true).await?;
//! println!("{:?}", status.summary());
//! ```

use serde::de::DeserializeOwned;
use zbus::{proxy, Connection};

use crate::config::{Resolution, Settings};
use crate::service::SERVICE_NAME;
use crate::status::SyncStatus;

/// D-Bus proxy for the wallpaper service
#[proxy(
    interface = "io.github.bingscape.Wallpaper1",
    default_service = "io.github.bingscape.Wallpaper1",
    default_path = "/io/github/bingscape/Wallpaper1"
)]
trait WallpaperService {
    async fn sync_wallpaper(&self, apply_all: bool) -> zbus::Result<String>;

    async fn get_status(&self) -> zbus::Result<String>;

    async fn get_settings(&self) -> zbus::Result<String>;

    async fn set_auto_sync(&self, enabled: bool, apply_all: bool) -> zbus::Result<()>;

    async fn set_resolution(&self, resolution: &str) -> zbus::Result<()>;

    async fn clear_cache(&self) -> zbus::Result<String>;

    #[zbus(signal)]
    async fn status_changed(&self, status: String) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn settings_changed(&self, settings: String) -> zbus::Result<()>;
}

/// High-level client for the daemon
pub struct WallpaperClient {
    proxy: WallpaperServiceProxy<'static>,
}

fn decode<T: DeserializeOwned>(json: &str) -> zbus::Result<T> {
    serde_json::from_str(json).map_err(|e| zbus::Error::Failure(format!("bad reply from daemon: {e}")))
}

impl WallpaperClient {
    /// Connect to the daemon. Fails if it is not running.
    pub async fn connect() -> zbus::Result<Self> {
        let connection = Connection::session().await?;
        let proxy = WallpaperServiceProxy::new(&connection).await?;
        Ok(Self { proxy })
    }

    pub async fn sync_wallpaper(&self, apply_all: bool) -> zbus::Result<SyncStatus> {
        decode(&self.proxy.sync_wallpaper(apply_all).await?)
    }

    pub async fn get_status(&self) -> zbus::Result<SyncStatus> {
        decode(&self.proxy.get_status().await?)
    }

    pub async fn get_settings(&self) -> zbus::Result<Settings> {
        decode(&self.proxy.get_settings().await?)
    }

    pub async fn set_auto_sync(&self, enabled: bool, apply_all: bool) -> zbus::Result<()> {
        self.proxy.set_auto_sync(enabled, apply_all).await
    }

    pub async fn set_resolution(&self, resolution: Resolution) -> zbus::Result<()> {
        self.proxy.set_resolution(resolution.as_str()).await
    }

    pub async fn clear_cache(&self) -> zbus::Result<String> {
        self.proxy.clear_cache().await
    }
}

/// Check if the daemon is registered on the session bus
pub async fn is_service_available() -> bool {
    if let Ok(connection) = Connection::session().await {
        connection
            .call_method(
                Some("org.freedesktop.DBus"),
                "/org/freedesktop/DBus",
                Some("org.freedesktop.DBus"),
                "NameHasOwner",
                &SERVICE_NAME,
            )
            .await
            .and_then(|reply| reply.body().deserialize::<bool>())
            .unwrap_or(false)
    } else {
        false
    }
}
