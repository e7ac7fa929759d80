//! # Bingscape
//!
//! Keeps the desktop wallpaper in sync with Bing's image of the day.
//!
//! ## Architecture
//! One daemon process owns all state and does all the work:
//!
//! - `bing.rs` - Bing API client (today's image descriptor)
//! - `download.rs` - Streaming image download with integrity checks
//! - `cache.rs` - Identifier → file cache with atomic publish
//! - `wallpaper.rs` - Applies an image to the main or all displays
//! - `desktop.rs` - Platform backends (COSMIC, macOS)
//! - `sync.rs` - The sync engine: fetch → cache → download → apply → status
//! - `scheduler.rs` - Hourly background trigger
//! - `status.rs` - Persisted outcome of the last sync
//! - `config.rs` - Settings persistence and data-directory layout
//! - `service.rs` - Command surface + D-Bus interface
//! - `dbus_client.rs` - Client proxy used by the CLI to reach the daemon
//!
//! ## CLI Usage
//! - No arguments / `--daemon`: run the daemon
//! - `--sync`, `-f`: sync now (through the daemon if it is running)
//! - `--status`, `--settings`: show state
//! - `--auto on|off`, `--resolution UHD|HD`, `--clear-cache`: change state

mod bing;        // Bing API client (fetches today's image descriptor)
mod cache;       // On-disk image cache keyed by identifier
mod config;      // Settings and data-directory layout
mod dbus_client; // D-Bus client proxy (CLI → daemon)
mod desktop;     // COSMIC / macOS wallpaper backends
mod download;    // Verified image downloads
mod error;       // SyncError taxonomy
mod scheduler;   // Hourly sync trigger
mod service;     // Command surface + D-Bus service
mod status;      // Last sync outcome
mod sync;        // The sync engine
mod wallpaper;   // Per-display apply policy

#[cfg(test)]
mod testing;

use anyhow::{bail, Context};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use crate::config::Resolution;
use crate::dbus_client::WallpaperClient;
use crate::service::{Service, WallpaperService, OBJECT_PATH, SERVICE_NAME};
use crate::status::SyncStatus;

/// Maximum number of attempts for an in-process sync
const MAX_RETRIES: u32 = 3;

/// Initial delay between retries in seconds; doubles each attempt (10s, 20s).
const INITIAL_RETRY_DELAY_SECS: u64 = 10;

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let args: Vec<String> = std::env::args().collect();
    match run(&args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(args: &[String]) -> anyhow::Result<ExitCode> {
    let Some(command) = args.get(1) else {
        run_daemon().await?;
        return Ok(ExitCode::SUCCESS);
    };
    let rest = &args[2..];

    match command.as_str() {
        "--daemon" | "-d" => {
            run_daemon().await?;
        }
        "--sync" | "--fetch" | "-f" => {
            let status = Endpoint::open().await?.sync(display_override(rest)).await?;
            print_status(&status);
            if status.last_error.is_some() {
                return Ok(ExitCode::FAILURE);
            }
        }
        "--status" => {
            let endpoint = Endpoint::open().await?;
            print_status(&endpoint.get_status().await?);
            if let Endpoint::Local(service) = &endpoint {
                let cached = service.cache().entries();
                println!("Cached:    {} image(s)", cached.len());
                if let Some(newest) = cached.first() {
                    println!("Newest:    {} ({})", newest.identifier, newest.downloaded_at);
                }
            }
        }
        "--settings" => {
            let settings = Endpoint::open().await?.get_settings().await?;
            println!("Auto sync:   {}", if settings.auto_enabled { "on" } else { "off" });
            println!("Displays:    {}", if settings.apply_all { "all" } else { "main" });
            println!("Resolution:  {}", settings.resolution);
        }
        "--auto" => {
            let enabled = match rest.first().map(String::as_str) {
                Some("on") => true,
                Some("off") => false,
                _ => bail!("--auto expects 'on' or 'off'"),
            };
            let endpoint = Endpoint::open().await?;
            let apply_all = match display_override(&rest[1..]) {
                Some(apply_all) => apply_all,
                None => endpoint.get_settings().await?.apply_all,
            };
            endpoint.set_auto_sync(enabled, apply_all).await?;
            println!("Auto sync {}", if enabled { "enabled" } else { "disabled" });
        }
        "--resolution" => {
            let resolution: Resolution = rest
                .first()
                .context("--resolution expects UHD or HD")?
                .parse()?;
            Endpoint::open().await?.set_resolution(resolution).await?;
            println!("Resolution set to {resolution}");
        }
        "--clear-cache" => {
            println!("{}", Endpoint::open().await?.clear_cache().await?);
        }
        "--help" | "-h" => print_help(&args[0]),
        "--version" | "-v" => println!("bingscape {}", env!("CARGO_PKG_VERSION")),
        other => {
            eprintln!("Unknown argument: {other}");
            eprintln!("Use --help for usage information");
            return Ok(ExitCode::FAILURE);
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// `--main` / `--all` after a command override the saved display target.
fn display_override(rest: &[String]) -> Option<bool> {
    rest.iter().rev().find_map(|arg| match arg.as_str() {
        "--all" => Some(true),
        "--main" => Some(false),
        _ => None,
    })
}

fn print_help(program: &str) {
    println!("Bing daily wallpaper sync\n");
    println!("Usage: {program} [OPTIONS]\n");
    println!("Options:");
    println!("  (none), --daemon, -d      Run the daemon (D-Bus service + hourly sync)");
    println!("  --sync, -f [--main|--all] Sync now");
    println!("  --status                  Show the result of the last sync");
    println!("  --settings                Show current settings");
    println!("  --auto on|off [--main|--all]");
    println!("                            Enable or disable hourly sync");
    println!("  --resolution UHD|HD       Set the image resolution");
    println!("  --clear-cache             Delete downloaded images");
    println!("  --version, -v             Show version information");
    println!("  --help, -h                Show this help message");
    println!();
    println!("Commands go through the running daemon when there is one.");
}

fn print_status(status: &SyncStatus) {
    println!("Last run:  {}", status.last_run.as_deref().unwrap_or("never"));
    if let Some(summary) = status.summary() {
        println!("Result:    {summary}");
    }
    if let Some(url) = &status.last_url {
        println!("Image:     {url}");
    }
    if let Some(path) = &status.last_saved_path {
        println!("Saved to:  {path}");
    }
}

/// Where CLI commands are executed: the running daemon, or this process.
enum Endpoint {
    Daemon(WallpaperClient),
    Local(Service),
}

impl Endpoint {
    async fn open() -> anyhow::Result<Self> {
        if dbus_client::is_service_available().await {
            match WallpaperClient::connect().await {
                Ok(client) => return Ok(Endpoint::Daemon(client)),
                Err(e) => tracing::warn!("daemon registered but unreachable: {e}"),
            }
        }
        Ok(Endpoint::Local(Service::open_default()?))
    }

    async fn sync(&self, apply_all: Option<bool>) -> anyhow::Result<SyncStatus> {
        let apply_all = match apply_all {
            Some(apply_all) => apply_all,
            None => self.get_settings().await?.apply_all,
        };
        match self {
            Endpoint::Daemon(client) => Ok(client.sync_wallpaper(apply_all).await?),
            Endpoint::Local(service) => sync_in_process(service, apply_all).await,
        }
    }

    async fn get_status(&self) -> anyhow::Result<SyncStatus> {
        match self {
            Endpoint::Daemon(client) => Ok(client.get_status().await?),
            Endpoint::Local(service) => Ok(service.get_status()),
        }
    }

    async fn get_settings(&self) -> anyhow::Result<config::Settings> {
        match self {
            Endpoint::Daemon(client) => Ok(client.get_settings().await?),
            Endpoint::Local(service) => Ok(service.get_settings()),
        }
    }

    async fn set_auto_sync(&self, enabled: bool, apply_all: bool) -> anyhow::Result<()> {
        match self {
            Endpoint::Daemon(client) => client.set_auto_sync(enabled, apply_all).await?,
            Endpoint::Local(service) => {
                service.set_auto_sync(enabled, apply_all)?;
            }
        }
        Ok(())
    }

    async fn set_resolution(&self, resolution: Resolution) -> anyhow::Result<()> {
        match self {
            Endpoint::Daemon(client) => client.set_resolution(resolution).await?,
            Endpoint::Local(service) => {
                service.set_resolution(resolution)?;
            }
        }
        Ok(())
    }

    async fn clear_cache(&self) -> anyhow::Result<String> {
        match self {
            Endpoint::Daemon(client) => Ok(client.clear_cache().await?),
            Endpoint::Local(service) => Ok(service.clear_cache().await?),
        }
    }
}

/// One-shot sync without a daemon, retrying network failures with backoff.
async fn sync_in_process(service: &Service, apply_all: bool) -> anyhow::Result<SyncStatus> {
    let mut report = service.sync_with_report(apply_all).await?;
    for attempt in 1..MAX_RETRIES {
        if !report.failed_stage.is_some_and(|stage| stage.is_transient()) {
            break;
        }
        let delay = INITIAL_RETRY_DELAY_SECS * (1 << (attempt - 1));
        if let Some(error) = &report.status.last_error {
            eprintln!("{error}");
        }
        println!("Retry {} of {} in {} seconds...", attempt, MAX_RETRIES - 1, delay);
        tokio::time::sleep(Duration::from_secs(delay)).await;
        report = service.sync_with_report(apply_all).await?;
    }
    Ok(report.status)
}

/// Runs the daemon until SIGINT/SIGTERM.
async fn run_daemon() -> anyhow::Result<()> {
    let service = Arc::new(Service::open_default()?);

    let connection = zbus::connection::Builder::session()?
        .name(SERVICE_NAME)?
        .serve_at(OBJECT_PATH, WallpaperService::new(service.clone()))?
        .build()
        .await
        .context("failed to register on the session bus (is another instance running?)")?;
    tracing::info!("daemon listening on {SERVICE_NAME}");

    // Forward every new status to D-Bus listeners, whoever triggered the sync.
    let mut updates = service.engine().subscribe();
    let signal_connection = connection.clone();
    tokio::spawn(async move {
        while updates.changed().await.is_ok() {
            let status = updates.borrow_and_update().clone();
            if let Err(e) = service::emit_status_changed(&signal_connection, &status).await {
                tracing::warn!("failed to emit StatusChanged: {e}");
            }
        }
    });

    service.scheduler().start();
    shutdown_signal().await;
    service.scheduler().stop();
    tracing::info!("daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("cannot listen for SIGTERM: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
