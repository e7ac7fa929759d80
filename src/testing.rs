//! In-memory fakes for the metadata source, downloader and desktop.

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

use crate::bing::{ImageDescriptor, MetadataSource};
use crate::cache::CacheStore;
use crate::config::{Resolution, SettingsStore};
use crate::download::ImageDownloader;
use crate::error::{Result, SyncError};
use crate::status::StatusStore;
use crate::sync::SyncEngine;
use crate::wallpaper::{DesktopBackend, Display};

pub const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F'];

type Failure = fn() -> SyncError;

#[derive(Default)]
pub struct FakeMetadata {
    calls: AtomicUsize,
    last_resolution: Mutex<Option<Resolution>>,
    failure: Mutex<Option<Failure>>,
}

impl FakeMetadata {
    pub fn descriptor_for(resolution: Resolution) -> ImageDescriptor {
        ImageDescriptor {
            identifier: format!("2024-05-01-{}", resolution.as_str()),
            url: format!("https://www.bing.com/th?id=OHR.Test_{}.jpg", resolution.url_suffix()),
            title: Some("Test image".to_string()),
        }
    }

    pub fn descriptor(&self) -> ImageDescriptor {
        Self::descriptor_for(Resolution::Uhd)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_resolution(&self) -> Option<Resolution> {
        *self.last_resolution.lock().unwrap()
    }

    pub fn fail_with(&self, failure: Failure) {
        *self.failure.lock().unwrap() = Some(failure);
    }
}

#[async_trait]
impl MetadataSource for FakeMetadata {
    async fn fetch_today(&self, resolution: Resolution) -> Result<ImageDescriptor> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_resolution.lock().unwrap() = Some(resolution);
        let failure = *self.failure.lock().unwrap();
        match failure {
            Some(make) => Err(make()),
            None => Ok(Self::descriptor_for(resolution)),
        }
    }
}

/// Lets a test hold a download open until it says otherwise.
#[derive(Default)]
pub struct Gate {
    pub started: Notify,
    pub release: Notify,
}

#[derive(Default)]
pub struct FakeDownloader {
    calls: AtomicUsize,
    failure: Mutex<Option<Failure>>,
    gate: Mutex<Option<Arc<Gate>>>,
}

impl FakeDownloader {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fail_with(&self, failure: Failure) {
        *self.failure.lock().unwrap() = Some(failure);
    }

    pub fn recover(&self) {
        *self.failure.lock().unwrap() = None;
    }

    /// Makes the next downloads wait for `gate.release`.
    pub fn gate(&self) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl ImageDownloader for FakeDownloader {
    async fn download(&self, _url: &str) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.started.notify_one();
            gate.release.notified().await;
        }
        let failure = *self.failure.lock().unwrap();
        match failure {
            Some(make) => Err(make()),
            None => Ok(JPEG.to_vec()),
        }
    }
}

#[derive(Default)]
pub struct FakeDesktop {
    displays: Mutex<Vec<Display>>,
    failing: Mutex<Vec<String>>,
    applied: Mutex<Vec<String>>,
    commits: AtomicUsize,
}

impl FakeDesktop {
    /// Displays with no primary flag set.
    pub fn new(names: &[&str]) -> Self {
        let desktop = Self::default();
        desktop.set_displays(names);
        desktop
    }

    pub fn with_displays(displays: Vec<Display>) -> Self {
        let desktop = Self::default();
        *desktop.displays.lock().unwrap() = displays;
        desktop
    }

    pub fn failing(self, names: &[&str]) -> Self {
        self.fail_on(names);
        self
    }

    pub fn fail_on(&self, names: &[&str]) {
        *self.failing.lock().unwrap() = names.iter().map(|n| n.to_string()).collect();
    }

    pub fn set_displays(&self, names: &[&str]) {
        *self.displays.lock().unwrap() = names.iter().map(|n| Display::new(*n, false)).collect();
    }

    /// Names of displays successfully set, in call order.
    pub fn applied(&self) -> Vec<String> {
        self.applied.lock().unwrap().clone()
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

impl DesktopBackend for FakeDesktop {
    fn displays(&self) -> std::result::Result<Vec<Display>, String> {
        Ok(self.displays.lock().unwrap().clone())
    }

    fn set_wallpaper(&self, display: &Display, _path: &Path) -> std::result::Result<(), String> {
        if self.failing.lock().unwrap().contains(&display.name) {
            return Err("unsupported display".to_string());
        }
        self.applied.lock().unwrap().push(display.name.clone());
        Ok(())
    }

    fn commit(&self, _applied: &[Display]) -> std::result::Result<(), String> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A sync engine wired to fakes inside a temp data directory.
pub struct Harness {
    pub tmp: TempDir,
    pub settings: Arc<SettingsStore>,
    pub status: Arc<StatusStore>,
    pub cache: Arc<CacheStore>,
    pub metadata: Arc<FakeMetadata>,
    pub downloader: Arc<FakeDownloader>,
    pub desktop: Arc<FakeDesktop>,
    pub engine: Arc<SyncEngine>,
}

impl Harness {
    pub fn new(displays: &[&str]) -> Self {
        let tmp = TempDir::new().unwrap();
        let settings = Arc::new(SettingsStore::open(tmp.path().join("settings.json")));
        let status = Arc::new(StatusStore::open(tmp.path().join("status.json")));
        let cache = Arc::new(CacheStore::open(tmp.path().join("cache")));
        let metadata = Arc::new(FakeMetadata::default());
        let downloader = Arc::new(FakeDownloader::default());
        let desktop = Arc::new(FakeDesktop::new(displays));
        let engine = Arc::new(SyncEngine::new(
            settings.clone(),
            status.clone(),
            cache.clone(),
            metadata.clone(),
            downloader.clone(),
            desktop.clone(),
        ));
        Self {
            tmp,
            settings,
            status,
            cache,
            metadata,
            downloader,
            desktop,
            engine,
        }
    }

    /// Status store reopened from disk, as after a restart.
    pub fn status_store(&self) -> StatusStore {
        StatusStore::open(self.tmp.path().join("status.json"))
    }
}

pub fn unreachable() -> SyncError {
    SyncError::Network("unreachable".to_string())
}

/// Serves one HTTP exchange on 127.0.0.1: reads the request head, writes
/// `response` verbatim, then closes the connection. Returns the base URL.
pub async fn serve_once(response: impl Into<Vec<u8>>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let response = response.into();
    tokio::spawn(async move {
        if let Ok((mut socket, _)) = listener.accept().await {
            read_request_head(&mut socket).await;
            let _ = socket.write_all(&response).await;
            let _ = socket.shutdown().await;
        }
    });
    format!("http://{addr}")
}

/// Accepts one connection and never answers it.
pub async fn serve_silence() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((mut socket, _)) = listener.accept().await {
            read_request_head(&mut socket).await;
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
    });
    format!("http://{addr}")
}

/// Builds a raw HTTP/1.1 response with the given extra headers and body.
pub fn http_response(status: &str, headers: &[&str], body: &[u8]) -> Vec<u8> {
    let mut head = format!("HTTP/1.1 {status}\r\nConnection: close\r\n");
    for header in headers {
        head.push_str(header);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    let mut response = head.into_bytes();
    response.extend_from_slice(body);
    response
}

async fn read_request_head(socket: &mut TcpStream) {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
}
