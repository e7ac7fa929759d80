//! Streaming image download with integrity checks.
//!
//! The body is accumulated in memory; nothing touches the cache directory
//! until the payload has been verified, so an interrupted transfer can never
//! leave a partial image behind.
//!
//! Failures are classified as:
//! - `Network`: error status, connection dropped mid-body, timeout
//! - `Integrity`: empty body, length mismatch, not a JPEG/PNG

use async_trait::async_trait;
use futures_util::StreamExt;

use crate::bing::BingClient;
use crate::error::{Result, SyncError};

#[async_trait]
pub trait ImageDownloader: Send + Sync {
    /// Downloads `url` and returns the verified image bytes.
    async fn download(&self, url: &str) -> Result<Vec<u8>>;
}

#[async_trait]
impl ImageDownloader for BingClient {
    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Network(format!("download returned {status}")));
        }

        let declared = response.content_length();
        let mut bytes = Vec::with_capacity(declared.unwrap_or(0).min(64 * 1024 * 1024) as usize);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            // A body error means the transfer itself broke (reset, early close,
            // stall), so it is a network failure even when bytes already arrived.
            let chunk = chunk.map_err(|e| {
                if e.is_timeout() {
                    SyncError::Network("download timed out - check your internet connection".to_string())
                } else {
                    SyncError::Network(format!("connection lost after {} bytes: {e}", bytes.len()))
                }
            })?;
            bytes.extend_from_slice(&chunk);
        }

        verify_image(&bytes, declared)?;
        tracing::debug!(url, len = bytes.len(), "image downloaded");
        Ok(bytes)
    }
}

/// Checks that `bytes` is a complete JPEG or PNG.
///
/// `declared` is the server's Content-Length, when it sent one.
pub fn verify_image(bytes: &[u8], declared: Option<u64>) -> Result<()> {
    if bytes.is_empty() {
        return Err(SyncError::Integrity("downloaded file is empty".to_string()));
    }
    if let Some(expected) = declared {
        if expected != bytes.len() as u64 {
            return Err(SyncError::Integrity(format!(
                "expected {expected} bytes, received {}",
                bytes.len()
            )));
        }
    }
    // JPEG starts with FF D8 FF, PNG with 89 50 4E 47
    let is_jpeg = bytes.starts_with(&[0xFF, 0xD8, 0xFF]);
    let is_png = bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47]);
    if !is_jpeg && !is_png {
        return Err(SyncError::Integrity(
            "downloaded content is not a valid image (may be an error page)".to_string(),
        ));
    }
    Ok(())
}
