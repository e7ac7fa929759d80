//! # Bing API Client
//!
//! Fetches today's image descriptor from the Bing Homepage Image Archive and
//! downloads image bytes.
//!
//! ## API Endpoint
//! ```text
//! https://www.bing.com/HPImageArchive.aspx?format=js&idx=0&n=1&mkt=en-US
//! ```
//!
//! ## Image URLs
//! The API returns partial URLs like
//! `/th?id=OHR.LlamaDay_EN-US5971354659_1920x1080.jpg&rf=...`.
//! The `_WxH.jpg` suffix selects the resolution; it is rewritten to `_UHD.jpg`
//! or `_1920x1080.jpg` and `https://www.bing.com` is prepended.

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;
use std::time::Duration;

use crate::config::Resolution;
use crate::error::{Result, SyncError};

/// Base URL for the Bing Homepage Image Archive API.
const BING_API_URL: &str = "https://www.bing.com/HPImageArchive.aspx";

const BING_HOST: &str = "https://www.bing.com";

const DEFAULT_MARKET: &str = "en-US";

/// Matches the `_WxH.jpg` / `_UHD.jpg` size suffix in image URLs.
static SIZE_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_(?:\d+x\d+|UHD)\.jpg").expect("size suffix pattern is valid"));

/// HTTP request timeout in seconds
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Today's image, as resolved for one resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDescriptor {
    /// Cache key, e.g. "2024-05-01-UHD". Distinct per day and resolution.
    pub identifier: String,
    /// Absolute download URL
    pub url: String,
    pub title: Option<String>,
}

/// Source of the daily image descriptor.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Fetches today's image descriptor.
    ///
    /// # Arguments
    /// * `resolution` - Size to request; selects the URL suffix and identifier
    ///
    /// # Returns
    /// * `Ok(ImageDescriptor)` - Identifier, absolute image URL and title
    /// * `Err(SyncError::Network)` - Unreachable, timed out, or non-2xx status
    /// * `Err(SyncError::Parse)` - Response was not a usable archive entry
    ///
    /// # Example
    /// ```ignore
    /// let today = BingClient::new()?.fetch_today(Resolution::Uhd).await?;
    /// println!("Today's image: {}", today.identifier);
    /// ```
    async fn fetch_today(&self, resolution: Resolution) -> Result<ImageDescriptor>;
}

#[derive(Debug, Deserialize)]
struct BingApiResponse {
    #[serde(default)]
    images: Vec<BingImageData>,
}

#[derive(Debug, Deserialize)]
struct BingImageData {
    /// Partial URL path (needs `https://www.bing.com` prefix)
    url: String,
    #[serde(default)]
    copyright: Option<String>,
    #[serde(default)]
    title: Option<String>,
    /// Date when this image was featured (format: YYYYMMDD)
    #[serde(rename = "startdate")]
    start_date: String,
}

/// HTTP client for the Bing API.
///
/// One `reqwest::Client` (with the request timeout) is shared by the
/// metadata fetch and the image download.
#[derive(Debug, Clone)]
pub struct BingClient {
    pub(crate) client: reqwest::Client,
    api_url: String,
    market: String,
}

impl BingClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(concat!("bingscape/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::Network(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_url: BING_API_URL.to_string(),
            market: DEFAULT_MARKET.to_string(),
        })
    }

    /// Client aimed at a local test server, bypassing any configured proxy.
    #[cfg(test)]
    pub(crate) fn local(api_url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()
            .unwrap();
        Self {
            client,
            api_url: api_url.into(),
            market: DEFAULT_MARKET.to_string(),
        }
    }
}

#[async_trait]
impl MetadataSource for BingClient {
    async fn fetch_today(&self, resolution: Resolution) -> Result<ImageDescriptor> {
        let url = format!("{}?format=js&idx=0&n=1&mkt={}", self.api_url, self.market);

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Network(format!("Bing API returned {status}")));
        }

        let body = response.text().await?;
        let descriptor = parse_descriptor(&body, resolution)?;
        tracing::debug!(identifier = %descriptor.identifier, url = %descriptor.url, "metadata fetched");
        Ok(descriptor)
    }
}

/// Parses an archive response body into a descriptor for `resolution`.
pub fn parse_descriptor(body: &str, resolution: Resolution) -> Result<ImageDescriptor> {
    let response: BingApiResponse = serde_json::from_str(body)
        .map_err(|e| SyncError::Parse(format!("failed to parse Bing response: {e}")))?;

    let image = response
        .images
        .into_iter()
        .next()
        .ok_or_else(|| SyncError::Parse("no images in Bing response".to_string()))?;

    if image.url.trim().is_empty() {
        return Err(SyncError::Parse("image entry has an empty url".to_string()));
    }

    let date = format_start_date(&image.start_date)?;
    let path = rewrite_resolution(&image.url, resolution);
    let url = if path.starts_with("http://") || path.starts_with("https://") {
        path
    } else {
        format!("{BING_HOST}{path}")
    };

    let title = image
        .title
        .filter(|t| !t.trim().is_empty())
        .or(image.copyright.filter(|c| !c.trim().is_empty()));

    Ok(ImageDescriptor {
        identifier: format!("{date}-{}", resolution.as_str()),
        url,
        title,
    })
}

/// "20240501" -> "2024-05-01"
fn format_start_date(raw: &str) -> Result<String> {
    if raw.len() != 8 || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(SyncError::Parse(format!("unexpected startdate: {raw:?}")));
    }
    Ok(format!("{}-{}-{}", &raw[0..4], &raw[4..6], &raw[6..8]))
}

/// Replaces the `_WxH.jpg` (or `_UHD.jpg`) size suffix with the one for `resolution`.
///
/// URLs without a recognisable suffix are returned unchanged.
pub fn rewrite_resolution(path: &str, resolution: Resolution) -> String {
    let replacement = format!("_{}.jpg", resolution.url_suffix());
    SIZE_SUFFIX.replace(path, replacement.as_str()).into_owned()
}
