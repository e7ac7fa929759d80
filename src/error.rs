//! # Error Types
//!
//! One error enum covers every stage of a sync. Stage errors never escape
//! [`crate::sync::SyncEngine::sync`]; they are folded into the status record.
//! Settings and cache-maintenance errors are returned to the caller as-is.

use std::fmt;
use thiserror::Error;

/// A single display that could not be updated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayFailure {
    /// Output name as reported by the platform (e.g. "DP-1", "desktop 2")
    pub display: String,
    /// Human-readable reason from the platform call
    pub reason: String,
}

impl fmt::Display for DisplayFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.display, self.reason)
    }
}

/// Joins per-display failures into "a: x; b: y".
pub fn join_failures(failures: &[DisplayFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum SyncError {
    /// Remote service unreachable, timed out, or answered with an error status
    #[error("network error: {0}")]
    Network(String),

    /// Metadata response was malformed or missing fields
    #[error("malformed metadata: {0}")]
    Parse(String),

    /// Downloaded payload was empty, truncated, or not an image
    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wallpaper could not be applied; lists every display that failed
    #[error("wallpaper apply failed on {}", join_failures(.0))]
    Platform(Vec<DisplayFailure>),

    /// Another sync is already running
    #[error("a sync is already in progress")]
    Busy,

    /// Settings or status could not be read or written
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SyncError::Network("request timed out - check your internet connection".to_string())
        } else if e.is_decode() {
            SyncError::Parse(e.to_string())
        } else {
            SyncError::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
