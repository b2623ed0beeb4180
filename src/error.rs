//! Error types for gallery downloads.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by a single fetch attempt or a fetch retry loop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Connection, timeout or truncated-body failure. Retryable.
    #[error("network error: {0}")]
    Network(String),

    /// Non-2xx HTTP status.
    #[error("HTTP status {0}")]
    Status(u16),

    /// The server answered with something other than the expected resource,
    /// typically an HTML error page. Retrying the same URL will not help.
    #[error("content mismatch: {0}")]
    ContentMismatch(String),
}

impl FetchError {
    /// Whether another attempt against the same URL could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Network(_) => true,
            FetchError::Status(code) => !matches!(code, 404 | 410),
            FetchError::ContentMismatch(_) => false,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => FetchError::Status(status.as_u16()),
            None => FetchError::Network(err.to_string()),
        }
    }
}

/// Failure to place bytes at their final path.
#[derive(Error, Debug)]
#[error("failed to persist {}: {source}", path.display())]
pub struct PersistError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

impl PersistError {
    pub(crate) fn new(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self {
            path: path.into(),
            source,
        }
    }
}

/// Errors that stop a run before or outside the per-task pipeline.
#[derive(Error, Debug)]
pub enum GalleryError {
    /// I/O error while reading configuration or manifests.
    #[error(transparent)]
    IoError(#[from] io::Error),

    /// HTTP client construction error.
    #[error(transparent)]
    ReqwestError(#[from] reqwest::Error),

    /// JSON serialization/deserialization error.
    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),

    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
