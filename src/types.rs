//! Data structures shared by the download pipeline.

use crate::error::FetchError;
use std::fmt;
use std::path::{Path, PathBuf};

/// One image to fetch and where it must end up.
///
/// Tasks are immutable once built; a task source creates them and the
/// pipeline consumes them.
///
/// # Example
///
/// ```
/// use galleryfetch::DownloadTask;
///
/// let task = DownloadTask::new("https://example.com/img/12345.jpg", "/out/album/001.jpg")
///     .with_min_size(40 * 1024)
///     .with_verify(true);
/// assert_eq!(task.min_size(), 40960);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    url: String,
    dest: PathBuf,
    min_size: u64,
    verify: bool,
    referer: Option<String>,
}

impl DownloadTask {
    /// Creates a task with no size floor and verification enabled.
    pub fn new(url: impl Into<String>, dest: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            dest: dest.into(),
            min_size: 0,
            verify: true,
            referer: None,
        }
    }

    pub fn with_min_size(mut self, min_size: u64) -> Self {
        self.min_size = min_size;
        self
    }

    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Overrides the fetcher's default `Referer` for this task.
    pub fn with_referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = Some(referer.into());
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }

    pub fn min_size(&self) -> u64 {
        self.min_size
    }

    pub fn verify(&self) -> bool {
        self.verify
    }

    pub fn referer(&self) -> Option<&str> {
        self.referer.as_deref()
    }
}

/// Why a task did not produce a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Fetch failed terminally (retries exhausted or permanent HTTP error).
    Fetch(FetchError),
    /// Fetched content was below the task's size floor.
    TooSmall { actual: u64, minimum: u64 },
    /// Content was not the expected image (wrong content type, HTML page,
    /// bad signature or failed decode).
    InvalidContent(String),
    /// Writing or renaming the file failed.
    Filesystem(String),
    /// The task panicked.
    Exception(String),
}

impl FailureReason {
    /// Short machine-friendly tag for summaries.
    pub fn tag(&self) -> &'static str {
        match self {
            FailureReason::Fetch(_) => "fetch_error",
            FailureReason::TooSmall { .. } => "too_small",
            FailureReason::InvalidContent(_) => "invalid_content",
            FailureReason::Filesystem(_) => "filesystem",
            FailureReason::Exception(_) => "exception",
        }
    }

    /// Whether running the task again later could succeed.
    ///
    /// Content that was the wrong kind or too small, and URLs the server
    /// reported as gone, will not change on another pass.
    pub fn is_retryable(&self) -> bool {
        match self {
            FailureReason::Fetch(e) => e.is_retryable(),
            FailureReason::TooSmall { .. } | FailureReason::InvalidContent(_) => false,
            FailureReason::Filesystem(_) | FailureReason::Exception(_) => true,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::TooSmall { actual, minimum } => {
                write!(f, "too_small: {} bytes < {} bytes", actual, minimum)
            }
            FailureReason::Fetch(e) => write!(f, "{}: {}", self.tag(), e),
            FailureReason::InvalidContent(msg)
            | FailureReason::Filesystem(msg)
            | FailureReason::Exception(msg) => write!(f, "{}: {}", self.tag(), msg),
        }
    }
}

/// Outcome of running one task through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadResult {
    /// A new file was written.
    Success { bytes: u64, md5: String },
    /// The destination already held an acceptable file.
    Skipped,
    Failed(FailureReason),
}

impl DownloadResult {
    pub fn is_success(&self) -> bool {
        matches!(self, DownloadResult::Success { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, DownloadResult::Skipped)
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match self {
            DownloadResult::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Result of validating a buffer or file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub reason: Option<String>,
}

impl ValidationOutcome {
    pub fn valid() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

/// A named group of tasks that lands in one output directory.
#[derive(Debug, Clone)]
pub struct Album {
    pub title: String,
    /// Tag or category the album was found under, if the source has one.
    pub group: Option<String>,
    pub tasks: Vec<DownloadTask>,
}
