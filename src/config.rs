//! Run configuration.

use crate::error::GalleryError;
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_retry2::strategy::jitter_range;

/// Browser identification sent with every request unless overridden.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

/// Inclusive range a randomized delay is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct DelayRange {
    #[serde(deserialize_with = "deserialize_duration")]
    pub min: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub max: Duration,
}

impl DelayRange {
    /// No delay at all.
    pub const ZERO: DelayRange = DelayRange {
        min: Duration::ZERO,
        max: Duration::ZERO,
    };

    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    pub fn from_secs(min: u64, max: u64) -> Self {
        Self::new(Duration::from_secs(min), Duration::from_secs(max))
    }

    /// Draws a delay uniformly from `[min, max]`.
    pub fn sample(&self) -> Duration {
        let span = self.max.saturating_sub(self.min);
        self.min + jitter_range(0.0, 1.0)(span)
    }

    pub fn is_zero(&self) -> bool {
        self.max.is_zero()
    }
}

/// Configuration for a download run.
///
/// Every field has a default, so a JSON config only needs the knobs it
/// changes. Durations are written as human strings (`"20s"`, `"500ms"`).
///
/// # Example
///
/// ```
/// use galleryfetch::{DelayRange, PipelineConfig};
///
/// let config = PipelineConfig {
///     save_root: "downloads".into(),
///     image_concurrency: 4,
///     min_size: 40 * 1024,
///     retry_delay: DelayRange::from_secs(4, 8),
///     ..PipelineConfig::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Root directory every album directory is created under.
    pub save_root: PathBuf,
    /// Albums processed at the same time (outer pool).
    pub album_concurrency: usize,
    /// Images fetched at the same time within one album (inner pool).
    pub image_concurrency: usize,
    /// Size of the shared connection pool. Caps the product of both pools.
    pub max_connections: usize,
    /// Decode-verify fetched content before persisting it.
    pub verify: bool,
    /// Content smaller than this many bytes is rejected.
    pub min_size: u64,
    /// Total fetch attempts per task.
    pub retries: usize,
    #[serde(deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
    /// Pause between fetch attempts.
    pub retry_delay: DelayRange,
    /// Pause before each album starts.
    pub album_delay: DelayRange,
    pub user_agent: String,
    /// Default `Referer` header, usually the site root.
    pub referer: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            save_root: PathBuf::from("downloads"),
            album_concurrency: 4,
            image_concurrency: 8,
            max_connections: 64,
            verify: true,
            min_size: 0,
            retries: 5,
            timeout: Duration::from_secs(20),
            retry_delay: DelayRange::from_secs(4, 8),
            album_delay: DelayRange::from_secs(4, 8),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            referer: None,
        }
    }
}

impl PipelineConfig {
    /// Parses and validates a JSON config.
    pub fn from_json_str(json: &str) -> Result<Self, GalleryError> {
        let config: PipelineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, GalleryError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Rejects settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), GalleryError> {
        if self.album_concurrency == 0 || self.image_concurrency == 0 {
            return Err(GalleryError::InvalidConfig(
                "album_concurrency and image_concurrency must be at least 1".to_string(),
            ));
        }
        if self.max_connections == 0 {
            return Err(GalleryError::InvalidConfig(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.retries == 0 {
            return Err(GalleryError::InvalidConfig(
                "retries must be at least 1 (it counts the first attempt)".to_string(),
            ));
        }
        for (name, range) in [
            ("retry_delay", &self.retry_delay),
            ("album_delay", &self.album_delay),
        ] {
            if range.min > range.max {
                return Err(GalleryError::InvalidConfig(format!(
                    "{}: min {:?} is greater than max {:?}",
                    name, range.min, range.max
                )));
            }
        }
        if self.timeout.is_zero() {
            return Err(GalleryError::InvalidConfig(
                "timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Upper bound on fetches in flight across both pools.
    pub fn in_flight_limit(&self) -> usize {
        self.album_concurrency
            .saturating_mul(self.image_concurrency)
            .min(self.max_connections)
            .max(1)
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
}
