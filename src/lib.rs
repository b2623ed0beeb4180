//! galleryfetch - concurrent image gallery downloader
//!
//! This library turns discovered image URLs into verified files on disk,
//! exactly once, under retries, concurrency and partial failure.
//!
//! # Features
//!
//! - **Skip-if-valid**: files already on disk and valid are never re-fetched
//! - **Content Verification**: signature sniffing plus a full image decode
//! - **Atomic Writes**: content is written to a temp sibling, then renamed
//! - **Automatic Retry**: bounded attempts with randomized backoff
//! - **Nested Worker Pools**: albums and images in parallel, sharing one
//!   connection pool and one in-flight cap
//!
//! # Example
//!
//! ```no_run
//! use galleryfetch::{
//!     FsPersister, HttpFetcher, ImageValidator, ManifestSource, Pipeline, PipelineConfig,
//!     RunContext,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PipelineConfig::default();
//! let source = ManifestSource::from_json_file("albums.json", &config)?;
//! let validator = ImageValidator::default();
//! let pipeline = Pipeline::new(
//!     config.clone(),
//!     HttpFetcher::new(&config)?,
//!     validator,
//!     FsPersister::new(validator),
//! );
//!
//! let ctx = RunContext::new();
//! let report = pipeline.run_source(&ctx, &source).await;
//! println!("{}", report.tally);
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod fetch;
mod persist;
mod pipeline;
mod report;
mod source;
mod types;
mod validate;

pub use config::{DelayRange, PipelineConfig, DEFAULT_USER_AGENT};
pub use error::{FetchError, GalleryError, PersistError};
pub use fetch::{fetch_with_retry, looks_like_html, Fetcher, HttpFetcher, RetryPolicy};
pub use persist::{sweep_partials, FsPersister, PersistOutcome, Persister};
pub use pipeline::Pipeline;
pub use report::{Abandoned, BatchReport, RunContext, RunReport, Tally, TaskReport};
pub use source::{filename_from_url, sanitize_filename, ManifestSource, TaskSource, MAX_NAME_LEN};
pub use types::{Album, DownloadResult, DownloadTask, FailureReason, ValidationOutcome};
pub use validate::{sniff, ImageKind, ImageValidator, Validator};
