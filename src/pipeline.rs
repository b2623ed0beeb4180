//! Fetch → filter → validate → persist, for one task and for whole batches.

use crate::config::PipelineConfig;
use crate::error::FetchError;
use crate::fetch::{fetch_with_retry, Fetcher, RetryPolicy};
use crate::persist::{PersistOutcome, Persister};
use crate::report::{BatchReport, RunContext, RunReport, TaskReport};
use crate::source::TaskSource;
use crate::types::{DownloadResult, DownloadTask, FailureReason};
use crate::validate::Validator;
use futures_util::stream::{self, Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Runs download tasks against abstract fetch, validation and persistence
/// capabilities.
///
/// Size floors come from each task's `min_size`; the validator should only
/// judge content, so build it without a floor of its own.
///
/// Cloning is cheap; clones share the fetcher (and so its connection pool)
/// and the pipeline-wide cap on in-flight fetches.
///
/// # Example
///
/// ```no_run
/// use galleryfetch::{
///     DownloadTask, FsPersister, HttpFetcher, ImageValidator, Pipeline, PipelineConfig, RunContext,
/// };
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = PipelineConfig::default();
/// let validator = ImageValidator::default();
/// let pipeline = Pipeline::new(
///     config.clone(),
///     HttpFetcher::new(&config)?,
///     validator,
///     FsPersister::new(validator),
/// );
///
/// let ctx = RunContext::new();
/// let tasks = vec![DownloadTask::new("https://example.com/img/1.jpg", "downloads/album/1.jpg")];
/// let report = pipeline.run_batch(&ctx, "album", tasks, 8).await;
/// println!("{}", report.tally);
/// # Ok(())
/// # }
/// ```
pub struct Pipeline<F, V, P> {
    fetcher: Arc<F>,
    validator: Arc<V>,
    persister: Arc<P>,
    config: Arc<PipelineConfig>,
    fetch_slots: Arc<Semaphore>,
}

impl<F, V, P> Clone for Pipeline<F, V, P> {
    fn clone(&self) -> Self {
        Self {
            fetcher: Arc::clone(&self.fetcher),
            validator: Arc::clone(&self.validator),
            persister: Arc::clone(&self.persister),
            config: Arc::clone(&self.config),
            fetch_slots: Arc::clone(&self.fetch_slots),
        }
    }
}

/// Wraps a fetcher so each attempt holds one of the pipeline's fetch slots.
///
/// Slots are released during retry backoff.
struct Throttled<'a, F> {
    inner: &'a F,
    slots: &'a Semaphore,
}

impl<F: Fetcher> Fetcher for Throttled<'_, F> {
    async fn fetch_once(
        &self,
        url: &str,
        referer: Option<&str>,
        timeout: Duration,
    ) -> Result<Vec<u8>, FetchError> {
        let _slot = self
            .slots
            .acquire()
            .await
            .map_err(|_| FetchError::Network("fetch slots closed".to_string()))?;
        self.inner.fetch_once(url, referer, timeout).await
    }
}

impl<F, V, P> Pipeline<F, V, P>
where
    F: Fetcher + 'static,
    V: Validator,
    P: Persister,
{
    pub fn new(config: PipelineConfig, fetcher: F, validator: V, persister: P) -> Self {
        let fetch_slots = Arc::new(Semaphore::new(config.in_flight_limit()));
        Self {
            fetcher: Arc::new(fetcher),
            validator: Arc::new(validator),
            persister: Arc::new(persister),
            config: Arc::new(config),
            fetch_slots,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs one task to completion. Never panics on bad input and never
    /// returns an error; every problem becomes [`DownloadResult::Failed`].
    pub async fn run(&self, task: &DownloadTask) -> DownloadResult {
        let dest = task.dest().display();

        if self.is_already_present(task).await {
            info!("Skipped (already present): {}", dest);
            return DownloadResult::Skipped;
        }

        let fetcher = Throttled {
            inner: self.fetcher.as_ref(),
            slots: self.fetch_slots.as_ref(),
        };
        let policy = RetryPolicy::from_config(&self.config);
        let bytes = match fetch_with_retry(
            &fetcher,
            task.url(),
            task.referer(),
            self.config.timeout,
            &policy,
        )
        .await
        {
            Ok(bytes) => bytes,
            Err(FetchError::ContentMismatch(reason)) => {
                warn!("Rejected {}: {}", task.url(), reason);
                return DownloadResult::Failed(FailureReason::InvalidContent(reason));
            }
            Err(e) => {
                warn!("Gave up on {}: {}", task.url(), e);
                return DownloadResult::Failed(FailureReason::Fetch(e));
            }
        };

        // A zero-byte body is never a usable file, even with no size floor.
        let minimum = task.min_size().max(1);
        let actual = bytes.len() as u64;
        if actual < minimum {
            warn!(
                "Discarded {}: {} bytes is below the {} byte minimum",
                task.url(),
                actual,
                minimum
            );
            return DownloadResult::Failed(FailureReason::TooSmall { actual, minimum });
        }

        let bytes = if task.verify() {
            let validator = Arc::clone(&self.validator);
            let checked =
                tokio::task::spawn_blocking(move || {
                    let outcome = validator.validate(&bytes);
                    (bytes, outcome)
                })
                .await;
            match checked {
                Ok((bytes, outcome)) if outcome.is_valid() => bytes,
                Ok((_, outcome)) => {
                    let reason = outcome
                        .reason
                        .unwrap_or_else(|| "validation failed".to_string());
                    warn!("Discarded {}: {}", task.url(), reason);
                    return DownloadResult::Failed(FailureReason::InvalidContent(reason));
                }
                Err(e) => {
                    error!("Validation task for {} failed: {}", task.url(), e);
                    return DownloadResult::Failed(FailureReason::Exception(e.to_string()));
                }
            }
        } else {
            bytes
        };

        match self.persister.persist(task.dest(), bytes).await {
            Ok(PersistOutcome::Written { bytes, md5 }) => {
                info!("Saved {} ({} bytes, md5 {})", dest, bytes, md5);
                DownloadResult::Success { bytes, md5 }
            }
            Ok(PersistOutcome::AlreadyPresent) => {
                info!("Skipped (written concurrently): {}", dest);
                DownloadResult::Skipped
            }
            Err(e) => {
                error!("{}", e);
                DownloadResult::Failed(FailureReason::Filesystem(e.to_string()))
            }
        }
    }

    /// Whether the destination already holds an acceptable file.
    ///
    /// With verification on the file must validate; with it off a
    /// non-empty file of at least `min_size` bytes is enough.
    async fn is_already_present(&self, task: &DownloadTask) -> bool {
        let validator = Arc::clone(&self.validator);
        let dest = task.dest().to_path_buf();
        let minimum = task.min_size().max(1);
        let verify = task.verify();

        tokio::task::spawn_blocking(move || {
            let metadata = match std::fs::metadata(&dest) {
                Ok(m) if m.is_file() => m,
                _ => return false,
            };
            if metadata.len() < minimum {
                return false;
            }
            if !verify {
                return true;
            }
            let outcome = validator.validate_file(&dest);
            let valid = outcome.is_valid();
            if !valid {
                debug!(
                    "Existing file {} is invalid: {}",
                    dest.display(),
                    outcome.reason.as_deref().unwrap_or_default()
                );
            }
            valid
        })
        .await
        .unwrap_or(false)
    }

    /// Runs a materialized batch of tasks with at most `concurrency` in
    /// flight. See [`Pipeline::run_stream`].
    pub async fn run_batch<I>(
        &self,
        ctx: &RunContext,
        label: &str,
        tasks: I,
        concurrency: usize,
    ) -> BatchReport
    where
        I: IntoIterator<Item = DownloadTask>,
    {
        self.run_stream(ctx, label, stream::iter(tasks), concurrency)
            .await
    }

    /// Runs tasks pulled lazily from `tasks`, at most `concurrency` at a time.
    ///
    /// A task is only pulled once a worker slot is free. Every task runs in
    /// its own tokio task, so a panic in one becomes
    /// [`FailureReason::Exception`] for that task alone. Returns once every
    /// task has finished; results are correlated by index, not completion
    /// order.
    pub async fn run_stream<S>(
        &self,
        ctx: &RunContext,
        label: &str,
        tasks: S,
        concurrency: usize,
    ) -> BatchReport
    where
        S: Stream<Item = DownloadTask>,
    {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut tasks = std::pin::pin!(tasks);
        let mut handles = vec![];

        while let Some(task) = tasks.next().await {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let pipeline = self.clone();
            let spawned = task.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                pipeline.run(&spawned).await
            });
            handles.push((handles.len(), task, handle));
        }

        let mut reports = Vec::with_capacity(handles.len());
        for (index, task, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    error!("Task for {} aborted: {}", task.url(), e);
                    DownloadResult::Failed(FailureReason::Exception(e.to_string()))
                }
            };
            ctx.record(&task, &result);
            reports.push(TaskReport {
                index,
                task,
                result,
            });
        }

        let batch = BatchReport::new(label, reports);
        if batch.is_total_failure() {
            warn!("[{}] every download failed ({})", label, batch.tally);
        } else {
            info!("[{}] done ({})", label, batch.tally);
        }
        batch
    }

    /// Downloads every album of `source`.
    ///
    /// `album_concurrency` albums run at once, each with
    /// `image_concurrency` workers; fetches across all of them share the
    /// pipeline's in-flight cap. Each album waits a random `album_delay`
    /// before starting.
    pub async fn run_source<S>(&self, ctx: &RunContext, source: &S) -> RunReport
    where
        S: TaskSource + ?Sized,
    {
        let outer = self.config.album_concurrency.max(1);
        let inner = self.config.image_concurrency;

        let mut batches: Vec<(usize, BatchReport)> = source
            .albums()
            .enumerate()
            .map(move |(position, album)| async move {
                let delay = self.config.album_delay.sample();
                if !delay.is_zero() {
                    debug!("Waiting {:?} before album {}", delay, album.title);
                    tokio::time::sleep(delay).await;
                }
                info!(
                    "Album {}: {} ({} images)",
                    position + 1,
                    album.title,
                    album.tasks.len()
                );
                let report = self.run_batch(ctx, &album.title, album.tasks, inner).await;
                (position, report)
            })
            .buffer_unordered(outer)
            .collect()
            .await;

        batches.sort_by_key(|(position, _)| *position);
        let report = RunReport::new(batches.into_iter().map(|(_, batch)| batch).collect());
        info!(
            "Run finished: {} albums ({})",
            report.batches.len(),
            report.tally
        );
        report
    }

    /// Re-runs every task in `ctx` that failed for a retryable reason, as
    /// one batch.
    ///
    /// The abandoned list is drained first; tasks that fail again are queued
    /// anew, so the pass can be repeated.
    pub async fn retry_abandoned(&self, ctx: &RunContext, concurrency: usize) -> BatchReport {
        let abandoned = ctx.take_abandoned();
        if abandoned.is_empty() {
            return BatchReport::new("retry", vec![]);
        }

        info!("Retrying {} abandoned downloads", abandoned.len());
        for entry in &abandoned {
            debug!("Retrying {} (was {})", entry.task.url(), entry.reason);
        }
        let tasks = abandoned.into_iter().map(|entry| entry.task);
        self.run_batch(ctx, "retry", tasks, concurrency).await
    }
}
