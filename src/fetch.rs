//! HTTP fetching with bounded, jittered retries.

use crate::config::{DelayRange, PipelineConfig};
use crate::error::{FetchError, GalleryError};
use futures_util::StreamExt;
use reqwest::header::{CONTENT_TYPE, REFERER};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_retry2::strategy::FixedInterval;
use tokio_retry2::{Retry, RetryError};
use tracing::{debug, warn};

/// Bytes inspected when sniffing for an HTML page.
const HTML_SNIFF_LEN: usize = 512;

/// Largest body size we pre-allocate for from `Content-Length`.
const MAX_PREALLOC: u64 = 16 * 1024 * 1024;

/// A single attempt at retrieving a URL's body.
///
/// Implementations must not retry on their own; [`fetch_with_retry`] owns
/// the retry policy.
pub trait Fetcher: Send + Sync {
    fn fetch_once(
        &self,
        url: &str,
        referer: Option<&str>,
        timeout: Duration,
    ) -> impl Future<Output = Result<Vec<u8>, FetchError>> + Send;
}

/// How many attempts a fetch gets and how long to wait between them.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: usize,
    pub delay: DelayRange,
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            attempts: config.retries,
            delay: config.retry_delay,
        }
    }
}

/// Fetches `url`, retrying transient failures according to `policy`.
///
/// Permanent failures (content mismatch, 404/410) return immediately. When
/// the attempts run out the last error is returned; the caller decides what
/// to do with the abandoned task.
pub async fn fetch_with_retry<F: Fetcher>(
    fetcher: &F,
    url: &str,
    referer: Option<&str>,
    timeout: Duration,
    policy: &RetryPolicy,
) -> Result<Vec<u8>, FetchError> {
    let attempts = policy.attempts.max(1);
    let delay = policy.delay;
    let retry_strategy = FixedInterval::new(delay.min)
        .map(move |_| delay.sample())
        .take(attempts - 1);

    let counter = AtomicUsize::new(0);
    let counter = &counter;

    Retry::spawn(retry_strategy, move || async move {
        let attempt = counter.fetch_add(1, Ordering::Relaxed) + 1;
        match fetcher.fetch_once(url, referer, timeout).await {
            Ok(body) => {
                debug!("Fetched {} ({} bytes, attempt {})", url, body.len(), attempt);
                Ok(body)
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    "Fetch failed for {} (attempt {}/{}): {}",
                    url, attempt, attempts, e
                );
                RetryError::to_transient(e)
            }
            Err(e) => {
                warn!("Fetch failed permanently for {}: {}", url, e);
                RetryError::to_permanent(e)
            }
        }
    })
    .await
}

/// Checks whether a body starts like an HTML document.
pub fn looks_like_html(body: &[u8]) -> bool {
    let head = &body[..body.len().min(HTML_SNIFF_LEN)];
    let head = String::from_utf8_lossy(head).to_ascii_lowercase();
    ["<!doctype html", "<html", "<head"]
        .iter()
        .any(|marker| head.contains(marker))
}

/// [`Fetcher`] backed by one shared `reqwest` connection pool.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    referer: Option<String>,
    expect_image: bool,
}

impl HttpFetcher {
    /// Builds the client from the run configuration.
    ///
    /// The client is cheap to clone and every clone shares the same pool,
    /// so one fetcher should serve a whole run.
    pub fn new(config: &PipelineConfig) -> Result<Self, GalleryError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .pool_max_idle_per_host(config.max_connections)
            .connect_timeout(config.timeout)
            .build()?;
        Ok(Self {
            client,
            referer: config.referer.clone(),
            expect_image: true,
        })
    }

    /// Turns the `image/*` content-type and HTML checks on or off.
    pub fn expect_image(mut self, expect_image: bool) -> Self {
        self.expect_image = expect_image;
        self
    }
}

impl Fetcher for HttpFetcher {
    async fn fetch_once(
        &self,
        url: &str,
        referer: Option<&str>,
        timeout: Duration,
    ) -> Result<Vec<u8>, FetchError> {
        let mut request = self.client.get(url).timeout(timeout);
        if let Some(referer) = referer.or(self.referer.as_deref()) {
            request = request.header(REFERER, referer);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        if self.expect_image {
            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.trim().to_ascii_lowercase());
            if let Some(content_type) = content_type {
                if !content_type.starts_with("image/") {
                    return Err(FetchError::ContentMismatch(format!(
                        "expected image/*, got {}",
                        content_type
                    )));
                }
            }
        }

        let content_length = response.content_length();
        let mut body = Vec::with_capacity(content_length.unwrap_or(0).min(MAX_PREALLOC) as usize);
        let mut byte_stream = response.bytes_stream();
        while let Some(piece) = byte_stream.next().await {
            body.extend_from_slice(&piece?);
        }

        if let Some(expected) = content_length {
            if body.len() as u64 != expected {
                return Err(FetchError::Network(format!(
                    "body size mismatch for {}: expected {} bytes, got {} bytes",
                    url,
                    expected,
                    body.len()
                )));
            }
        }

        if self.expect_image && looks_like_html(&body) {
            return Err(FetchError::ContentMismatch(
                "HTML document served in place of an image".to_string(),
            ));
        }

        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedFetcher {
        replies: Mutex<VecDeque<Result<Vec<u8>, FetchError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedFetcher {
        fn new(replies: Vec<Result<Vec<u8>, FetchError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl Fetcher for ScriptedFetcher {
        async fn fetch_once(
            &self,
            _url: &str,
            _referer: Option<&str>,
            _timeout: Duration,
        ) -> Result<Vec<u8>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(FetchError::Network("script exhausted".into())))
        }
    }

    fn policy(attempts: usize) -> RetryPolicy {
        RetryPolicy {
            attempts,
            delay: DelayRange::ZERO,
        }
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let fetcher = ScriptedFetcher::new(vec![
            Err(FetchError::Network("reset".into())),
            Err(FetchError::Status(503)),
            Ok(b"payload".to_vec()),
        ]);
        let body = fetch_with_retry(&fetcher, "http://x/a.jpg", None, Duration::from_secs(1), &policy(5))
            .await
            .unwrap();
        assert_eq!(body, b"payload");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_attempt_ceiling() {
        let fetcher = ScriptedFetcher::new(vec![]);
        let err = fetch_with_retry(&fetcher, "http://x/a.jpg", None, Duration::from_secs(1), &policy(5))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Network(_)));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_content_mismatch_is_not_retried() {
        let fetcher = ScriptedFetcher::new(vec![
            Err(FetchError::ContentMismatch("text/html".into())),
            Ok(b"never reached".to_vec()),
        ]);
        let err = fetch_with_retry(&fetcher, "http://x/a.jpg", None, Duration::from_secs(1), &policy(5))
            .await
            .unwrap_err();
        assert_eq!(err, FetchError::ContentMismatch("text/html".into()));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let fetcher = ScriptedFetcher::new(vec![Err(FetchError::Status(404))]);
        let err = fetch_with_retry(&fetcher, "http://x/a.jpg", None, Duration::from_secs(1), &policy(3))
            .await
            .unwrap_err();
        assert_eq!(err, FetchError::Status(404));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_default_policy_waits_four_to_eight_seconds() {
        let policy = RetryPolicy::from_config(&PipelineConfig::default());
        assert_eq!(policy.attempts, 5);
        for _ in 0..200 {
            let d = policy.delay.sample();
            assert!(d >= Duration::from_secs(4) && d <= Duration::from_secs(8), "{:?}", d);
        }
    }

    #[tokio::test]
    async fn test_backoff_waits_at_least_the_minimum() {
        let fetcher = ScriptedFetcher::new(vec![
            Err(FetchError::Network("reset".into())),
            Ok(b"payload".to_vec()),
        ]);
        let policy = RetryPolicy {
            attempts: 2,
            delay: DelayRange::new(Duration::from_millis(40), Duration::from_millis(80)),
        };

        let started = std::time::Instant::now();
        fetch_with_retry(&fetcher, "http://x/a.jpg", None, Duration::from_secs(1), &policy)
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(40), "{:?}", elapsed);
        assert!(elapsed < Duration::from_secs(2), "{:?}", elapsed);
    }

    #[test]
    fn test_looks_like_html() {
        assert!(looks_like_html(b"<!DOCTYPE html><html></html>"));
        assert!(looks_like_html(b"\n\n  <HTML><body>blocked</body>"));
        assert!(looks_like_html(b"<head><meta charset=utf-8></head>"));
        assert!(!looks_like_html(&[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10]));
        assert!(!looks_like_html(b""));
    }
}
