#![allow(dead_code)]

use galleryfetch::{DelayRange, FetchError, Fetcher, PipelineConfig};
use image::{DynamicImage, ImageFormat, RgbImage};
use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What the mock serves for a URL.
#[derive(Debug, Clone)]
pub enum Route {
    Body(Vec<u8>),
    Fail(FetchError),
    /// Fails with a transient error this many times, then serves the body.
    Flaky(usize, Vec<u8>),
    Panic,
}

#[derive(Default)]
struct MockState {
    routes: Mutex<HashMap<String, Route>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    latency: Mutex<Duration>,
}

/// In-memory fetcher. Clones share routes and counters.
#[derive(Clone, Default)]
pub struct MockFetcher {
    state: Arc<MockState>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&self, url: impl Into<String>, route: Route) -> &Self {
        self.state.routes.lock().unwrap().insert(url.into(), route);
        self
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        *self.state.latency.lock().unwrap() = latency;
        self
    }

    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a MockState);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Fetcher for MockFetcher {
    async fn fetch_once(
        &self,
        url: &str,
        _referer: Option<&str>,
        _timeout: Duration,
    ) -> Result<Vec<u8>, FetchError> {
        let state = self.state.as_ref();
        state.calls.fetch_add(1, Ordering::SeqCst);
        let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(state);

        let latency = *state.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let route = {
            let mut routes = state.routes.lock().unwrap();
            match routes.get_mut(url) {
                Some(Route::Flaky(remaining, _)) if *remaining > 0 => {
                    *remaining -= 1;
                    Route::Fail(FetchError::Network("connection reset".into()))
                }
                Some(Route::Flaky(_, body)) => Route::Body(body.clone()),
                Some(route) => route.clone(),
                None => Route::Fail(FetchError::Status(404)),
            }
        };

        match route {
            Route::Body(body) => Ok(body),
            Route::Fail(e) => Err(e),
            Route::Panic => panic!("mock fetcher asked to panic for {}", url),
            Route::Flaky(..) => unreachable!(),
        }
    }
}

/// Config with no delays, suitable for tests.
pub fn test_config(save_root: &Path) -> PipelineConfig {
    PipelineConfig {
        save_root: save_root.to_path_buf(),
        retries: 3,
        retry_delay: DelayRange::ZERO,
        album_delay: DelayRange::ZERO,
        ..PipelineConfig::default()
    }
}

pub fn encode(img: RgbImage, format: ImageFormat) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img).write_to(&mut buf, format).unwrap();
    buf.into_inner()
}

/// Small, smooth PNG; a few hundred bytes.
pub fn small_png(seed: u8) -> Vec<u8> {
    let img = RgbImage::from_fn(16, 16, |x, y| {
        image::Rgb([seed, (x * 16) as u8, (y * 16) as u8])
    });
    encode(img, ImageFormat::Png)
}

/// Noisy JPEG that compresses poorly, so it stays well above 40 KiB.
pub fn noisy_jpeg(seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let img = RgbImage::from_fn(512, 512, |_, _| {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let bytes = (state >> 32).to_le_bytes();
        image::Rgb([bytes[0], bytes[1], bytes[2]])
    });
    encode(img, ImageFormat::Jpeg)
}

pub fn html_error_page() -> Vec<u8> {
    let mut page = b"<!DOCTYPE html><html><head><title>404 Not Found</title></head><body>".to_vec();
    page.resize(498, b' ');
    page.extend_from_slice(b"</body></html>");
    assert_eq!(page.len(), 512);
    page
}
