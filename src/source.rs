//! Task sources: where download tasks come from.
//!
//! Site-specific scrapers implement [`TaskSource`]; the pipeline only ever
//! sees the albums and tasks they produce. [`ManifestSource`] is the
//! built-in implementation, reading albums from a JSON manifest.

use crate::config::PipelineConfig;
use crate::error::GalleryError;
use crate::types::{Album, DownloadTask};
use futures_util::stream::{self, BoxStream, StreamExt};
use reqwest::Url;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Longest file or directory name produced by [`sanitize_filename`], in chars.
pub const MAX_NAME_LEN: usize = 150;

/// Producer of albums to download.
///
/// Every call to [`TaskSource::albums`] starts a fresh, finite sequence, so
/// a source can be replayed after an interrupted run.
pub trait TaskSource: Send + Sync {
    fn albums(&self) -> BoxStream<'_, Album>;
}

/// Makes `name` safe to use as a single path component.
///
/// Runs of `\ / : * ? " < > |` and control characters become one `_`, the
/// result is trimmed and cut to [`MAX_NAME_LEN`] characters. Empty names
/// and `.`/`..` become `untitled`.
pub fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_run = false;
    for c in name.chars() {
        if matches!(c, '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|') || c.is_control() {
            if !in_run {
                out.push('_');
            }
            in_run = true;
        } else {
            out.push(c);
            in_run = false;
        }
    }

    let trimmed: String = out.trim().chars().take(MAX_NAME_LEN).collect();
    let trimmed = trimmed.trim_end();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        "untitled".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Last non-empty path segment of a URL, if any.
pub fn filename_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed
        .path_segments()?
        .filter(|s| !s.is_empty())
        .last()
        .map(sanitize_filename)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Manifest {
    albums: Vec<ManifestAlbum>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestAlbum {
    title: String,
    /// Tag or category directory the album sits under.
    #[serde(default)]
    group: Option<String>,
    #[serde(default)]
    referer: Option<String>,
    images: Vec<String>,
}

/// [`TaskSource`] backed by a JSON manifest:
///
/// ```json
/// { "albums": [ { "title": "Album", "group": "tag", "images": ["https://..."] } ] }
/// ```
///
/// Files land in `save_root/<group>/<title>/<file name from URL>`.
#[derive(Debug)]
pub struct ManifestSource {
    manifest: Manifest,
    save_root: PathBuf,
    min_size: u64,
    verify: bool,
}

impl ManifestSource {
    pub fn from_json_str(json: &str, config: &PipelineConfig) -> Result<Self, GalleryError> {
        let manifest: Manifest = serde_json::from_str(json)?;
        Ok(Self {
            manifest,
            save_root: config.save_root.clone(),
            min_size: config.min_size,
            verify: config.verify,
        })
    }

    pub fn from_json_file(
        path: impl AsRef<Path>,
        config: &PipelineConfig,
    ) -> Result<Self, GalleryError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content, config)
    }

    pub fn len(&self) -> usize {
        self.manifest.albums.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifest.albums.is_empty()
    }

    fn build_album(&self, entry: &ManifestAlbum) -> Album {
        let mut dir = self.save_root.clone();
        if let Some(group) = &entry.group {
            dir.push(sanitize_filename(group));
        }
        let title = sanitize_filename(&entry.title);
        dir.push(&title);

        let mut seen_urls = HashSet::new();
        let mut used_names = HashSet::new();
        let mut tasks = Vec::with_capacity(entry.images.len());

        for url in &entry.images {
            if !seen_urls.insert(url.as_str()) {
                continue;
            }
            let position = tasks.len() + 1;
            let mut name =
                filename_from_url(url).unwrap_or_else(|| format!("{:03}.jpg", position));
            if !used_names.insert(name.clone()) {
                name = format!("{:03}_{}", position, name);
                used_names.insert(name.clone());
            }

            let mut task = DownloadTask::new(url.clone(), dir.join(&name))
                .with_min_size(self.min_size)
                .with_verify(self.verify);
            if let Some(referer) = &entry.referer {
                task = task.with_referer(referer.clone());
            }
            tasks.push(task);
        }

        Album {
            title,
            group: entry.group.clone(),
            tasks,
        }
    }
}

impl TaskSource for ManifestSource {
    fn albums(&self) -> BoxStream<'_, Album> {
        stream::iter(self.manifest.albums.iter())
            .map(move |entry| self.build_album(entry))
            .boxed()
    }
}
