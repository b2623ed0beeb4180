//! Atomic file persistence (write to a temp sibling, then rename).

use crate::error::PersistError;
use crate::validate::Validator;
use md5::{Digest, Md5};
use std::fs::{self, OpenOptions};
use std::future::Future;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Suffix of in-progress files. Anything carrying it is safe to delete.
const PARTIAL_SUFFIX: &str = ".part";

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// What [`Persister::persist`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOutcome {
    /// The bytes are now at the destination.
    Written { bytes: u64, md5: String },
    /// A valid file was already there; nothing was written.
    AlreadyPresent,
}

/// Places bytes at a final path with all-or-nothing visibility.
pub trait Persister: Send + Sync + 'static {
    fn persist(
        &self,
        path: &Path,
        bytes: Vec<u8>,
    ) -> impl Future<Output = Result<PersistOutcome, PersistError>> + Send;
}

/// Filesystem [`Persister`] that never exposes a partial file.
///
/// An existing destination that passes the validator is left alone; one
/// that fails it is removed before the new content goes in.
#[derive(Debug)]
pub struct FsPersister<V> {
    validator: Arc<V>,
}

impl<V> Clone for FsPersister<V> {
    fn clone(&self) -> Self {
        Self {
            validator: Arc::clone(&self.validator),
        }
    }
}

impl<V: Validator> FsPersister<V> {
    pub fn new(validator: V) -> Self {
        Self {
            validator: Arc::new(validator),
        }
    }
}

impl<V: Validator> Persister for FsPersister<V> {
    async fn persist(&self, path: &Path, bytes: Vec<u8>) -> Result<PersistOutcome, PersistError> {
        let validator = Arc::clone(&self.validator);
        let target = path.to_path_buf();

        tokio::task::spawn_blocking(move || persist_blocking(validator.as_ref(), &target, &bytes))
            .await
            .map_err(|e| {
                PersistError::new(path, io::Error::other(format!("Task join error: {}", e)))
            })?
    }
}

fn persist_blocking<V: Validator>(
    validator: &V,
    path: &Path,
    bytes: &[u8],
) -> Result<PersistOutcome, PersistError> {
    if path.exists() {
        if validator.validate_file(path).is_valid() {
            debug!("{} already present and valid", path.display());
            return Ok(PersistOutcome::AlreadyPresent);
        }
        warn!("Removing invalid existing file {}", path.display());
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(PersistError::new(path, e)),
        }
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| PersistError::new(path, e))?;
    }

    let temp = temp_path_for(path).map_err(|e| PersistError::new(path, e))?;
    if let Err(e) = write_and_rename(&temp, path, bytes) {
        if let Err(cleanup) = fs::remove_file(&temp) {
            if cleanup.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove temp file {}: {}", temp.display(), cleanup);
            }
        }
        return Err(PersistError::new(path, e));
    }

    let mut hasher = Md5::new();
    hasher.update(bytes);
    Ok(PersistOutcome::Written {
        bytes: bytes.len() as u64,
        md5: format!("{:x}", hasher.finalize()),
    })
}

/// Unique hidden sibling of `path`, so concurrent writers never share a
/// temp file.
fn temp_path_for(path: &Path) -> io::Result<PathBuf> {
    let file_name = path.file_name().and_then(|n| n.to_str()).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("destination {} has no file name", path.display()),
        )
    })?;
    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    Ok(path.with_file_name(format!(
        ".{}.{}.{}{}",
        file_name,
        std::process::id(),
        seq,
        PARTIAL_SUFFIX
    )))
}

fn write_and_rename(temp: &Path, path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(temp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    fs::rename(temp, path)
}

fn is_partial(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(PARTIAL_SUFFIX)
}

/// Deletes temp files left behind by an interrupted run.
///
/// Returns how many were removed. A missing root is not an error.
pub fn sweep_partials(root: impl AsRef<Path>) -> io::Result<usize> {
    let root = root.as_ref();
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            removed += sweep_partials(entry.path())?;
        } else if file_type.is_file() && entry.file_name().to_str().is_some_and(is_partial) {
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }

    if removed > 0 {
        info!("Removed {} partial files under {}", removed, root.display());
    }
    Ok(removed)
}
