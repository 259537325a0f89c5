//! File state probing and crash-safe file replacement.
//!
//! Every file this crate produces is first written to a private temporary
//! path and only becomes visible through [`atomic_replace`]. A reader of the
//! destination observes either the old content or the new content in full.

use crate::error::IoContext;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::fs::{self, Metadata};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Outcome of a stat call that is allowed to find nothing
#[derive(Debug)]
pub enum FileState {
    Present(Metadata),
    Absent,
}

impl FileState {
    pub fn metadata(&self) -> Option<&Metadata> {
        match self {
            Self::Present(m) => Some(m),
            Self::Absent => None,
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, Self::Present(_))
    }
}

/// Stat a path. "Not found" is a state, every other failure is an error.
pub fn probe(path: &Path) -> Result<FileState> {
    match fs::metadata(path) {
        Ok(m) => Ok(FileState::Present(m)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(FileState::Absent),
        Err(e) => Err(Error::Filesystem {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Modification time truncated to milliseconds since the epoch
pub fn modified_millis(metadata: &Metadata, path: &Path) -> Result<i64> {
    let modified = metadata.modified().at(path)?;
    Ok(DateTime::<Utc>::from(modified).timestamp_millis())
}

/// Move `temp` over `dest`. On failure `dest` is unchanged and `temp` is left for the caller.
pub fn atomic_replace(temp: &Path, dest: &Path) -> Result<()> {
    fs::rename(temp, dest).map_err(|source| Error::Filesystem {
        path: dest.to_path_buf(),
        source,
    })
}

/// A temporary file that is deleted when dropped unless committed.
#[derive(Debug)]
pub struct TempFile {
    path: PathBuf,
    committed: bool,
}

impl TempFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            committed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically publish the temp file at `dest`
    pub fn commit(mut self, dest: &Path) -> Result<()> {
        atomic_replace(&self.path, dest)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed temp file {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove temp file {}: {}", self.path.display(), e),
        }
    }
}

/// Run `produce` against `temp`, then publish it at `dest`.
///
/// If `produce` or the final rename fails, the temp file is removed and the
/// destination is left exactly as it was.
pub fn write_atomically<T, F>(temp: &Path, dest: &Path, produce: F) -> Result<T>
where
    F: FnOnce(&Path) -> Result<T>,
{
    let guard = TempFile::new(temp);
    let value = produce(guard.path())?;
    guard.commit(dest)?;
    Ok(value)
}
