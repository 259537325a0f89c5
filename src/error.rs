//! Error types for vault backups

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Main error type for backup, re-encryption and credential operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Filesystem error on {path}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("File not found: {path}")]
    NotFound { path: PathBuf },

    #[error("Short write to {path}")]
    PartialWrite { path: PathBuf },

    #[error("Invalid format: {reason}")]
    InvalidFormat { reason: String },

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Unknown credentials method: {method}")]
    UnknownMethod { method: String },

    #[error("Invalid vault key: {reason}")]
    InvalidKey { reason: String },

    #[error("Could not find a vault in {path}")]
    VaultNotFound { path: PathBuf },

    #[error("The path has a lock file, close the vault or remove {path}")]
    Locked { path: PathBuf },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Directory walk error: {0}")]
    Walkdir(#[from] walkdir::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Invalid configuration: {reason}")]
    Configuration { reason: String },
}

impl Error {
    /// Build an `InvalidFormat` error from anything printable
    pub fn invalid_format(reason: impl Into<String>) -> Self {
        Self::InvalidFormat {
            reason: reason.into(),
        }
    }

    /// Whether this error means the file simply is not there
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Io(e) | Self::Filesystem { source: e, .. } => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Attach the offending path to an I/O error
pub trait IoContext<T> {
    fn at(self, path: &Path) -> Result<T>;
}

impl<T> IoContext<T> for std::result::Result<T, io::Error> {
    fn at(self, path: &Path) -> Result<T> {
        self.map_err(|source| match source.kind() {
            io::ErrorKind::WriteZero => Error::PartialWrite {
                path: path.to_path_buf(),
            },
            io::ErrorKind::UnexpectedEof => Error::InvalidFormat {
                reason: format!("{} is truncated", path.display()),
            },
            _ => Error::Filesystem {
                path: path.to_path_buf(),
                source,
            },
        })
    }
}

/// Result type alias for vault backup operations
pub type Result<T> = std::result::Result<T, Error>;
