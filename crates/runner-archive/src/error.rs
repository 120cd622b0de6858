//! Error types for archiving and extraction.

use std::io;
use std::path::PathBuf;

/// Result alias used throughout the crate.
pub type ArchiveResult<T> = Result<T, ArchiveError>;

/// Errors produced by archivers, extractors and the registry.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("{format:?} format: unsupported archive format")]
    UnsupportedFormat { format: String },

    #[error("{}: path is outside of {}", path.display(), root.display())]
    PathTraversal { path: PathBuf, root: PathBuf },

    #[error("only one file can be sent as raw")]
    TooManyRawFiles,

    #[error("the {0:?} is not a regular file")]
    NotRegularFile(PathBuf),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid value {value:?} for {name}: {reason}")]
    InvalidOption {
        name: String,
        value: String,
        reason: String,
    },

    #[error("malformed archive: {0}")]
    Malformed(String),

    #[error("zip: {0}")]
    Zip(::zip::result::ZipError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<::zip::result::ZipError> for ArchiveError {
    fn from(err: ::zip::result::ZipError) -> Self {
        match err {
            ::zip::result::ZipError::Io(e) => Self::Io(e),
            other => Self::Zip(other),
        }
    }
}

impl ArchiveError {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }
}
