//! Error taxonomy for helper commands
//!
//! Every failure a command can hit maps to one stable [`ErrorKind`]. Only
//! errors wrapped in [`HelperError::Retryable`] are retried by
//! [`crate::retry::RetryHelper`].

use std::io;
use std::path::PathBuf;

use runner_archive::ArchiveError;
use runner_mask::{MaskError, StoreError};

/// Result alias for helper commands.
pub type HelperResult<T> = Result<T, HelperError>;

/// Stable error kinds, independent of the concrete error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    UnsupportedFormat,
    PathTraversal,
    TooManyRawFiles,
    NotFound,
    PermissionDenied,
    TooLarge,
    Retryable,
    ServiceUnavailable,
    InvalidInput,
    Closed,
    MaskerResidual,
    Cancelled,
    Io,
    Http,
    Archive,
    Store,
    Other,
}

/// Errors returned by helper commands.
#[derive(Debug, thiserror::Error)]
pub enum HelperError {
    #[error("{format:?} format: unsupported archive format")]
    UnsupportedFormat { format: String },

    #[error("{}: path is outside of {}", path.display(), root.display())]
    PathTraversal { path: PathBuf, root: PathBuf },

    #[error("only one file can be sent as raw")]
    TooManyRawFiles,

    #[error("{0}: not found")]
    NotFound(String),

    #[error("{0}: permission denied")]
    PermissionDenied(String),

    #[error("{0}: too large")]
    TooLarge(String),

    /// Marker authorizing the retry helper to call the handler again.
    #[error("{0}")]
    Retryable(Box<HelperError>),

    #[error("service unavailable")]
    ServiceUnavailable,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("secret store is closed")]
    Closed,

    #[error("failed to flush masked output: {0}")]
    MaskerResidual(#[source] io::Error),

    #[error("operation cancelled")]
    Cancelled,

    /// A request that failed with a status the caller does not classify.
    #[error("{0}")]
    Failed(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Archive(ArchiveError),

    #[error(transparent)]
    Store(StoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "gocloud")]
    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
}

impl HelperError {
    /// Wrap `err` so the retry helper will try again.
    pub fn retryable(err: impl Into<HelperError>) -> Self {
        match err.into() {
            already @ HelperError::Retryable(_) => already,
            other => HelperError::Retryable(Box::new(other)),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, HelperError::Retryable(_))
    }

    /// The wrapped error of a retryable marker, or `self`.
    pub fn inner(&self) -> &HelperError {
        match self {
            HelperError::Retryable(inner) => inner,
            other => other,
        }
    }

    /// True for `NotFound` and for I/O errors of kind `NotFound`.
    pub fn is_not_found(&self) -> bool {
        match self.inner() {
            HelperError::NotFound(_) => true,
            HelperError::Io(e) => e.kind() == io::ErrorKind::NotFound,
            HelperError::Archive(ArchiveError::Io(e)) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// True when a producer failed because the consuming end went away.
    pub fn is_broken_pipe(&self) -> bool {
        match self.inner() {
            HelperError::Io(e) | HelperError::Archive(ArchiveError::Io(e)) => {
                e.kind() == io::ErrorKind::BrokenPipe
            }
            _ => false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            HelperError::UnsupportedFormat { .. } => ErrorKind::UnsupportedFormat,
            HelperError::PathTraversal { .. } => ErrorKind::PathTraversal,
            HelperError::TooManyRawFiles => ErrorKind::TooManyRawFiles,
            HelperError::NotFound(_) => ErrorKind::NotFound,
            HelperError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            HelperError::TooLarge(_) => ErrorKind::TooLarge,
            HelperError::Retryable(_) => ErrorKind::Retryable,
            HelperError::ServiceUnavailable => ErrorKind::ServiceUnavailable,
            HelperError::InvalidInput(_) => ErrorKind::InvalidInput,
            HelperError::Closed => ErrorKind::Closed,
            HelperError::MaskerResidual(_) => ErrorKind::MaskerResidual,
            HelperError::Cancelled => ErrorKind::Cancelled,
            HelperError::Failed(_) => ErrorKind::Other,
            HelperError::Io(_) => ErrorKind::Io,
            HelperError::Http(_) => ErrorKind::Http,
            HelperError::Archive(_) => ErrorKind::Archive,
            HelperError::Store(_) => ErrorKind::Store,
            HelperError::Json(_) => ErrorKind::InvalidInput,
            #[cfg(feature = "gocloud")]
            HelperError::ObjectStore(_) => ErrorKind::Other,
        }
    }
}

impl From<ArchiveError> for HelperError {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::UnsupportedFormat { format } => HelperError::UnsupportedFormat { format },
            ArchiveError::PathTraversal { path, root } => HelperError::PathTraversal { path, root },
            ArchiveError::TooManyRawFiles => HelperError::TooManyRawFiles,
            ArchiveError::Cancelled => HelperError::Cancelled,
            ArchiveError::InvalidOption { name, value, reason } => {
                HelperError::InvalidInput(format!("{name}={value:?}: {reason}"))
            }
            other => HelperError::Archive(other),
        }
    }
}

impl From<StoreError> for HelperError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Closed => HelperError::Closed,
            other => HelperError::Store(other),
        }
    }
}

impl From<MaskError> for HelperError {
    fn from(err: MaskError) -> Self {
        match err {
            MaskError::Residual(e) => HelperError::MaskerResidual(e),
            MaskError::Store(e) => e.into(),
        }
    }
}
