//! Error types for the phrase store and masker.

use std::io;
use std::path::PathBuf;

/// Errors from the encrypted phrase store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store is closed")]
    Closed,

    #[error("key file {} is shorter than {expected} bytes", path.display())]
    ShortKey { path: PathBuf, expected: usize },

    #[error("store header is shorter than {expected} bytes")]
    ShortHeader { expected: usize },

    #[error("record {line}: {reason}")]
    Corrupt { line: usize, reason: String },

    #[error("failed to encrypt record")]
    Encrypt,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A listing that stopped at a malformed record.
///
/// `phrases` holds every record decoded before the failure.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct ListError {
    pub phrases: Vec<String>,
    #[source]
    pub source: StoreError,
}

impl From<StoreError> for ListError {
    fn from(source: StoreError) -> Self {
        Self {
            phrases: Vec::new(),
            source,
        }
    }
}

impl From<io::Error> for ListError {
    fn from(e: io::Error) -> Self {
        StoreError::Io(e).into()
    }
}

/// Errors from the masking writers.
#[derive(Debug, thiserror::Error)]
pub enum MaskError {
    #[error("failed to flush masked output: {0}")]
    Residual(#[source] io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}
