//! Runner Helper - job-side companion of a CI runner
//!
//! This crate implements the helper binary that runs next to a CI job:
//! uploading and downloading artifacts, archiving and restoring caches,
//! following job logs, probing linked services and running commands with
//! their output passed through the secret masker.
//!
//! Archive codecs live in `runner-archive`; the masking stream and secret
//! store live in `runner-mask`.

pub mod commands;
pub mod error;
pub mod file_archiver;
#[cfg(feature = "gocloud")]
pub mod gocloud;
pub mod logging;
pub mod meter;
pub mod network;
pub mod provenance;
pub mod retry;
pub mod signal;

pub use commands::Context;
pub use error::{ErrorKind, HelperError, HelperResult};
pub use file_archiver::{FileArchiver, PathArgs};
pub use retry::RetryHelper;
