//! Subcommands of the helper binary
//!
//! Each command is a `clap::Args` struct with an `execute` method taking
//! the shared [`Context`]. Commands never read the process working
//! directory themselves; `main` resolves it once.

pub mod artifacts_downloader;
pub mod artifacts_uploader;
pub mod cache_archiver;
pub mod cache_extractor;
pub mod cache_init;
pub mod health_check;
pub mod proxy_exec;
pub mod read_logs;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use runner_archive::{CancelToken, CodecOptions, Registry};

pub use artifacts_downloader::ArtifactsDownloader;
pub use artifacts_uploader::ArtifactsUploader;
pub use cache_archiver::CacheArchiver;
pub use cache_extractor::CacheExtractor;
pub use cache_init::CacheInit;
pub use health_check::HealthCheck;
pub use proxy_exec::ProxyExec;
pub use read_logs::ReadLogs;

/// State shared by every command of one process.
#[derive(Debug, Clone)]
pub struct Context {
    /// Directory archives are rooted at and extracted into.
    pub wd: PathBuf,
    pub registry: Registry,
    pub cancel: CancelToken,
    pub codec: CodecOptions,
}

impl Context {
    /// Context with the built-in codecs for `codec`.
    pub fn new(wd: impl Into<PathBuf>, codec: CodecOptions) -> Self {
        let registry = Registry::with_defaults(&codec);
        Self {
            wd: wd.into(),
            registry,
            cancel: CancelToken::new(),
            codec,
        }
    }

    /// Staging root for temporary downloads.
    pub fn staging_dir(&self) -> PathBuf {
        self.codec
            .staging_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

/// Create `dir` and its parents, owner-only on unix.
pub(crate) fn create_private_dir(dir: &Path) -> io::Result<()> {
    if dir.as_os_str().is_empty() {
        return Ok(());
    }
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir)
}
