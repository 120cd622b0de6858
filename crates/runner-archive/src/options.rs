//! Codec tuning read from the environment.

use std::path::PathBuf;

use crate::error::{ArchiveError, ArchiveResult};

pub const ENV_ARCHIVER_CONCURRENCY: &str = "FASTZIP_ARCHIVER_CONCURRENCY";
pub const ENV_ARCHIVER_BUFFER_SIZE: &str = "FASTZIP_ARCHIVER_BUFFER_SIZE";
pub const ENV_EXTRACTOR_CONCURRENCY: &str = "FASTZIP_EXTRACTOR_CONCURRENCY";
pub const ENV_STAGING_DIR: &str = "ARCHIVER_STAGING_DIR";
pub const ENV_USE_FASTZIP: &str = "FF_USE_FASTZIP";

/// Default per-worker buffer size (2 MiB).
pub const DEFAULT_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// Options shared by the zip codecs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecOptions {
    /// Parallel deflate workers.
    pub archiver_concurrency: usize,
    /// Per-worker buffer size in bytes.
    pub archiver_buffer_size: usize,
    /// Parallel extraction workers.
    pub extractor_concurrency: usize,
    /// Root for per-invocation staging directories; system temp when unset.
    pub staging_dir: Option<PathBuf>,
    /// Register fastzip under the `zip` key.
    pub use_fastzip: bool,
}

impl Default for CodecOptions {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            archiver_concurrency: cpus,
            archiver_buffer_size: DEFAULT_BUFFER_SIZE,
            extractor_concurrency: cpus,
            staging_dir: None,
            use_fastzip: false,
        }
    }
}

impl CodecOptions {
    /// Read options from the process environment.
    pub fn from_env() -> ArchiveResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read options through `lookup`. Unset or empty values keep defaults.
    pub fn from_lookup<F>(lookup: F) -> ArchiveResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut opts = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get(ENV_ARCHIVER_CONCURRENCY) {
            opts.archiver_concurrency = parse_positive(ENV_ARCHIVER_CONCURRENCY, &v)?;
        }
        if let Some(v) = get(ENV_ARCHIVER_BUFFER_SIZE) {
            opts.archiver_buffer_size = parse_positive(ENV_ARCHIVER_BUFFER_SIZE, &v)?;
        }
        if let Some(v) = get(ENV_EXTRACTOR_CONCURRENCY) {
            opts.extractor_concurrency = parse_positive(ENV_EXTRACTOR_CONCURRENCY, &v)?;
        }
        if let Some(v) = get(ENV_STAGING_DIR) {
            opts.staging_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = get(ENV_USE_FASTZIP) {
            opts.use_fastzip = parse_bool(ENV_USE_FASTZIP, &v)?;
        }
        Ok(opts)
    }
}

fn parse_positive(name: &str, value: &str) -> ArchiveResult<usize> {
    match value.trim().parse::<usize>() {
        Ok(n) if n >= 1 => Ok(n),
        Ok(_) => Err(invalid(name, value, "must be at least 1")),
        Err(e) => Err(invalid(name, value, &e.to_string())),
    }
}

/// Boolean flag parsing with the usual spellings.
pub fn parse_bool(name: &str, value: &str) -> ArchiveResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "yes" | "on" => Ok(true),
        "0" | "f" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(name, value, "not a boolean")),
    }
}

fn invalid(name: &str, value: &str, reason: &str) -> ArchiveError {
    ArchiveError::InvalidOption {
        name: name.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
