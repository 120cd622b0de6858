//! `cache-init`: make cache volume directories world-writable so unprivileged
//! job users can populate them.

use std::fs;
use std::path::PathBuf;

use super::Context;
use crate::error::{HelperError, HelperResult};

/// Mode applied to each directory.
pub const CACHE_DIR_MODE: u32 = 0o777;

#[derive(Debug, Clone, clap::Args)]
pub struct CacheInit {
    /// Directories to open up
    pub paths: Vec<PathBuf>,
}

impl CacheInit {
    pub fn execute(&self, _ctx: &Context) -> HelperResult<()> {
        if self.paths.is_empty() {
            return Err(HelperError::InvalidInput("no arguments passed".into()));
        }

        for path in &self.paths {
            if let Err(e) = set_mode(path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to change cache directory mode");
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn set_mode(path: &std::path::Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(CACHE_DIR_MODE))
}

#[cfg(not(unix))]
fn set_mode(path: &std::path::Path) -> std::io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(false);
    fs::set_permissions(path, perms)
}
