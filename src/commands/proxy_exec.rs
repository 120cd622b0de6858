//! `proxy-exec`: run a child process with its output passed through the
//! secret masker.
//!
//! The store lives in the temporary project directory, so phrases added by
//! other helper invocations during the child's lifetime are masked from
//! that point on.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;

use runner_mask::{Masker, Proxy};

use super::Context;
use crate::error::{HelperError, HelperResult};

/// File name of the installed helper copy.
pub const HELPER_BINARY_NAME: &str = "gitlab-runner-helper";

/// Environment variable that overrides `--temp-dir`.
pub const TEMP_PROJECT_DIR_ENV: &str = "RUNNER_TEMP_PROJECT_DIR";

/// Build identity embedded in the executable. An installed copy containing
/// these bytes is the same build.
pub static BUILD_INFO: &str = concat!(
    "\0runner-helper build-info ",
    env!("CARGO_PKG_NAME"),
    "@",
    env!("CARGO_PKG_VERSION"),
    "\0"
);

#[derive(Debug, Clone, clap::Args)]
pub struct ProxyExec {
    /// Install this helper binary into the temporary directory first
    #[arg(long)]
    pub bootstrap: bool,

    /// Temporary directory holding the secret store
    #[arg(long = "temp-dir")]
    pub temp_dir: Option<PathBuf>,

    /// Command to run
    #[arg(last = true, required = true)]
    pub args: Vec<OsString>,
}

impl ProxyExec {
    /// Run the child and return its exit code.
    pub fn execute(&self, _ctx: &Context) -> HelperResult<i32> {
        let dir = self.store_dir(std::env::var_os(TEMP_PROJECT_DIR_ENV)).ok_or_else(|| {
            HelperError::InvalidInput(format!("--temp-dir or {TEMP_PROJECT_DIR_ENV} is required"))
        })?;
        if self.bootstrap {
            let src = std::env::current_exe()?;
            if bootstrap(&src, &dir, BUILD_INFO.as_bytes())? {
                tracing::debug!(dir = %dir.display(), "installed helper binary");
            }
        }
        run_with(&dir, &self.args, io::stdout(), io::stderr())
    }

    /// `RUNNER_TEMP_PROJECT_DIR` when set and non-empty, else `--temp-dir`.
    pub fn store_dir(&self, env: Option<OsString>) -> Option<PathBuf> {
        env.filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .or_else(|| self.temp_dir.clone())
            .filter(|dir| !dir.as_os_str().is_empty())
    }
}

/// Run `args` with stdout/stderr masked into `stdout`/`stderr`.
///
/// Returns the child's exit code, or 1 when it has none. A masker that fails
/// to flush turns a zero exit code into 1.
pub fn run_with<O, E>(dir: &Path, args: &[OsString], stdout: O, stderr: E) -> HelperResult<i32>
where
    O: Write + Send,
    E: Write + Send,
{
    let (program, rest) = args
        .split_first()
        .ok_or_else(|| HelperError::InvalidInput("expected a command to run".into()))?;

    let mut proxy = Proxy::open(dir, stdout, stderr)?;
    let mut child = Command::new(program)
        .args(rest)
        .stdin(Stdio::inherit())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let child_out = child.stdout.take();
    let child_err = child.stderr.take();
    let (masked_out, masked_err) = proxy.split();
    thread::scope(|scope| {
        let out = scope.spawn(move || pump(child_out, masked_out));
        let err = scope.spawn(move || pump(child_err, masked_err));
        for (name, handle) in [("stdout", out), ("stderr", err)] {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(stream = name, error = %e, "copying child output"),
                Err(_) => tracing::error!(stream = name, "output pump panicked"),
            }
        }
    });

    let status = child.wait()?;
    let mut code = status.code().unwrap_or(1);
    if let Err(e) = proxy.close() {
        let err = HelperError::from(e);
        tracing::error!("{err}");
        if code == 0 {
            code = 1;
        }
    }
    Ok(code)
}

fn pump<R: Read, W: Write>(src: Option<R>, dst: &mut Masker<W>) -> io::Result<()> {
    match src {
        Some(mut src) => io::copy(&mut src, dst).map(|_| ()),
        None => Ok(()),
    }
}

/// Copy `src` to `<dir>/gitlab-runner-helper` unless the installed copy
/// already carries `marker`. Returns whether a copy was made.
pub fn bootstrap(src: &Path, dir: &Path, marker: &[u8]) -> HelperResult<bool> {
    if let Err(e) = fs::create_dir_all(dir) {
        tracing::debug!(dir = %dir.display(), error = %e, "creating helper directory");
    }

    let dst = dir.join(HELPER_BINARY_NAME);
    match fs::read(&dst) {
        Ok(installed) if contains(&installed, marker) => return Ok(false),
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    io::copy(&mut File::open(src)?, temp.as_file_mut())?;
    temp.as_file().sync_all()?;
    set_executable(temp.path())?;
    temp.persist(&dst).map_err(|e| HelperError::Io(e.error))?;
    Ok(true)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(unix)]
fn set_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o777))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}
