//! `cache-extractor`: refresh the local cache archive from the remote copy
//! when it is newer, then extract it into the working directory.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use filetime::FileTime;
use reqwest::header::{ETAG, LAST_MODIFIED};
use reqwest::StatusCode;
use runner_archive::path::absolute;

use super::cache_archiver::DEFAULT_TIMEOUT_MINUTES;
use super::{create_private_dir, Context};
use crate::error::{HelperError, HelperResult};
use crate::meter::TransferMeterArgs;
use crate::network::{clean_url, CacheClient};
use crate::retry::RetryHelper;

#[derive(Debug, Clone, clap::Args)]
pub struct CacheExtractor {
    #[command(flatten)]
    pub retry: RetryHelper,

    #[command(flatten)]
    pub meter: TransferMeterArgs,

    /// The file containing your cache artifacts
    #[arg(long, default_value = "")]
    pub file: String,

    /// URL of remote cache resource
    #[arg(long, default_value = "")]
    pub url: String,

    /// Cloud storage URL of remote cache resource (requires credentials)
    #[arg(long = "gocloud-url", default_value = "")]
    pub gocloud_url: String,

    /// Overall timeout for cache downloading request (in minutes)
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_MINUTES)]
    pub timeout: u64,
}

impl CacheExtractor {
    pub fn execute(&self, ctx: &Context) -> HelperResult<()> {
        if self.file.is_empty() {
            return Err(HelperError::InvalidInput("missing cache file".into()));
        }
        let archive = absolute(Path::new(&self.file), &ctx.wd);

        if !self.url.is_empty() || !self.gocloud_url.is_empty() {
            if let Err(err) = self.retry.do_retry(|_| self.download(&archive)) {
                tracing::warn!("{err}");
                return Err(err);
            }
        } else {
            tracing::info!(
                "No URL provided, cache will not be downloaded from shared cache server. \
                 Instead a local version of cache will be extracted."
            );
        }

        if !archive.exists() {
            tracing::warn!("Cache file does not exist");
            return Err(HelperError::NotFound(display_name(&archive)));
        }
        let extractor = ctx.registry.open_archive(&archive, &ctx.wd)?;
        extractor.extract(&ctx.cancel)?;
        Ok(())
    }

    fn download(&self, archive: &Path) -> HelperResult<()> {
        if let Some(dir) = archive.parent() {
            create_private_dir(dir)?;
        }
        if !self.gocloud_url.is_empty() {
            return self.download_gocloud(archive);
        }

        let client = CacheClient::new(self.timeout)?;
        let mut response = client
            .inner()
            .get(&self.url)
            .send()
            .map_err(HelperError::retryable)?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(HelperError::NotFound(clean_url(&self.url)));
        }
        if status.is_server_error() {
            return Err(HelperError::retryable(HelperError::Failed(format!(
                "received: {status}"
            ))));
        }
        if !status.is_success() {
            return Err(HelperError::Failed(format!("received: {status}")));
        }

        let remote = response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_http_date);
        if is_up_to_date(archive, remote) {
            tracing::info!("{} is up to date", display_name(archive));
            return Ok(());
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        tracing::info!(etag = %etag, "Downloading {} from {}", cache_name(archive), clean_url(&self.url));

        let total = response.content_length();
        save_atomically(archive, remote, |sink| {
            let mut sink = self.meter.meter(sink, "Downloading cache", total);
            response.copy_to(&mut sink).map_err(HelperError::retryable)?;
            Ok(())
        })
    }

    #[cfg(feature = "gocloud")]
    fn download_gocloud(&self, archive: &Path) -> HelperResult<()> {
        let blob = crate::gocloud::Blob::open(&self.gocloud_url, self.timeout)?;
        let remote = blob.last_modified()?;
        if is_up_to_date(archive, Some(remote)) {
            tracing::info!("{} is up to date", display_name(archive));
            return Ok(());
        }

        tracing::info!("Downloading {} from {}", cache_name(archive), clean_url(&self.gocloud_url));
        save_atomically(archive, Some(remote), |sink| {
            let mut sink = self.meter.meter(sink, "Downloading cache", None);
            blob.download_to(&mut sink)
        })
    }

    #[cfg(not(feature = "gocloud"))]
    fn download_gocloud(&self, _archive: &Path) -> HelperResult<()> {
        Err(HelperError::InvalidInput(
            "--gocloud-url requires the gocloud feature".into(),
        ))
    }
}

/// Stream into a sibling temp file, stamp its mtime and rename it over
/// `archive`. The temp file is removed on every failure path.
fn save_atomically<F>(archive: &Path, mtime: Option<DateTime<Utc>>, write: F) -> HelperResult<()>
where
    F: FnOnce(&mut dyn Write) -> HelperResult<()>,
{
    let dir = archive.parent().unwrap_or(Path::new("."));
    let temp = tempfile::Builder::new().prefix("cache").tempfile_in(dir)?;

    let mut sink = BufWriter::new(temp.as_file());
    write(&mut sink)?;
    sink.flush().map_err(HelperError::retryable)?;
    drop(sink);

    if let Some(mtime) = mtime {
        let stamp = FileTime::from_system_time(mtime.into());
        filetime::set_file_times(temp.path(), FileTime::now(), stamp)?;
    }
    temp.persist(archive).map_err(|e| HelperError::Io(e.error))?;
    Ok(())
}

/// Local copy exists and the remote one is not strictly newer.
fn is_up_to_date(archive: &Path, remote: Option<DateTime<Utc>>) -> bool {
    let Ok(md) = fs::symlink_metadata(archive) else {
        return false;
    };
    let local = md.modified().map(DateTime::<Utc>::from).ok();
    match (remote, local) {
        (Some(remote), Some(local)) => remote <= local,
        // a missing date parses as the zero time, which is never newer
        (None, Some(_)) => true,
        _ => false,
    }
}

/// Parse an RFC 7231 `Last-Modified` value.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Archive name without extension; cache files keep `.zip` whatever the
/// codec.
fn cache_name(path: &Path) -> String {
    path.file_stem()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::set_file_mtime;
    use tempfile::TempDir;

    #[test]
    fn test_parse_http_date() {
        let t = parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT").unwrap();
        assert_eq!(t.timestamp(), 784_111_777);
        assert!(parse_http_date("yesterday").is_none());
    }

    #[test]
    fn test_up_to_date_predicate() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("cache.zip");
        let remote = DateTime::from_timestamp(1_000_000, 0);

        assert!(!is_up_to_date(&archive, remote));

        fs::write(&archive, "zip").unwrap();
        set_file_mtime(&archive, FileTime::from_unix_time(1_000_000, 0)).unwrap();
        assert!(is_up_to_date(&archive, remote));

        set_file_mtime(&archive, FileTime::from_unix_time(999_999, 0)).unwrap();
        assert!(!is_up_to_date(&archive, remote));
    }

    #[test]
    fn test_save_stamps_mtime_and_replaces() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("cache.zip");
        fs::write(&archive, "old").unwrap();
        let stamp = DateTime::from_timestamp(1_500_000_000, 0);

        save_atomically(&archive, stamp, |sink| {
            sink.write_all(b"new")?;
            Ok(())
        })
        .unwrap();

        assert_eq!(fs::read(&archive).unwrap(), b"new");
        let mtime = FileTime::from_last_modification_time(&fs::metadata(&archive).unwrap());
        assert_eq!(mtime.unix_seconds(), 1_500_000_000);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_failed_save_leaves_target() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("cache.zip");
        fs::write(&archive, "old").unwrap();

        let err = save_atomically(&archive, None, |sink| -> HelperResult<()> {
            sink.write_all(b"partial")?;
            Err(HelperError::retryable(HelperError::Failed("reset".into())))
        })
        .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(fs::read(&archive).unwrap(), b"old");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
