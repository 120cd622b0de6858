//! `cache-archiver`: build the cache archive when inputs changed, then
//! upload it with a pre-signed `PUT` or to cloud object storage.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use reqwest::blocking::Body;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, LAST_MODIFIED};
use runner_archive::path::absolute;
use runner_archive::{CompressionLevel, Format};

use super::{create_private_dir, Context};
use crate::error::{HelperError, HelperResult};
use crate::file_archiver::{FileArchiver, PathArgs};
use crate::meter::TransferMeterArgs;
use crate::network::{clean_url, CacheClient};
use crate::retry::RetryHelper;

/// Default `Content-Type` of cache uploads.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Default overall transfer timeout, in minutes.
pub const DEFAULT_TIMEOUT_MINUTES: u64 = 10;

#[derive(Debug, Clone, clap::Args)]
pub struct CacheArchiver {
    #[command(flatten)]
    pub paths: PathArgs,

    #[command(flatten)]
    pub retry: RetryHelper,

    #[command(flatten)]
    pub meter: TransferMeterArgs,

    /// The path to file
    #[arg(long, default_value = "")]
    pub file: String,

    /// URL of remote cache resource (pre-signed URL)
    #[arg(long, default_value = "")]
    pub url: String,

    /// Cloud storage URL of remote cache resource (requires credentials)
    #[arg(long = "gocloud-url", default_value = "")]
    pub gocloud_url: String,

    /// Overall timeout for cache uploading request (in minutes)
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_MINUTES)]
    pub timeout: u64,

    /// HTTP headers to send with PUT request (in form of 'key:value')
    #[arg(long = "header")]
    pub headers: Vec<String>,

    /// Metadata for the cache artifact (JSON encoded key-value pairs)
    #[arg(long, env = "CACHE_METADATA", default_value = "")]
    pub metadata: String,

    /// Compression level (fastest, fast, default, slow, slowest)
    #[arg(long = "compression-level", env = "CACHE_COMPRESSION_LEVEL", default_value = "")]
    pub compression_level: String,

    /// Compression format (zip, tarzstd)
    #[arg(long = "compression-format", env = "CACHE_COMPRESSION_FORMAT", default_value = "zip")]
    pub compression_format: String,

    /// Limit the size of the cache archive being uploaded, in bytes
    #[arg(
        long = "max-uploaded-archive-size",
        env = "CACHE_MAX_UPLOADED_ARCHIVE_SIZE",
        default_value_t = 0
    )]
    pub max_uploaded_archive_size: u64,

    /// Filename containing environment variables to read
    #[arg(long = "env-file", default_value = "")]
    pub env_file: String,
}

impl CacheArchiver {
    pub fn execute(&self, ctx: &Context) -> HelperResult<()> {
        if self.file.is_empty() {
            return Err(HelperError::InvalidInput("missing --file".into()));
        }
        let metadata = parse_metadata(&self.metadata)?;
        let headers = self.request_headers()?;
        let archive = absolute(Path::new(&self.file), &ctx.wd);

        let archiver = FileArchiver::enumerate(&ctx.wd, &self.paths.expanded())?;
        if !archiver.is_file_changed(&archive) {
            tracing::info!("Archive is up to date!");
            return Ok(());
        }

        let size = self.create_archive(ctx, &archiver, &archive)?;
        write_metadata_file(&archive, &metadata)?;

        if self.url.is_empty() && self.gocloud_url.is_empty() {
            tracing::info!(
                "No URL provided, cache will not be uploaded to shared cache server. \
                 Cache will be stored only locally."
            );
            return Ok(());
        }
        if self.max_uploaded_archive_size != 0 && size > self.max_uploaded_archive_size {
            tracing::info!(
                "Cache archive size ({size}) is too big (Limit is set to {}). \
                 Cache will be stored only locally.",
                self.max_uploaded_archive_size
            );
            return Ok(());
        }

        if !self.gocloud_url.is_empty() {
            return self.upload_gocloud(&archive, &metadata);
        }

        let client = CacheClient::new(self.timeout)?;
        self.retry
            .do_retry(|_| self.upload_http(&client, &archive, &headers))
    }

    /// Archive format from `--compression-format`; anything unknown is zip.
    pub fn format(&self) -> Format {
        if self.compression_format.eq_ignore_ascii_case(Format::TAR_ZSTD.as_str()) {
            Format::TAR_ZSTD
        } else {
            Format::ZIP
        }
    }

    /// Write the archive next to `target` and rename it into place.
    fn create_archive(&self, ctx: &Context, archiver: &FileArchiver, target: &Path) -> HelperResult<u64> {
        let dir = target.parent().unwrap_or(ctx.wd.as_path());
        create_private_dir(dir)?;

        let temp = tempfile::Builder::new().prefix("archive_").tempfile_in(dir)?;
        tracing::debug!(path = %temp.path().display(), "temporary file");

        let level = CompressionLevel::parse_or_default(&self.compression_level);
        let sink = Box::new(BufWriter::new(temp.as_file().try_clone()?));
        let codec = ctx.registry.new_archiver(&self.format(), sink, &ctx.wd, level)?;
        codec.archive(archiver.files(), &ctx.cancel)?;

        let size = temp.as_file().metadata()?.len();
        temp.persist(target).map_err(|e| HelperError::Io(e.error))?;
        Ok(size)
    }

    /// `--header` values as a header map, with the default content headers.
    ///
    /// Entries without `:` are ignored; keys and values are trimmed.
    fn request_headers(&self) -> HelperResult<HeaderMap> {
        let mut custom = HeaderMap::new();
        for raw in &self.headers {
            let Some((key, value)) = raw.split_once(':') else {
                continue;
            };
            let name = HeaderName::from_bytes(key.trim().as_bytes())
                .map_err(|e| HelperError::InvalidInput(format!("header {key:?}: {e}")))?;
            let value = HeaderValue::from_str(value.trim())
                .map_err(|e| HelperError::InvalidInput(format!("header {key:?}: {e}")))?;
            custom.insert(name, value);
        }
        Ok(custom)
    }

    fn upload_http(&self, client: &CacheClient, archive: &Path, custom: &HeaderMap) -> HelperResult<()> {
        let url = clean_url(&self.url);
        tracing::info!("Uploading {} to {url}", display_name(archive));

        let file = File::open(archive)?;
        let md = file.metadata()?;

        let mut headers = HeaderMap::new();
        if !custom.contains_key(CONTENT_TYPE) {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(DEFAULT_CONTENT_TYPE));
            let mtime = md.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            if let Ok(value) = HeaderValue::from_str(&http_date(mtime)) {
                headers.insert(LAST_MODIFIED, value);
            }
        }
        for (name, value) in custom {
            headers.insert(name.clone(), value.clone());
        }
        headers.insert(CONTENT_LENGTH, HeaderValue::from(md.len()));

        let response = client
            .inner()
            .put(&self.url)
            .headers(headers)
            .body(Body::sized(self.meter.meter(file, "Uploading cache", Some(md.len())), md.len()))
            .send()
            .map_err(HelperError::retryable)?;

        let status = response.status();
        if status.is_server_error() {
            return Err(HelperError::retryable(HelperError::Failed(format!(
                "received: {status}"
            ))));
        }
        if !status.is_success() {
            return Err(HelperError::Failed(format!("received: {status}")));
        }
        tracing::info!(status = status.as_u16(), "Created cache");
        Ok(())
    }

    #[cfg(feature = "gocloud")]
    fn upload_gocloud(&self, archive: &Path, metadata: &BTreeMap<String, String>) -> HelperResult<()> {
        load_env_file(&self.env_file)?;
        tracing::info!("Uploading {} to {}", display_name(archive), clean_url(&self.gocloud_url));
        let blob = crate::gocloud::Blob::open(&self.gocloud_url, self.timeout)?;
        self.retry.do_retry(|_| {
            let file = File::open(archive)?;
            let size = file.metadata()?.len();
            let mut source = self.meter.meter(file, "Uploading cache", Some(size));
            blob.upload(&mut source, metadata).map_err(|e| match e {
                HelperError::InvalidInput(_) => e,
                other => HelperError::retryable(other),
            })
        })
    }

    #[cfg(not(feature = "gocloud"))]
    fn upload_gocloud(&self, _archive: &Path, _metadata: &BTreeMap<String, String>) -> HelperResult<()> {
        Err(HelperError::InvalidInput(
            "--gocloud-url requires the gocloud feature".into(),
        ))
    }
}

/// `CACHE_METADATA`: empty, or a JSON object of strings.
pub fn parse_metadata(raw: &str) -> HelperResult<BTreeMap<String, String>> {
    if raw.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    serde_json::from_str(raw).map_err(|e| HelperError::InvalidInput(format!("cache metadata: {e}")))
}

/// Sidecar holding the cache metadata as JSON: `<archive>.metadata`.
pub fn metadata_path(archive: &Path) -> PathBuf {
    let mut name = archive.as_os_str().to_owned();
    name.push(".metadata");
    PathBuf::from(name)
}

/// Write `metadata` next to `archive`, replacing any earlier sidecar.
pub fn write_metadata_file(archive: &Path, metadata: &BTreeMap<String, String>) -> HelperResult<()> {
    fs::write(metadata_path(archive), serde_json::to_vec(metadata)?)?;
    Ok(())
}

/// Export the variables in `path` into the process environment, replacing
/// existing values. An empty path is a no-op.
pub fn load_env_file(path: &str) -> HelperResult<()> {
    if path.is_empty() {
        return Ok(());
    }
    dotenvy::from_path_override(path)
        .map_err(|e| HelperError::InvalidInput(format!("env file {path:?}: {e}")))?;
    tracing::debug!(path, "loaded env file");
    Ok(())
}

/// RFC 7231 date, as used by `Last-Modified`.
pub fn http_date(time: SystemTime) -> String {
    DateTime::<Utc>::from(time)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
