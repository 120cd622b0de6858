//! `artifacts-uploader`: archive the selected files and POST them to the
//! job artifacts endpoint.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::thread::JoinHandle;

use runner_archive::{CompressionLevel, FileSet, Format};

use super::Context;
use crate::error::{HelperError, HelperResult};
use crate::file_archiver::{FileArchiver, PathArgs};
use crate::network::{spawn_producer, ArtifactsOptions, Coordinator, JobCredentials, UploadState};
use crate::provenance::{GenerateOptions, ProvenanceArgs};
use crate::retry::RetryHelper;

/// Redirects followed within one upload attempt.
pub const MAX_REDIRECTS: usize = 10;

/// Artifact type used for the provenance statement upload.
pub const METADATA_ARTIFACT_TYPE: &str = "metadata";

const DEFAULT_BASE_NAME: &str = "default";

#[derive(Debug, Clone, clap::Args)]
pub struct ArtifactsUploader {
    #[command(flatten)]
    pub credentials: JobCredentials,

    #[command(flatten)]
    pub paths: PathArgs,

    #[command(flatten)]
    pub retry: RetryHelper,

    #[command(flatten)]
    pub provenance: ProvenanceArgs,

    /// The name of the archive
    #[arg(long, default_value = "artifacts")]
    pub name: String,

    /// When to expire artifacts
    #[arg(long = "expire-in", default_value = "")]
    pub expire_in: String,

    /// Format of generated artifacts (zip, gzip, raw)
    #[arg(long = "artifact-format", default_value = "zip")]
    pub format: String,

    /// Type of generated artifacts
    #[arg(long = "artifact-type", default_value = "")]
    pub artifact_type: String,

    /// Compression level (fastest, fast, default, slow, slowest)
    #[arg(long = "compression-level", env = "ARTIFACT_COMPRESSION_LEVEL", default_value = "")]
    pub compression_level: String,
}

/// One upload: what to send and how to label it.
struct Upload<'a> {
    files: &'a FileSet,
    format: Format,
    options: ArtifactsOptions,
}

/// Body for one attempt plus the producer feeding it, if any.
type Stream = (Box<dyn Read + Send>, Option<JoinHandle<HelperResult<()>>>);

impl ArtifactsUploader {
    pub fn execute(&self, ctx: &Context) -> HelperResult<()> {
        if self.credentials.url.is_empty() || self.credentials.token.is_empty() {
            return Err(HelperError::InvalidInput("missing runner credentials".into()));
        }
        if self.credentials.id <= 0 {
            return Err(HelperError::InvalidInput("missing build ID".into()));
        }
        let format = Format::new(self.format.to_ascii_lowercase());
        let file_name = artifact_file_name(&self.name, &format)?;

        let archiver = FileArchiver::enumerate(&ctx.wd, &self.paths)?;
        if archiver.is_empty() {
            tracing::info!("No files to upload");
            return Ok(());
        }
        if format == Format::RAW && archiver.files().len() != 1 {
            return Err(HelperError::TooManyRawFiles);
        }

        let coordinator = Coordinator::new(&self.credentials)?;
        let upload = Upload {
            files: archiver.files(),
            format: format.clone(),
            options: ArtifactsOptions {
                base_name: file_name,
                expire_in: self.expire_in.clone(),
                format: format.as_str().to_string(),
                artifact_type: self.artifact_type.clone(),
            },
        };
        self.retry
            .do_upload_retry(|_| self.upload_once(ctx, &coordinator, &upload))?;

        if self.provenance.generate_artifacts_metadata {
            self.upload_provenance(ctx, &coordinator, archiver.files())?;
        }
        Ok(())
    }

    fn upload_provenance(&self, ctx: &Context, coordinator: &Coordinator, files: &FileSet) -> HelperResult<()> {
        let path = self.provenance.generate_to_file(&GenerateOptions {
            artifact_name: &self.name,
            files,
            wd: &ctx.wd,
            job_id: self.credentials.id,
        })?;

        let relative = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut metadata_files = FileSet::new();
        metadata_files.insert(relative.clone(), std::fs::symlink_metadata(&path)?);

        let upload = Upload {
            files: &metadata_files,
            format: Format::GZIP,
            options: ArtifactsOptions {
                base_name: artifact_file_name(&relative, &Format::GZIP)?,
                expire_in: self.expire_in.clone(),
                format: Format::GZIP.as_str().to_string(),
                artifact_type: METADATA_ARTIFACT_TYPE.to_string(),
            },
        };
        self.retry
            .do_upload_retry(|_| self.upload_once(ctx, coordinator, &upload))
    }

    /// One attempt, following temporary redirects.
    fn upload_once(&self, ctx: &Context, coordinator: &Coordinator, upload: &Upload<'_>) -> HelperResult<()> {
        let mut base_url = self.credentials.url.clone();

        for _ in 0..=MAX_REDIRECTS {
            if ctx.cancel.is_cancelled() {
                return Err(HelperError::Cancelled);
            }

            let (body, producer) = self.create_stream(ctx, upload)?;
            let state = coordinator.upload_raw_artifacts(&self.credentials, &base_url, body, &upload.options);
            if let Some(handle) = producer {
                join_producer(handle)?;
            }

            match state {
                UploadState::Succeeded => return Ok(()),
                UploadState::Redirected(location) => {
                    base_url = redirect_origin(&location)?;
                    tracing::info!(url = %base_url, "upload redirected");
                }
                UploadState::Forbidden => {
                    return Err(HelperError::PermissionDenied("artifacts upload".into()))
                }
                UploadState::TooLarge => return Err(HelperError::TooLarge("artifacts upload".into())),
                UploadState::ServiceUnavailable => {
                    return Err(HelperError::retryable(HelperError::ServiceUnavailable))
                }
                UploadState::Failed => {
                    return Err(HelperError::retryable(HelperError::Failed(
                        "artifacts upload failed".into(),
                    )))
                }
            }
        }

        Err(HelperError::Failed(format!("stopped after {MAX_REDIRECTS} redirects")))
    }

    fn create_stream(&self, ctx: &Context, upload: &Upload<'_>) -> HelperResult<Stream> {
        if upload.format == Format::RAW {
            let Some(name) = upload.files.keys().next() else {
                return Err(HelperError::TooManyRawFiles);
            };
            let file = File::open(ctx.wd.join(name))?;
            return Ok((Box::new(file), None));
        }

        let registry = ctx.registry.clone();
        let cancel = ctx.cancel.clone();
        let wd = ctx.wd.clone();
        let files = upload.files.clone();
        let format = upload.format.clone();
        let level = CompressionLevel::parse_or_default(&self.compression_level);

        let (reader, handle) = spawn_producer(move |writer| {
            let archiver = registry.new_archiver(&format, Box::new(writer), &wd, level)?;
            archiver.archive(&files, &cancel)?;
            Ok(())
        });
        Ok((Box::new(reader), Some(handle)))
    }
}

/// Surface the producer's own failure. A broken pipe only means the request
/// ended early, which the upload state already reports.
fn join_producer(handle: JoinHandle<HelperResult<()>>) -> HelperResult<()> {
    match handle.join() {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) if err.is_broken_pipe() => Ok(()),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(HelperError::Failed("archive producer panicked".into())),
    }
}

/// File name of the multipart part for `name` in `format`.
pub fn artifact_file_name(name: &str, format: &Format) -> HelperResult<String> {
    let base = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| DEFAULT_BASE_NAME.to_string());

    match format.as_str() {
        "zip" => Ok(format!("{base}.zip")),
        "gzip" => Ok(format!("{base}.gz")),
        "raw" => Ok(base),
        other => Err(HelperError::UnsupportedFormat {
            format: other.to_string(),
        }),
    }
}

fn redirect_origin(location: &str) -> HelperResult<String> {
    let url = reqwest::Url::parse(location).map_err(|e| {
        HelperError::retryable(HelperError::Failed(format!("invalid redirect location: {e}")))
    })?;
    Ok(url.origin().ascii_serialization())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_file_name_per_format() {
        assert_eq!(artifact_file_name("artifacts", &Format::ZIP).unwrap(), "artifacts.zip");
        assert_eq!(artifact_file_name("dir/report", &Format::GZIP).unwrap(), "report.gz");
        assert_eq!(artifact_file_name("artifacts", &Format::RAW).unwrap(), "artifacts");
        assert_eq!(artifact_file_name("", &Format::ZIP).unwrap(), "default.zip");
    }

    #[test]
    fn test_unknown_format_rejected() {
        let err = artifact_file_name("a", &Format::new("rar")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedFormat);
        let err = artifact_file_name("a", &Format::TAR_ZSTD).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedFormat);
    }

    #[test]
    fn test_redirect_origin() {
        assert_eq!(
            redirect_origin("https://other.example.com:8443/api/v4/jobs/1/artifacts?x=1").unwrap(),
            "https://other.example.com:8443"
        );
        assert!(redirect_origin("::").unwrap_err().is_retryable());
    }
}
