//! `artifacts-downloader`: fetch the job's artifacts archive and extract it
//! into the working directory.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use super::Context;
use crate::error::{HelperError, HelperResult};
use crate::meter::TransferMeterArgs;
use crate::network::{Coordinator, DownloadState, JobCredentials};
use crate::retry::RetryHelper;

#[derive(Debug, Clone, clap::Args)]
pub struct ArtifactsDownloader {
    #[command(flatten)]
    pub credentials: JobCredentials,

    #[command(flatten)]
    pub retry: RetryHelper,

    #[command(flatten)]
    pub meter: TransferMeterArgs,

    /// Ask the server to redirect to object storage on the first attempt
    #[arg(long = "direct-download", env = "FF_USE_DIRECT_DOWNLOAD")]
    pub direct_download: bool,
}

impl ArtifactsDownloader {
    pub fn execute(&self, ctx: &Context) -> HelperResult<()> {
        let creds = &self.credentials;
        if creds.url.is_empty() || creds.token.is_empty() || creds.id <= 0 {
            return Err(HelperError::InvalidInput("incomplete arguments".into()));
        }

        let coordinator = Coordinator::new(creds)?;
        let staging = ctx.staging_dir();
        std::fs::create_dir_all(&staging)?;
        let archive = tempfile::Builder::new()
            .prefix("artifacts")
            .tempfile_in(&staging)?;

        self.retry
            .do_retry(|attempt| self.download(&coordinator, archive.path(), attempt))?;

        let extractor = ctx.registry.open_archive(archive.path(), &ctx.wd)?;
        extractor.extract(&ctx.cancel)?;
        Ok(())
    }

    fn download(&self, coordinator: &Coordinator, target: &Path, attempt: u32) -> HelperResult<()> {
        let direct = (self.direct_download && attempt == 0).then_some(true);
        let file = BufWriter::new(File::create(target)?);
        let mut file = self.meter.meter(file, "Downloading artifacts", None);

        match coordinator.download_artifacts(&self.credentials, &mut file, direct) {
            DownloadState::Succeeded => {
                file.flush().map_err(HelperError::retryable)?;
                Ok(())
            }
            DownloadState::NotFound => Err(HelperError::NotFound("artifacts".into())),
            DownloadState::Forbidden | DownloadState::Unauthorized => {
                Err(HelperError::PermissionDenied("artifacts download".into()))
            }
            DownloadState::Failed => Err(HelperError::retryable(HelperError::Failed(
                "artifacts download failed".into(),
            ))),
        }
    }
}
