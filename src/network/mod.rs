//! HTTP plumbing: job API client, cache client, upload pipe
//!
//! - `client`: preconfigured blocking client for cache GET/PUT
//! - `coordinator`: artifact upload/download against the job API
//! - `pipe`: bounded channel that streams an archive into a request body

pub mod client;
pub mod coordinator;
pub mod pipe;

use std::path::PathBuf;

pub use client::CacheClient;
pub use coordinator::{ArtifactsOptions, Coordinator, DownloadState, UploadState};
pub use pipe::{pipe, spawn_producer, PipeReader, PipeWriter};

/// Header carrying the job token on every coordinator request.
pub const JOB_TOKEN_HEADER: &str = "JOB-TOKEN";

/// Credentials of the running job.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct JobCredentials {
    /// The build ID to upload or download artifacts for
    #[arg(long = "id", env = "CI_JOB_ID", default_value_t = 0)]
    pub id: i64,

    /// Build token
    #[arg(long, env = "CI_JOB_TOKEN", default_value = "", hide_env_values = true)]
    pub token: String,

    /// GitLab CI URL
    #[arg(long, env = "CI_SERVER_URL", default_value = "")]
    pub url: String,

    /// File containing the certificates to verify the peer
    #[arg(long = "tls-ca-file", env = "CI_SERVER_TLS_CA_FILE")]
    pub tls_ca_file: Option<PathBuf>,
}

/// Strip credentials, query and fragment from `raw` for logging.
///
/// Pre-signed cache URLs carry their signature in the query string.
pub fn clean_url(raw: &str) -> String {
    match reqwest::Url::parse(raw) {
        Ok(mut url) => {
            url.set_query(None);
            url.set_fragment(None);
            let _ = url.set_password(None);
            let _ = url.set_username("");
            url.to_string()
        }
        Err(_) => raw.split(['?', '#']).next().unwrap_or_default().to_string(),
    }
}
