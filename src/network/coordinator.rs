//! Artifact transfers against the job API
//!
//! Endpoints are relative to the credentials' URL:
//! - `POST {url}/api/v4/jobs/{id}/artifacts`: multipart upload, field `file`
//! - `GET  {url}/api/v4/jobs/{id}/artifacts`: download
//!
//! Responses are reduced to an [`UploadState`] / [`DownloadState`]; the
//! commands decide what is retryable.

use std::fs;
use std::io::{Read, Write};
use std::time::Duration;

use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::redirect::Policy;
use reqwest::{Certificate, StatusCode};

use super::{clean_url, JobCredentials, JOB_TOKEN_HEADER};
use crate::error::HelperResult;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of an artifact upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadState {
    Succeeded,
    /// Temporary redirect; carries the `Location` header.
    Redirected(String),
    Forbidden,
    TooLarge,
    ServiceUnavailable,
    Failed,
}

/// Outcome of an artifact download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    Succeeded,
    NotFound,
    Forbidden,
    Unauthorized,
    Failed,
}

/// Upload parameters, sent both as query parameters and form fields.
#[derive(Debug, Clone, Default)]
pub struct ArtifactsOptions {
    /// File name of the multipart `file` part.
    pub base_name: String,
    pub expire_in: String,
    pub format: String,
    pub artifact_type: String,
}

impl ArtifactsOptions {
    fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if !self.expire_in.is_empty() {
            params.push(("expire_in", self.expire_in.clone()));
        }
        if !self.format.is_empty() {
            params.push(("artifact_format", self.format.clone()));
        }
        if !self.artifact_type.is_empty() {
            params.push(("artifact_type", self.artifact_type.clone()));
        }
        params
    }
}

/// Client for the job artifacts endpoints.
#[derive(Debug, Clone)]
pub struct Coordinator {
    /// Uploads see redirects themselves so the body can be rebuilt.
    upload: Client,
    download: Client,
}

impl Coordinator {
    pub fn new(credentials: &JobCredentials) -> HelperResult<Self> {
        let mut upload = Client::builder()
            .timeout(None::<Duration>)
            .connect_timeout(CONNECT_TIMEOUT)
            .redirect(Policy::none());
        let mut download = Client::builder()
            .timeout(None::<Duration>)
            .connect_timeout(CONNECT_TIMEOUT);

        if let Some(ca_file) = &credentials.tls_ca_file {
            let pem = fs::read(ca_file)?;
            for cert in Certificate::from_pem_bundle(&pem)? {
                upload = upload.add_root_certificate(cert.clone());
                download = download.add_root_certificate(cert);
            }
        }

        Ok(Self {
            upload: upload.build()?,
            download: download.build()?,
        })
    }

    /// Artifacts endpoint for job `id` under `base_url`.
    pub fn artifacts_url(base_url: &str, id: i64) -> String {
        format!("{}/api/v4/jobs/{}/artifacts", base_url.trim_end_matches('/'), id)
    }

    fn with_token(request: RequestBuilder, credentials: &JobCredentials) -> RequestBuilder {
        if credentials.token.is_empty() {
            request
        } else {
            request.header(JOB_TOKEN_HEADER, &credentials.token)
        }
    }

    /// Upload `body` as the multipart `file` part.
    pub fn upload_raw_artifacts<R>(
        &self,
        credentials: &JobCredentials,
        base_url: &str,
        body: R,
        options: &ArtifactsOptions,
    ) -> UploadState
    where
        R: Read + Send + 'static,
    {
        let url = Self::artifacts_url(base_url, credentials.id);
        let params = options.params();

        let mut form = Form::new();
        for (name, value) in &params {
            form = form.text(*name, value.clone());
        }
        form = form.part("file", Part::reader(body).file_name(options.base_name.clone()));

        let request = self.upload.post(&url).query(&params).multipart(form);
        let prefix = if options.artifact_type.is_empty() {
            "Uploading artifacts to coordinator...".to_string()
        } else {
            format!("Uploading artifacts as {:?} to coordinator...", options.artifact_type)
        };

        let response = match Self::with_token(request, credentials).send() {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(id = credentials.id, url = %clean_url(&url), error = %e, "{prefix} error");
                return UploadState::Failed;
            }
        };

        let status = response.status();
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let message = response_message(response);

        match status {
            StatusCode::CREATED => {
                tracing::info!(id = credentials.id, "{prefix} {message}");
                UploadState::Succeeded
            }
            StatusCode::TEMPORARY_REDIRECT => {
                if location.is_empty() {
                    tracing::error!(id = credentials.id, status = status.as_u16(), "{prefix} {message} empty location");
                    UploadState::Failed
                } else {
                    UploadState::Redirected(location)
                }
            }
            StatusCode::FORBIDDEN => {
                tracing::error!(id = credentials.id, status = status.as_u16(), "{prefix} {message}");
                UploadState::Forbidden
            }
            StatusCode::PAYLOAD_TOO_LARGE => {
                tracing::error!(id = credentials.id, status = status.as_u16(), "{prefix} {message}");
                UploadState::TooLarge
            }
            StatusCode::SERVICE_UNAVAILABLE => {
                tracing::error!(id = credentials.id, status = status.as_u16(), "{prefix} {message}");
                UploadState::ServiceUnavailable
            }
            _ => {
                tracing::warn!(id = credentials.id, status = status.as_u16(), "{prefix} {message}");
                UploadState::Failed
            }
        }
    }

    /// Download the job's artifacts archive into `writer`.
    ///
    /// `direct_download` is sent as `?direct_download=<bool>` when set.
    pub fn download_artifacts<W>(
        &self,
        credentials: &JobCredentials,
        writer: &mut W,
        direct_download: Option<bool>,
    ) -> DownloadState
    where
        W: Write + ?Sized,
    {
        let url = Self::artifacts_url(&credentials.url, credentials.id);
        let mut request = self.download.get(&url);
        if let Some(direct) = direct_download {
            request = request.query(&[("direct_download", direct.to_string())]);
        }

        let prefix = "Downloading artifacts from coordinator...";
        let mut response = match Self::with_token(request, credentials).send() {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(id = credentials.id, error = %e, "{prefix} error");
                return DownloadState::Failed;
            }
        };

        let status = response.status();
        let host = response.url().host_str().unwrap_or_default().to_string();
        match status {
            StatusCode::OK => match response.copy_to(writer) {
                Ok(_) => {
                    tracing::info!(id = credentials.id, host = %host, "{prefix} ok");
                    DownloadState::Succeeded
                }
                Err(e) => {
                    tracing::error!(id = credentials.id, host = %host, error = %e, "{prefix} error");
                    DownloadState::Failed
                }
            },
            StatusCode::FORBIDDEN => {
                let message = response_message(response);
                tracing::error!(id = credentials.id, host = %host, status = %message, "{prefix} forbidden");
                DownloadState::Forbidden
            }
            StatusCode::UNAUTHORIZED => {
                tracing::error!(id = credentials.id, status = status.as_u16(), "{prefix} unauthorized");
                DownloadState::Unauthorized
            }
            StatusCode::NOT_FOUND => {
                tracing::error!(id = credentials.id, "{prefix} not found");
                DownloadState::NotFound
            }
            _ => {
                tracing::warn!(id = credentials.id, status = status.as_u16(), "{prefix} failed");
                DownloadState::Failed
            }
        }
    }
}

/// Status line plus the `message` field of a JSON error body, if any.
fn response_message(response: Response) -> String {
    let status = response.status();
    let mut text = format!("{} {}", status.as_u16(), status.canonical_reason().unwrap_or_default());
    let body = response.text().unwrap_or_default();
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&body) {
        if let Some(message) = value.get("message") {
            let message = match message {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            text.push_str(" (");
            text.push_str(&message);
            text.push(')');
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifacts_url() {
        assert_eq!(
            Coordinator::artifacts_url("https://gitlab.example.com/", 42),
            "https://gitlab.example.com/api/v4/jobs/42/artifacts"
        );
    }

    #[test]
    fn test_params_skip_empty() {
        let opts = ArtifactsOptions {
            base_name: "artifacts.zip".into(),
            expire_in: String::new(),
            format: "zip".into(),
            artifact_type: "archive".into(),
        };
        assert_eq!(
            opts.params(),
            vec![
                ("artifact_format", "zip".to_string()),
                ("artifact_type", "archive".to_string())
            ]
        );
    }
}
