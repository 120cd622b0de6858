//! Shared helpers for command integration tests

#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use runner_archive::CodecOptions;
use runner_helper::commands::{ArtifactsDownloader, ArtifactsUploader, CacheArchiver, CacheExtractor};
use runner_helper::meter::TransferMeterArgs;
use runner_helper::network::JobCredentials;
use runner_helper::provenance::ProvenanceArgs;
use runner_helper::{Context, PathArgs, RetryHelper};

pub const JOB_ID: i64 = 1;
pub const JOB_TOKEN: &str = "job-token";
pub const ARTIFACTS_PATH: &str = "/api/v4/jobs/1/artifacts";

/// Context rooted at `wd` with default codecs.
pub fn context(wd: &Path) -> Context {
    Context::new(wd, CodecOptions::default())
}

/// Write `files` (relative path, contents) under `root`, creating parents.
pub fn write_tree(root: &Path, files: &[(&str, &str)]) {
    for (name, contents) in files {
        let path = root.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, contents).unwrap();
    }
}

pub fn credentials(url: &str) -> JobCredentials {
    JobCredentials {
        id: JOB_ID,
        token: JOB_TOKEN.to_string(),
        url: url.to_string(),
        tls_ca_file: None,
    }
}

/// Retry policy that does not slow the suite down.
pub fn fast_retry(retry: u32) -> RetryHelper {
    RetryHelper::new(retry, Duration::from_millis(5))
}

pub fn uploader(url: &str, paths: &[&str], format: &str) -> ArtifactsUploader {
    ArtifactsUploader {
        credentials: credentials(url),
        paths: PathArgs {
            paths: paths.iter().map(|p| p.to_string()).collect(),
            ..PathArgs::default()
        },
        retry: fast_retry(2),
        provenance: ProvenanceArgs::default(),
        name: "artifacts".to_string(),
        expire_in: String::new(),
        format: format.to_string(),
        artifact_type: String::new(),
        compression_level: String::new(),
    }
}

pub fn downloader(url: &str) -> ArtifactsDownloader {
    ArtifactsDownloader {
        credentials: credentials(url),
        retry: fast_retry(2),
        meter: TransferMeterArgs::default(),
        direct_download: false,
    }
}

pub fn cache_archiver(file: &str, paths: &[&str], url: &str) -> CacheArchiver {
    CacheArchiver {
        paths: PathArgs {
            paths: paths.iter().map(|p| p.to_string()).collect(),
            ..PathArgs::default()
        },
        retry: fast_retry(2),
        meter: TransferMeterArgs::default(),
        file: file.to_string(),
        url: url.to_string(),
        gocloud_url: String::new(),
        timeout: 1,
        headers: Vec::new(),
        metadata: String::new(),
        compression_level: String::new(),
        compression_format: "zip".to_string(),
        max_uploaded_archive_size: 0,
        env_file: String::new(),
    }
}

pub fn cache_extractor(file: &str, url: &str) -> CacheExtractor {
    CacheExtractor {
        retry: fast_retry(2),
        meter: TransferMeterArgs::default(),
        file: file.to_string(),
        url: url.to_string(),
        gocloud_url: String::new(),
        timeout: 1,
    }
}

/// Request bodies captured by a mock.
#[derive(Clone, Default)]
pub struct Captured(Arc<Mutex<Vec<Vec<u8>>>>);

impl Captured {
    /// Record the body of every request and answer with `response`.
    pub fn recorder(&self, response: &'static [u8]) -> impl Fn(&mockito::Request) -> Vec<u8> + Send + Sync + 'static {
        let bodies = self.0.clone();
        move |request| {
            if let Ok(body) = request.body() {
                bodies.lock().unwrap().push(body.clone());
            }
            response.to_vec()
        }
    }

    pub fn bodies(&self) -> Vec<Vec<u8>> {
        self.0.lock().unwrap().clone()
    }

    pub fn last(&self) -> Vec<u8> {
        self.bodies().pop().unwrap_or_default()
    }
}

/// Contents of the last part of a multipart body.
pub fn last_part(body: &[u8]) -> Vec<u8> {
    let first_line_end = find(body, b"\r\n", 0).expect("boundary line");
    let boundary = &body[..first_line_end];
    let mut closing = b"\r\n".to_vec();
    closing.extend_from_slice(boundary);
    closing.extend_from_slice(b"--");

    let end = rfind(body, &closing).expect("closing boundary");
    let mut opening = boundary.to_vec();
    opening.extend_from_slice(b"\r\n");
    let part = rfind(&body[..end], &opening).expect("last part");
    let start = find(body, b"\r\n\r\n", part).expect("part headers") + 4;
    body[start..end].to_vec()
}

pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    find(haystack, needle, 0).is_some()
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

/// Zip archive holding `files`, built with an independent writer.
pub fn zip_bytes(files: &[(&str, &str)]) -> Vec<u8> {
    use std::io::Write;

    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    for (name, contents) in files {
        writer.start_file(*name, options).unwrap();
        writer.write_all(contents.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// Entry names of a zip archive, in central-directory order.
pub fn zip_names(bytes: &[u8]) -> Vec<String> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
    (0..archive.len())
        .map(|i| archive.by_index(i).unwrap().name().to_string())
        .collect()
}
