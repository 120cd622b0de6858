//! Artifact upload and download against a mock job API

mod common;

use std::fs;

use mockito::{Matcher, Server};
use tempfile::TempDir;

use common::*;
use runner_helper::ErrorKind;

// =============================================================================
// Upload
// =============================================================================

/// Test 1: a single raw file is sent as-is under the archive name
#[test]
fn test_raw_single_file_upload() {
    let mut server = Server::new();
    let captured = Captured::default();
    let mock = server
        .mock("POST", ARTIFACTS_PATH)
        .match_query(Matcher::UrlEncoded("artifact_format".into(), "raw".into()))
        .match_header("JOB-TOKEN", JOB_TOKEN)
        .with_status(201)
        .with_body_from_request(captured.recorder(b"{}"))
        .expect(1)
        .create();

    let wd = TempDir::new().unwrap();
    write_tree(wd.path(), &[("test_file", "foobar")]);

    uploader(&server.url(), &["test_file"], "raw")
        .execute(&context(wd.path()))
        .unwrap();

    mock.assert();
    let body = captured.last();
    assert!(contains(&body, b"filename=\"artifacts\""));
    assert_eq!(last_part(&body), b"foobar");
}

/// Test 2: raw format refuses more than one file before any request
#[test]
fn test_raw_rejects_multiple_files() {
    let mut server = Server::new();
    let mock = server
        .mock("POST", ARTIFACTS_PATH)
        .match_query(Matcher::Any)
        .expect(0)
        .create();

    let wd = TempDir::new().unwrap();
    write_tree(wd.path(), &[("a.txt", "A"), ("b.txt", "B")]);

    let err = uploader(&server.url(), &["a.txt", "b.txt"], "raw")
        .execute(&context(wd.path()))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TooManyRawFiles);
    mock.assert();
}

/// Test 3: nothing selected means nothing uploaded
#[test]
fn test_no_files_no_request() {
    let mut server = Server::new();
    let mock = server
        .mock("POST", ARTIFACTS_PATH)
        .match_query(Matcher::Any)
        .expect(0)
        .create();

    let wd = TempDir::new().unwrap();
    uploader(&server.url(), &["missing/**"], "zip")
        .execute(&context(wd.path()))
        .unwrap();
    mock.assert();
}

/// Test 4: service unavailable is retried up to six attempts in total
#[test]
fn test_service_unavailable_then_created() {
    let mut server = Server::new();
    let unavailable = server
        .mock("POST", ARTIFACTS_PATH)
        .match_query(Matcher::Any)
        .with_status(503)
        .expect(5)
        .create();
    let created = server
        .mock("POST", ARTIFACTS_PATH)
        .match_query(Matcher::Any)
        .with_status(201)
        .expect(1)
        .create();

    let wd = TempDir::new().unwrap();
    write_tree(wd.path(), &[("a.txt", "A")]);

    uploader(&server.url(), &["a.txt"], "zip")
        .execute(&context(wd.path()))
        .unwrap();

    unavailable.assert();
    created.assert();
}

/// Test 5: six consecutive 503s exhaust the raised cap
#[test]
fn test_service_unavailable_exhausted() {
    let mut server = Server::new();
    let unavailable = server
        .mock("POST", ARTIFACTS_PATH)
        .match_query(Matcher::Any)
        .with_status(503)
        .expect(6)
        .create();

    let wd = TempDir::new().unwrap();
    write_tree(wd.path(), &[("a.txt", "A")]);

    let err = uploader(&server.url(), &["a.txt"], "zip")
        .execute(&context(wd.path()))
        .unwrap_err();

    assert_eq!(err.inner().kind(), ErrorKind::ServiceUnavailable);
    unavailable.assert();
}

/// Test 6: forbidden and too-large are not retried
#[test]
fn test_fatal_statuses_not_retried() {
    for (status, kind) in [(403, ErrorKind::PermissionDenied), (413, ErrorKind::TooLarge)] {
        let mut server = Server::new();
        let mock = server
            .mock("POST", ARTIFACTS_PATH)
            .match_query(Matcher::Any)
            .with_status(status)
            .with_body(r#"{"message":"nope"}"#)
            .expect(1)
            .create();

        let wd = TempDir::new().unwrap();
        write_tree(wd.path(), &[("a.txt", "A")]);

        let err = uploader(&server.url(), &["a.txt"], "zip")
            .execute(&context(wd.path()))
            .unwrap_err();
        assert_eq!(err.kind(), kind);
        mock.assert();
    }
}

/// Test 7: a temporary redirect re-sends the whole body to the new origin
#[test]
fn test_redirect_resends_to_new_origin() {
    let mut target = Server::new();
    let captured = Captured::default();
    let created = target
        .mock("POST", ARTIFACTS_PATH)
        .match_query(Matcher::Any)
        .with_status(201)
        .with_body_from_request(captured.recorder(b"{}"))
        .expect(1)
        .create();

    let mut origin = Server::new();
    let redirected = origin
        .mock("POST", ARTIFACTS_PATH)
        .match_query(Matcher::Any)
        .with_status(307)
        .with_header("Location", &format!("{}{}", target.url(), ARTIFACTS_PATH))
        .expect(1)
        .create();

    let wd = TempDir::new().unwrap();
    write_tree(wd.path(), &[("report.txt", "redirected payload")]);

    uploader(&origin.url(), &["report.txt"], "raw")
        .execute(&context(wd.path()))
        .unwrap();

    redirected.assert();
    created.assert();
    assert_eq!(last_part(&captured.last()), b"redirected payload");
}

// =============================================================================
// Round trip
// =============================================================================

/// Test 8: files uploaded as zip come back intact after download
#[test]
fn test_zip_round_trip() {
    let mut server = Server::new();
    let captured = Captured::default();
    let upload = server
        .mock("POST", ARTIFACTS_PATH)
        .match_query(Matcher::Any)
        .with_status(201)
        .with_body_from_request(captured.recorder(b"{}"))
        .expect(1)
        .create();

    let src = TempDir::new().unwrap();
    write_tree(src.path(), &[("a.txt", "A"), ("b.txt", "B")]);
    uploader(&server.url(), &["a.txt", "b.txt"], "zip")
        .execute(&context(src.path()))
        .unwrap();
    upload.assert();

    let body = captured.last();
    assert!(contains(&body, b"filename=\"artifacts.zip\""));
    let archive = last_part(&body);
    assert!(archive.starts_with(b"PK\x03\x04"));

    let download = server
        .mock("GET", ARTIFACTS_PATH)
        .match_query(Matcher::Any)
        .match_header("JOB-TOKEN", JOB_TOKEN)
        .with_status(200)
        .with_body(archive)
        .expect(1)
        .create();

    let dst = TempDir::new().unwrap();
    downloader(&server.url()).execute(&context(dst.path())).unwrap();
    download.assert();

    assert_eq!(fs::read_to_string(dst.path().join("a.txt")).unwrap(), "A");
    assert_eq!(fs::read_to_string(dst.path().join("b.txt")).unwrap(), "B");
}

// =============================================================================
// Download
// =============================================================================

/// Test 9: a missing archive is reported without retrying
#[test]
fn test_download_not_found() {
    let mut server = Server::new();
    let mock = server
        .mock("GET", ARTIFACTS_PATH)
        .match_query(Matcher::Any)
        .with_status(404)
        .expect(1)
        .create();

    let dst = TempDir::new().unwrap();
    let err = downloader(&server.url()).execute(&context(dst.path())).unwrap_err();
    assert!(err.is_not_found());
    mock.assert();
}

/// Test 10: direct download is asked for on the first attempt only
#[test]
fn test_direct_download_first_attempt_only() {
    let mut server = Server::new();
    let direct = server
        .mock("GET", ARTIFACTS_PATH)
        .match_query(Matcher::UrlEncoded("direct_download".into(), "true".into()))
        .with_status(500)
        .expect(1)
        .create();
    let plain = server
        .mock("GET", ARTIFACTS_PATH)
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(zip_bytes(&[("out/log.txt", "done")]))
        .expect(1)
        .create();

    let dst = TempDir::new().unwrap();
    let mut cmd = downloader(&server.url());
    cmd.direct_download = true;
    cmd.execute(&context(dst.path())).unwrap();

    direct.assert();
    plain.assert();
    assert_eq!(fs::read_to_string(dst.path().join("out/log.txt")).unwrap(), "done");
}

/// Test 11: missing credentials fail before any request
#[test]
fn test_download_incomplete_arguments() {
    let dst = TempDir::new().unwrap();
    let mut cmd = downloader("http://127.0.0.1:9");
    cmd.credentials.token.clear();
    let err = cmd.execute(&context(dst.path())).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}
