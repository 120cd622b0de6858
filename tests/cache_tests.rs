//! Cache archive freshness, upload headers and extraction

mod common;

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use filetime::{set_file_mtime, FileTime};
use mockito::{Matcher, Server};
use tempfile::TempDir;

use common::*;
use runner_helper::ErrorKind;

const CACHE_PATH: &str = "/cache/project/key.zip";

fn mtime(path: &Path) -> FileTime {
    FileTime::from_last_modification_time(&fs::metadata(path).unwrap())
}

fn ago(secs: u64) -> FileTime {
    FileTime::from_system_time(SystemTime::now() - Duration::from_secs(secs))
}

// =============================================================================
// Archiving
// =============================================================================

/// Test 1: the archive is rebuilt only when an input is newer than it
#[test]
fn test_cache_freshness_skip() {
    let wd = TempDir::new().unwrap();
    write_tree(wd.path(), &[("vendor/lib.rs", "pub fn lib() {}")]);
    let source = wd.path().join("vendor/lib.rs");
    let archive = wd.path().join("cache/cache.zip");
    let ctx = context(wd.path());
    let cmd = cache_archiver("cache/cache.zip", &["vendor"], "");

    set_file_mtime(&source, ago(300)).unwrap();
    set_file_mtime(wd.path().join("vendor"), ago(300)).unwrap();
    cmd.execute(&ctx).unwrap();
    assert!(archive.exists());

    let stamp = ago(100);
    set_file_mtime(&archive, stamp).unwrap();
    cmd.execute(&ctx).unwrap();
    assert_eq!(mtime(&archive), stamp);

    set_file_mtime(&source, ago(50)).unwrap();
    cmd.execute(&ctx).unwrap();
    assert!(mtime(&archive) > stamp);
}

/// Test 2: the archive is rebuilt into place and readable by extraction
#[test]
fn test_archive_then_extract_locally() {
    let wd = TempDir::new().unwrap();
    write_tree(wd.path(), &[("deps/a.txt", "A"), ("deps/nested/b.txt", "B")]);
    let ctx = context(wd.path());

    cache_archiver("cache.zip", &["deps"], "").execute(&ctx).unwrap();
    fs::remove_dir_all(wd.path().join("deps")).unwrap();

    cache_extractor("cache.zip", "").execute(&ctx).unwrap();
    assert_eq!(fs::read_to_string(wd.path().join("deps/a.txt")).unwrap(), "A");
    assert_eq!(fs::read_to_string(wd.path().join("deps/nested/b.txt")).unwrap(), "B");
}

/// Test 3: every cache format is fully written through the buffered temp file
#[test]
fn test_archive_formats_round_trip() {
    for format in ["zip", "tarzstd"] {
        let wd = TempDir::new().unwrap();
        let big = "x".repeat(256 * 1024);
        write_tree(wd.path(), &[("deps/big.txt", big.as_str()), ("deps/small.txt", "s")]);
        let ctx = context(wd.path());

        let mut cmd = cache_archiver("cache.zip", &["deps"], "");
        cmd.compression_format = format.to_string();
        cmd.execute(&ctx).unwrap();
        fs::remove_dir_all(wd.path().join("deps")).unwrap();

        cache_extractor("cache.zip", "").execute(&ctx).unwrap();
        assert_eq!(fs::read_to_string(wd.path().join("deps/big.txt")).unwrap(), big, "{format}");
        assert_eq!(fs::read_to_string(wd.path().join("deps/small.txt")).unwrap(), "s", "{format}");
    }
}

/// Test 4: paths expand environment variables and metadata lands in a sidecar
#[test]
fn test_archive_expands_paths_and_writes_metadata() {
    let wd = TempDir::new().unwrap();
    write_tree(wd.path(), &[("deps/a.txt", "A"), ("other/b.txt", "B")]);
    std::env::set_var("RUNNER_HELPER_TEST_CACHE_DIR", "deps");

    let mut cmd = cache_archiver("cache.zip", &["${RUNNER_HELPER_TEST_CACHE_DIR}"], "");
    cmd.metadata = r#"{"branch":"main"}"#.to_string();
    cmd.execute(&context(wd.path())).unwrap();

    let names = zip_names(&fs::read(wd.path().join("cache.zip")).unwrap());
    assert_eq!(names, vec!["deps/", "deps/a.txt"]);
    assert_eq!(
        fs::read_to_string(wd.path().join("cache.zip.metadata")).unwrap(),
        r#"{"branch":"main"}"#
    );
}

/// Test 5: default upload headers carry content type, date and length
#[test]
fn test_upload_default_headers() {
    let mut server = Server::new();
    let mock = server
        .mock("PUT", CACHE_PATH)
        .match_query(Matcher::Any)
        .match_header("content-type", "application/octet-stream")
        .match_header("last-modified", Matcher::Regex(r"^\w{3}, \d{2} \w{3} \d{4} \d{2}:\d{2}:\d{2} GMT$".into()))
        .match_header("content-length", Matcher::Regex(r"^\d+$".into()))
        .with_status(200)
        .expect(1)
        .create();

    let wd = TempDir::new().unwrap();
    write_tree(wd.path(), &[("deps/a.txt", "A")]);
    let url = format!("{}{}?X-Amz-Signature=secret", server.url(), CACHE_PATH);

    cache_archiver("cache.zip", &["deps"], &url)
        .execute(&context(wd.path()))
        .unwrap();
    mock.assert();
}

/// Test 6: a custom content type replaces the defaults and drops the date
#[test]
fn test_upload_custom_headers() {
    let mut server = Server::new();
    let mock = server
        .mock("PUT", CACHE_PATH)
        .match_header("content-type", "application/zip")
        .match_header("x-goog-meta-owner", "ci")
        .match_header("last-modified", Matcher::Missing)
        .with_status(200)
        .expect(1)
        .create();

    let wd = TempDir::new().unwrap();
    write_tree(wd.path(), &[("deps/a.txt", "A")]);
    let mut cmd = cache_archiver("cache.zip", &["deps"], &format!("{}{}", server.url(), CACHE_PATH));
    cmd.headers = vec![
        "Content-Type: application/zip".to_string(),
        " X-Goog-Meta-Owner :ci".to_string(),
        "malformed".to_string(),
    ];

    cmd.execute(&context(wd.path())).unwrap();
    mock.assert();
}

/// Test 7: server errors are retried, client errors are not
#[test]
fn test_upload_retry_policy() {
    let mut server = Server::new();
    let failing = server
        .mock("PUT", CACHE_PATH)
        .with_status(502)
        .expect(3)
        .create();

    let wd = TempDir::new().unwrap();
    write_tree(wd.path(), &[("deps/a.txt", "A")]);
    let url = format!("{}{}", server.url(), CACHE_PATH);
    let err = cache_archiver("cache.zip", &["deps"], &url)
        .execute(&context(wd.path()))
        .unwrap_err();
    assert!(err.is_retryable());
    failing.assert();

    let mut server = Server::new();
    let rejected = server
        .mock("PUT", CACHE_PATH)
        .with_status(400)
        .expect(1)
        .create();
    let wd = TempDir::new().unwrap();
    write_tree(wd.path(), &[("deps/a.txt", "A")]);
    let url = format!("{}{}", server.url(), CACHE_PATH);
    let err = cache_archiver("cache.zip", &["deps"], &url)
        .execute(&context(wd.path()))
        .unwrap_err();
    assert!(!err.is_retryable());
    rejected.assert();
}

/// Test 8: an archive over the size cap stays local
#[test]
fn test_oversized_archive_not_uploaded() {
    let mut server = Server::new();
    let mock = server.mock("PUT", CACHE_PATH).expect(0).create();

    let wd = TempDir::new().unwrap();
    write_tree(wd.path(), &[("deps/a.txt", &"x".repeat(4096))]);
    let mut cmd = cache_archiver("cache.zip", &["deps"], &format!("{}{}", server.url(), CACHE_PATH));
    cmd.max_uploaded_archive_size = 10;

    cmd.execute(&context(wd.path())).unwrap();
    assert!(wd.path().join("cache.zip").exists());
    mock.assert();
}

// =============================================================================
// Extraction
// =============================================================================

/// Test 9: a newer remote archive replaces the local one and keeps its date
#[test]
fn test_extract_downloads_newer_remote() {
    let mut server = Server::new();
    let mock = server
        .mock("GET", CACHE_PATH)
        .with_status(200)
        .with_header("Last-Modified", "Sun, 06 Nov 2022 08:49:37 GMT")
        .with_body(zip_bytes(&[("deps/fresh.txt", "fresh")]))
        .expect(1)
        .create();

    let wd = TempDir::new().unwrap();
    let archive = wd.path().join("cache/key.zip");
    fs::create_dir_all(archive.parent().unwrap()).unwrap();
    fs::write(&archive, zip_bytes(&[("deps/stale.txt", "stale")])).unwrap();
    set_file_mtime(&archive, FileTime::from_unix_time(946_684_800, 0)).unwrap();

    cache_extractor("cache/key.zip", &format!("{}{}", server.url(), CACHE_PATH))
        .execute(&context(wd.path()))
        .unwrap();

    mock.assert();
    assert_eq!(fs::read_to_string(wd.path().join("deps/fresh.txt")).unwrap(), "fresh");
    assert!(!wd.path().join("deps/stale.txt").exists());
    assert_eq!(mtime(&archive).unix_seconds(), 1_667_724_577);
}

/// Test 10: a server error on download is retried and the next response extracted
#[test]
fn test_extract_retries_server_error() {
    let mut server = Server::new();
    let unavailable = server.mock("GET", CACHE_PATH).with_status(503).expect(1).create();
    let ok = server
        .mock("GET", CACHE_PATH)
        .with_status(200)
        .with_header("Last-Modified", "Sun, 06 Nov 2022 08:49:37 GMT")
        .with_body(zip_bytes(&[("deps/retried.txt", "second try")]))
        .expect(1)
        .create();

    let wd = TempDir::new().unwrap();
    cache_extractor("key.zip", &format!("{}{}", server.url(), CACHE_PATH))
        .execute(&context(wd.path()))
        .unwrap();

    unavailable.assert();
    ok.assert();
    assert_eq!(fs::read_to_string(wd.path().join("deps/retried.txt")).unwrap(), "second try");
    assert_eq!(mtime(&wd.path().join("key.zip")).unix_seconds(), 1_667_724_577);
}

/// Test 11: an up-to-date local archive is extracted without replacing it
#[test]
fn test_extract_keeps_up_to_date_local() {
    let mut server = Server::new();
    let mock = server
        .mock("GET", CACHE_PATH)
        .with_status(200)
        .with_header("Last-Modified", "Sun, 06 Nov 1994 08:49:37 GMT")
        .with_body("not a zip")
        .expect(1)
        .create();

    let wd = TempDir::new().unwrap();
    let archive = wd.path().join("key.zip");
    let local = zip_bytes(&[("deps/local.txt", "local")]);
    fs::write(&archive, &local).unwrap();

    cache_extractor("key.zip", &format!("{}{}", server.url(), CACHE_PATH))
        .execute(&context(wd.path()))
        .unwrap();

    mock.assert();
    assert_eq!(fs::read(&archive).unwrap(), local);
    assert_eq!(fs::read_to_string(wd.path().join("deps/local.txt")).unwrap(), "local");
}

/// Test 12: a missing remote archive is not retried and nothing is extracted
#[test]
fn test_extract_remote_not_found() {
    let mut server = Server::new();
    let mock = server.mock("GET", CACHE_PATH).with_status(404).expect(1).create();

    let wd = TempDir::new().unwrap();
    let err = cache_extractor("key.zip", &format!("{}{}", server.url(), CACHE_PATH))
        .execute(&context(wd.path()))
        .unwrap_err();

    assert!(err.is_not_found());
    mock.assert();
    assert!(!wd.path().join("key.zip").exists());
}

/// Test 13: without a URL or local archive extraction reports not found
#[test]
fn test_extract_missing_local_archive() {
    let wd = TempDir::new().unwrap();
    let err = cache_extractor("key.zip", "")
        .execute(&context(wd.path()))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

/// Test 14: cache file is required
#[test]
fn test_extract_requires_file() {
    let wd = TempDir::new().unwrap();
    let err = cache_extractor("", "").execute(&context(wd.path())).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}
