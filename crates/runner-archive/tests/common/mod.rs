//! Shared helpers for codec integration tests

#![allow(dead_code)]

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use runner_archive::{CancelToken, CodecOptions, CompressionLevel, FileSet, Format, Registry};

/// In-memory sink that can be inspected after the archiver consumed it.
#[derive(Clone, Default)]
pub struct SharedBuffer(pub Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn bytes(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
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

/// Build a file set from relative names using `symlink_metadata`.
pub fn file_set(root: &Path, names: &[&str]) -> FileSet {
    names
        .iter()
        .map(|n| (n.to_string(), fs::symlink_metadata(root.join(n)).unwrap()))
        .collect()
}

pub fn registry() -> Registry {
    Registry::with_defaults(&CodecOptions::default())
}

pub fn fastzip_registry(workers: usize) -> Registry {
    let opts = CodecOptions {
        archiver_concurrency: workers,
        extractor_concurrency: workers,
        use_fastzip: true,
        ..CodecOptions::default()
    };
    Registry::with_defaults(&opts)
}

/// Archive `names` under `root` with `format` and return the bytes.
pub fn archive(registry: &Registry, format: &Format, root: &Path, names: &[&str]) -> Vec<u8> {
    archive_level(registry, format, root, names, CompressionLevel::Default)
}

pub fn archive_level(
    registry: &Registry,
    format: &Format,
    root: &Path,
    names: &[&str],
    level: CompressionLevel,
) -> Vec<u8> {
    let out = SharedBuffer::default();
    let archiver = registry
        .new_archiver(format, Box::new(out.clone()), root, level)
        .unwrap();
    archiver
        .archive(&file_set(root, names), &CancelToken::new())
        .unwrap();
    out.bytes()
}

/// Extract `bytes` with `format` into `dest`.
pub fn extract(registry: &Registry, format: &Format, bytes: Vec<u8>, dest: &Path) {
    let size = bytes.len() as u64;
    let extractor = registry
        .new_extractor(format, Arc::new(bytes), size, dest)
        .unwrap();
    extractor.extract(&CancelToken::new()).unwrap();
}
