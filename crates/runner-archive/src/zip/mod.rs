//! Zip codecs.
//!
//! Both archivers write through `zip::ZipWriter`. The legacy archiver
//! deflates entries in the calling thread. Fastzip deflates files on a worker
//! pool into single-entry staging archives, then merges them in pathname
//! order without recompressing. Entries carry the unix mode, an
//! extended-timestamp extra (`0x5455`) and a unix uid/gid extra (`0x7875`).

mod archiver;
mod extract;
mod fastzip;
mod writer;

pub use archiver::ZipArchiver;
pub use extract::{is_git_path, ZipEntry, ZipExtractor};
pub use fastzip::FastZipArchiver;
pub use writer::{EntryHeader, ZipSpool};

use std::path::Path;
use std::sync::Arc;

use ::zip::CompressionMethod;

use crate::codec::{Archiver, Extractor, Sink, Source};
use crate::error::ArchiveResult;
use crate::format::CompressionLevel;
use crate::options::CodecOptions;
use crate::registry::{ArchiverFactory, ExtractorFactory};

pub(crate) const EXTRA_EXT_TIMESTAMP: u16 = 0x5455;
pub(crate) const EXTRA_UNIX_OWNER: u16 = 0x7875;

pub(crate) const S_IFMT: u32 = 0o170_000;
pub(crate) const S_IFDIR: u32 = 0o040_000;
pub(crate) const S_IFLNK: u32 = 0o120_000;
pub(crate) const S_IFREG: u32 = 0o100_000;

/// Compression method of a zip entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Store,
    Deflate(u32),
}

impl Method {
    pub fn for_level(level: CompressionLevel) -> Self {
        match level.deflate_level() {
            Some(l) => Method::Deflate(l),
            None => Method::Store,
        }
    }

    /// Writer method and level. Stored entries take no level.
    pub(crate) fn compression(self) -> (CompressionMethod, Option<i64>) {
        match self {
            Method::Store => (CompressionMethod::Stored, None),
            Method::Deflate(level) => (CompressionMethod::Deflated, Some(i64::from(level))),
        }
    }
}

/// Factories for the sequential zip codec.
pub fn legacy_factories() -> (ArchiverFactory, ExtractorFactory) {
    fn archiver(sink: Sink, root: &Path, level: CompressionLevel) -> ArchiveResult<Box<dyn Archiver>> {
        Ok(Box::new(ZipArchiver::new(sink, root, level)?))
    }
    fn extractor(source: Source, size: u64, dest: &Path) -> ArchiveResult<Box<dyn Extractor>> {
        Ok(Box::new(ZipExtractor::new(source, size, dest, 1)?))
    }
    (Arc::new(archiver), Arc::new(extractor))
}

/// Factories for the parallel zip codec, configured by `opts`.
pub fn fastzip_factories(opts: CodecOptions) -> (ArchiverFactory, ExtractorFactory) {
    let archive_opts = opts.clone();
    let archiver: ArchiverFactory = Arc::new(
        move |sink: Sink, root: &Path, level: CompressionLevel| -> ArchiveResult<Box<dyn Archiver>> {
            Ok(Box::new(FastZipArchiver::new(sink, root, level, &archive_opts)?))
        },
    );
    let concurrency = opts.extractor_concurrency;
    let extractor: ExtractorFactory = Arc::new(
        move |source: Source, size: u64, dest: &Path| -> ArchiveResult<Box<dyn Extractor>> {
            Ok(Box::new(ZipExtractor::new(source, size, dest, concurrency)?))
        },
    );
    (archiver, extractor)
}
