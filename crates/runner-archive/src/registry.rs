//! Format → (archiver, extractor) factory map.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use crate::codec::{Archiver, Extractor, Sink, Source};
use crate::error::{ArchiveError, ArchiveResult};
use crate::format::{CompressionLevel, Format};
use crate::options::CodecOptions;
use crate::reader::ReaderAt;
use crate::{gzip, raw, tarzstd, zip};

/// Builds an archiver for a sink, root directory and compression level.
pub type ArchiverFactory =
    Arc<dyn Fn(Sink, &Path, CompressionLevel) -> ArchiveResult<Box<dyn Archiver>> + Send + Sync>;

/// Builds an extractor for a source of known size and a destination directory.
pub type ExtractorFactory =
    Arc<dyn Fn(Source, u64, &Path) -> ArchiveResult<Box<dyn Extractor>> + Send + Sync>;

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Codec registry.
///
/// Built once at program start and passed to commands; registration happens
/// before any command runs, so no locking is involved.
#[derive(Clone, Default)]
pub struct Registry {
    archivers: HashMap<Format, ArchiverFactory>,
    extractors: HashMap<Format, ExtractorFactory>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut archivers: Vec<_> = self.archivers.keys().map(Format::as_str).collect();
        let mut extractors: Vec<_> = self.extractors.keys().map(Format::as_str).collect();
        archivers.sort_unstable();
        extractors.sort_unstable();
        f.debug_struct("Registry")
            .field("archivers", &archivers)
            .field("extractors", &extractors)
            .finish()
    }
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in codecs.
    ///
    /// `zip` is served by fastzip when `opts.use_fastzip` is set, otherwise by
    /// the sequential writer. `fastzip` is always available under its own key.
    pub fn with_defaults(opts: &CodecOptions) -> Self {
        let mut registry = Self::new();

        registry.register(Format::RAW, Some(Arc::new(raw_archiver)), None);
        registry.register(
            Format::GZIP,
            Some(Arc::new(gzip_archiver)),
            Some(Arc::new(gzip_extractor)),
        );
        registry.register(
            Format::TAR_ZSTD,
            Some(Arc::new(tarzstd_archiver)),
            Some(Arc::new(tarzstd_extractor)),
        );

        let (legacy_archiver, legacy_extractor) = zip::legacy_factories();
        let (fast_archiver, fast_extractor) = zip::fastzip_factories(opts.clone());
        registry.register(
            Format::new("fastzip"),
            Some(fast_archiver.clone()),
            Some(fast_extractor.clone()),
        );
        if opts.use_fastzip {
            registry.register(Format::ZIP, Some(fast_archiver), Some(fast_extractor));
        } else {
            registry.register(Format::ZIP, Some(legacy_archiver), Some(legacy_extractor));
        }

        registry
    }

    /// Install factories for `format`. `None` leaves the current factory in
    /// place. Each replaced factory is handed back; a `None` argument
    /// replaces nothing and returns `None`.
    pub fn register(
        &mut self,
        format: Format,
        archiver: Option<ArchiverFactory>,
        extractor: Option<ExtractorFactory>,
    ) -> (Option<ArchiverFactory>, Option<ExtractorFactory>) {
        let prev_archiver = archiver.and_then(|a| self.archivers.insert(format.clone(), a));
        let prev_extractor = extractor.and_then(|e| self.extractors.insert(format, e));
        (prev_archiver, prev_extractor)
    }

    /// Construct an archiver for `format`.
    pub fn new_archiver(
        &self,
        format: &Format,
        sink: Sink,
        root: &Path,
        level: CompressionLevel,
    ) -> ArchiveResult<Box<dyn Archiver>> {
        let factory = self
            .archivers
            .get(format)
            .ok_or_else(|| unsupported(format))?;
        factory(sink, root, level)
    }

    /// Construct an extractor for `format`.
    pub fn new_extractor(
        &self,
        format: &Format,
        source: Source,
        size: u64,
        dest: &Path,
    ) -> ArchiveResult<Box<dyn Extractor>> {
        let factory = self
            .extractors
            .get(format)
            .ok_or_else(|| unsupported(format))?;
        factory(source, size, dest)
    }

    /// Open the archive file at `path` for extraction into `dest`, picking the
    /// extractor from its leading magic bytes.
    pub fn open_archive(&self, path: &Path, dest: &Path) -> ArchiveResult<Box<dyn Extractor>> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        let source: Source = Arc::new(file);
        let format = sniff_format(source.as_ref())?;
        tracing::debug!(path = %path.display(), format = %format, "opening archive");
        self.new_extractor(&format, source, size, dest)
    }

    pub fn has_archiver(&self, format: &Format) -> bool {
        self.archivers.contains_key(format)
    }

    pub fn has_extractor(&self, format: &Format) -> bool {
        self.extractors.contains_key(format)
    }
}

fn raw_archiver(sink: Sink, root: &Path, _level: CompressionLevel) -> ArchiveResult<Box<dyn Archiver>> {
    Ok(Box::new(raw::RawArchiver::new(sink, root)?))
}

fn gzip_archiver(sink: Sink, root: &Path, level: CompressionLevel) -> ArchiveResult<Box<dyn Archiver>> {
    Ok(Box::new(gzip::GzipArchiver::new(sink, root, level)?))
}

fn gzip_extractor(source: Source, size: u64, dest: &Path) -> ArchiveResult<Box<dyn Extractor>> {
    Ok(Box::new(gzip::GzipExtractor::new(source, size, dest)?))
}

fn tarzstd_archiver(sink: Sink, root: &Path, level: CompressionLevel) -> ArchiveResult<Box<dyn Archiver>> {
    Ok(Box::new(tarzstd::TarZstdArchiver::new(sink, root, level)?))
}

fn tarzstd_extractor(source: Source, size: u64, dest: &Path) -> ArchiveResult<Box<dyn Extractor>> {
    Ok(Box::new(tarzstd::TarZstdExtractor::new(source, size, dest)?))
}

/// Detect the format of an archive from its first bytes. Anything that is
/// neither zstd nor gzip is treated as zip.
pub fn sniff_format(source: &dyn ReaderAt) -> ArchiveResult<Format> {
    let mut magic = [0u8; 4];
    let mut filled = 0;
    while filled < magic.len() {
        let n = source.read_at(&mut magic[filled..], filled as u64)?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    let format = if filled >= 4 && magic == ZSTD_MAGIC {
        Format::TAR_ZSTD
    } else if filled >= 2 && magic[..2] == GZIP_MAGIC {
        Format::GZIP
    } else {
        Format::ZIP
    };
    Ok(format)
}

fn unsupported(format: &Format) -> ArchiveError {
    ArchiveError::UnsupportedFormat {
        format: format.to_string(),
    }
}
