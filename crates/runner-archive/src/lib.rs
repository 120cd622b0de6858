//! Archive codecs for the runner helper
//!
//! A [`Registry`] maps a [`Format`] key to archiver and extractor factories.
//! The built-in formats are:
//! - `raw`: a single file, copied byte-for-byte (archive only)
//! - `gzip`: one gzip member per regular file, concatenated
//! - `zip`: sequential or parallel (`fastzip`) zip
//! - `tarzstd`: tar inside a zstd frame
//!
//! Every archiver writes entries in lexicographic pathname order and rejects
//! pathnames that resolve outside its root. Every extractor rejects entries
//! that would land outside its destination.

pub mod cancel;
pub mod codec;
pub mod error;
pub mod format;
pub mod gzip;
pub mod meta;
pub mod options;
pub mod path;
pub mod raw;
pub mod reader;
pub mod registry;
pub mod tarzstd;
pub mod zip;

pub use cancel::CancelToken;
pub use codec::{Archiver, Extractor, FileSet, Sink, Source};
pub use error::{ArchiveError, ArchiveResult};
pub use format::{CompressionLevel, Format};
pub use options::CodecOptions;
pub use reader::{ReaderAt, SectionReader};
pub use registry::{sniff_format, ArchiverFactory, ExtractorFactory, Registry};
