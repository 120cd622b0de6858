//! Archiver and extractor contracts.

use std::collections::BTreeMap;
use std::fs::Metadata;
use std::io::Write;
use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::error::ArchiveResult;
use crate::reader::ReaderAt;

/// Files to archive: pathname (relative to the archive root, or absolute
/// beneath it) mapped to its `symlink_metadata`.
///
/// A `BTreeMap` iterates in lexicographic pathname order, which is the entry
/// order every archiver emits.
pub type FileSet = BTreeMap<String, Metadata>;

/// Byte sink an archiver writes into.
pub type Sink = Box<dyn Write + Send>;

/// Random-access input an extractor reads from.
pub type Source = Arc<dyn ReaderAt>;

/// Produces one archive stream from a [`FileSet`].
pub trait Archiver: Send {
    /// Write every entry of `files`, then finish the stream.
    ///
    /// `cancel` is checked between entries.
    fn archive(self: Box<Self>, files: &FileSet, cancel: &CancelToken) -> ArchiveResult<()>;
}

/// Writes the entries of one archive under a destination directory.
pub trait Extractor: Send {
    fn extract(self: Box<Self>, cancel: &CancelToken) -> ArchiveResult<()>;
}
