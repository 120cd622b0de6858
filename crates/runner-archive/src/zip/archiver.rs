use std::fs::{self, File, Metadata};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use super::*;
use crate::cancel::CancelToken;
use crate::codec::FileSet;
use crate::meta;
use crate::path;

/// Sequential zip archiver.
pub struct ZipArchiver {
    sink: Sink,
    root: PathBuf,
    method: Method,
}

impl ZipArchiver {
    pub fn new(sink: Sink, root: &Path, level: CompressionLevel) -> ArchiveResult<Self> {
        Ok(Self {
            sink,
            root: path::resolve_root(root)?,
            method: Method::for_level(level),
        })
    }
}

impl Archiver for ZipArchiver {
    fn archive(self: Box<Self>, files: &FileSet, cancel: &CancelToken) -> ArchiveResult<()> {
        let Self { sink, root, method } = *self;
        let mut spool = ZipSpool::new(sink)?;

        for name in files.keys() {
            cancel.check()?;
            if let Some(entry) = prepare_entry(&root, name)? {
                write_entry(&mut spool, &entry, method)?;
            }
        }

        spool.finish()?;
        Ok(())
    }
}

pub(super) struct PreparedEntry {
    pub header: EntryHeader,
    pub full: PathBuf,
    pub md: Metadata,
}

/// Stat `name` and build its header. Missing and irregular files are
/// skipped with a warning.
pub(super) fn prepare_entry(root: &Path, name: &str) -> ArchiveResult<Option<PreparedEntry>> {
    let mut entry = path::entry_name(root, name, false)?;
    let full = path::absolute(Path::new(name), root);
    let md = match fs::symlink_metadata(&full) {
        Ok(md) => md,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::warn!(path = %name, "file does not exist, skipping");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    if meta::is_irregular(&md.file_type()) {
        tracing::warn!(path = %name, "skipping irregular file");
        return Ok(None);
    }

    if md.is_dir() && !entry.ends_with('/') {
        entry.push('/');
    }
    Ok(Some(PreparedEntry {
        header: EntryHeader::from_metadata(entry, &md),
        full,
        md,
    }))
}

/// Write one directory, symlink or regular file.
pub(super) fn write_entry<W: std::io::Write>(
    spool: &mut ZipSpool<W>,
    entry: &PreparedEntry,
    method: Method,
) -> ArchiveResult<()> {
    let file_type = entry.md.file_type();
    if file_type.is_dir() {
        spool.add_dir(&entry.header)
    } else if file_type.is_symlink() {
        let target = fs::read_link(&entry.full)?;
        spool.add_symlink(&entry.header, &target.to_string_lossy())
    } else {
        let file = File::open(&entry.full)?;
        spool.add_file(&entry.header, method, entry.md.len(), BufReader::new(file))
    }
}
