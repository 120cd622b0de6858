//! Raw format: a single file copied byte-for-byte.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::cancel::CancelToken;
use crate::codec::{Archiver, FileSet, Sink};
use crate::error::{ArchiveError, ArchiveResult};
use crate::path;

/// Copies exactly one file into the sink. There is no raw extractor.
pub struct RawArchiver {
    sink: Sink,
    root: PathBuf,
}

impl RawArchiver {
    pub fn new(sink: Sink, root: &Path) -> ArchiveResult<Self> {
        Ok(Self {
            sink,
            root: path::resolve_root(root)?,
        })
    }
}

impl Archiver for RawArchiver {
    fn archive(mut self: Box<Self>, files: &FileSet, cancel: &CancelToken) -> ArchiveResult<()> {
        if files.len() > 1 {
            return Err(ArchiveError::TooManyRawFiles);
        }
        let Some(name) = files.keys().next() else {
            return Ok(());
        };
        cancel.check()?;

        path::entry_name(&self.root, name, false)?;
        let mut file = File::open(path::absolute(Path::new(name), &self.root))?;
        io::copy(&mut file, &mut self.sink)?;
        self.sink.flush()?;
        Ok(())
    }
}
