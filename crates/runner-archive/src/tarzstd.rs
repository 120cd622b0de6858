//! Tar inside a zstd frame.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use filetime::FileTime;
use tar::{EntryType, Header, HeaderMode};

use crate::cancel::CancelToken;
use crate::codec::{Archiver, Extractor, FileSet, Sink, Source};
use crate::error::{ArchiveError, ArchiveResult};
use crate::format::CompressionLevel;
use crate::meta::{self, Deferred, EntryMeta};
use crate::path;
use crate::reader::SectionReader;

/// Streams files into a tar archive compressed with zstd.
pub struct TarZstdArchiver {
    sink: Sink,
    root: PathBuf,
    level: i32,
}

impl TarZstdArchiver {
    pub fn new(sink: Sink, root: &Path, level: CompressionLevel) -> ArchiveResult<Self> {
        Ok(Self {
            sink,
            root: path::resolve_root(root)?,
            level: level.zstd_level(),
        })
    }
}

impl Archiver for TarZstdArchiver {
    fn archive(self: Box<Self>, files: &FileSet, cancel: &CancelToken) -> ArchiveResult<()> {
        let Self { sink, root, level } = *self;
        let encoder = zstd::stream::write::Encoder::new(sink, level)?;
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);

        for name in files.keys() {
            cancel.check()?;

            let full = path::absolute(Path::new(name), &root);
            let md = match fs::symlink_metadata(&full) {
                Ok(md) => md,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    tracing::warn!(path = %name, "file does not exist, skipping");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let file_type = md.file_type();
            if meta::is_irregular(&file_type) {
                tracing::warn!(path = %name, "skipping irregular file");
                continue;
            }

            let entry = path::entry_name(&root, name, file_type.is_dir())?;
            let mut header = Header::new_gnu();
            header.set_metadata_in_mode(&md, HeaderMode::Complete);

            if file_type.is_symlink() {
                let target = fs::read_link(&full)?;
                builder.append_link(&mut header, &entry, &target)?;
            } else if file_type.is_dir() {
                header.set_size(0);
                builder.append_data(&mut header, &entry, io::empty())?;
            } else {
                let file = File::open(&full)?;
                builder.append_data(&mut header, &entry, file)?;
            }
        }

        let encoder = builder.into_inner()?;
        let mut sink = encoder.finish()?;
        sink.flush()?;
        Ok(())
    }
}

/// Extracts a tar+zstd archive with containment checks on every entry.
pub struct TarZstdExtractor {
    source: Source,
    size: u64,
    dest: PathBuf,
}

impl TarZstdExtractor {
    pub fn new(source: Source, size: u64, dest: &Path) -> ArchiveResult<Self> {
        Ok(Self {
            source,
            size,
            dest: path::resolve_root(dest)?,
        })
    }
}

impl Extractor for TarZstdExtractor {
    fn extract(self: Box<Self>, cancel: &CancelToken) -> ArchiveResult<()> {
        fs::create_dir_all(&self.dest)?;

        let section = SectionReader::new(self.source.clone(), 0, self.size);
        let decoder = zstd::stream::read::Decoder::new(section)?;
        let mut archive = tar::Archive::new(decoder);
        let mut deferred = Deferred::new();

        for entry in archive.entries()? {
            cancel.check()?;
            let mut entry = entry?;

            let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
            let target = path::contained_path(&self.dest, &name)?;
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }

            let header = entry.header();
            let entry_type = header.entry_type();
            let mut entry_meta = EntryMeta::new(
                header.mode()?,
                FileTime::from_unix_time(header.mtime()? as i64, 0),
            );
            if let (Ok(uid), Ok(gid)) = (header.uid(), header.gid()) {
                entry_meta = entry_meta.with_owner(uid as u32, gid as u32);
            }

            match entry_type {
                EntryType::Directory => {
                    fs::create_dir_all(&target)?;
                    deferred.dir(target, entry_meta);
                }
                EntryType::Symlink => {
                    let link = entry
                        .link_name()?
                        .ok_or_else(|| ArchiveError::malformed(format!("{}: symlink without target", name)))?
                        .into_owned();
                    deferred.symlink(target, link, entry_meta);
                }
                EntryType::Regular | EntryType::Continuous => {
                    if fs::symlink_metadata(&target).map(|m| m.file_type().is_symlink()).unwrap_or(false) {
                        fs::remove_file(&target)?;
                    }
                    let mut file = File::create(&target)?;
                    io::copy(&mut entry, &mut file)?;
                    drop(file);
                    entry_meta.apply(&target, false)?;
                }
                other => {
                    tracing::warn!(path = %name, entry_type = ?other, "skipping unsupported tar entry");
                }
            }
        }

        deferred.finish()?;
        Ok(())
    }
}
