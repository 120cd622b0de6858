use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;

use ::zip::read::ZipFile;
use ::zip::{DateTime as ZipTime, ExtraField, ZipArchive};
use chrono::NaiveDate;
use crossbeam_channel::unbounded;
use filetime::FileTime;

use super::*;
use crate::cancel::CancelToken;
use crate::error::ArchiveError;
use crate::meta::{Deferred, EntryMeta};
use crate::path;
use crate::reader::SectionReader;

type Archive = ZipArchive<SectionReader>;

/// One central-directory record.
#[derive(Debug, Clone)]
pub struct ZipEntry {
    /// Position in the central directory.
    pub index: usize,
    pub name: String,
    pub size: u64,
    /// Unix mode including file type bits.
    pub mode: u32,
    pub mtime: i64,
    pub owner: Option<(u32, u32)>,
}

impl ZipEntry {
    fn from_file<R: Read>(index: usize, file: &ZipFile<'_, R>) -> Self {
        let name = file.name().replace('\\', "/");
        let is_dir = name.ends_with('/');
        let mode = match file.unix_mode() {
            Some(mode) if mode & S_IFMT != 0 => mode,
            Some(mode) if is_dir => S_IFDIR | (mode & 0o7777),
            Some(mode) => S_IFREG | (mode & 0o7777),
            None if is_dir => S_IFDIR | 0o755,
            None => S_IFREG | 0o644,
        };
        let mtime = file
            .extra_data_fields()
            .find_map(|field| match field {
                ExtraField::ExtendedTimestamp(ts) => ts.mod_time(),
                _ => None,
            })
            .map(|secs| i64::from(secs as i32))
            .or_else(|| file.last_modified().and_then(dos_to_unix))
            .unwrap_or(0);

        Self {
            index,
            name,
            size: file.size(),
            mode,
            mtime,
            owner: file.extra_data().and_then(unix_owner),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.name.ends_with('/') || self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    fn meta(&self) -> EntryMeta {
        let meta = EntryMeta::new(self.mode, FileTime::from_unix_time(self.mtime, 0));
        match self.owner {
            Some((uid, gid)) => meta.with_owner(uid, gid),
            None => meta,
        }
    }
}

/// Zip extractor reading through a [`ReaderAt`](crate::reader::ReaderAt).
///
/// The central directory is parsed once. Regular files are extracted by
/// `concurrency` workers, each on its own clone of the archive. Directories
/// and symlinks are finished afterwards.
pub struct ZipExtractor {
    source: Source,
    size: u64,
    dest: PathBuf,
    concurrency: usize,
}

impl ZipExtractor {
    pub fn new(source: Source, size: u64, dest: &Path, concurrency: usize) -> ArchiveResult<Self> {
        Ok(Self {
            source,
            size,
            dest: path::resolve_root(dest)?,
            concurrency: concurrency.max(1),
        })
    }

    fn open(&self) -> ArchiveResult<Archive> {
        let reader = SectionReader::new(self.source.clone(), 0, self.size);
        Ok(ZipArchive::new(reader)?)
    }

    /// List the central directory.
    pub fn entries(&self) -> ArchiveResult<Vec<ZipEntry>> {
        list(&mut self.open()?)
    }
}

fn list(archive: &mut Archive) -> ArchiveResult<Vec<ZipEntry>> {
    let mut entries = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let file = archive.by_index_raw(index)?;
        entries.push(ZipEntry::from_file(index, &file));
    }
    Ok(entries)
}

fn read_symlink_target(archive: &mut Archive, entry: &ZipEntry) -> ArchiveResult<PathBuf> {
    let mut target = String::new();
    archive.by_index(entry.index)?.read_to_string(&mut target)?;
    Ok(PathBuf::from(target))
}

fn extract_file(archive: &mut Archive, entry: &ZipEntry, target: &Path) -> ArchiveResult<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::symlink_metadata(target).map(|m| m.file_type().is_symlink()).unwrap_or(false) {
        fs::remove_file(target)?;
    }

    // the entry reader checks the CRC once it reaches the end
    let mut reader = archive.by_index(entry.index)?;
    let mut out = BufWriter::new(File::create(target)?);
    io::copy(&mut reader, &mut out)?;
    out.flush()?;
    drop(out);

    entry.meta().apply(target, false)?;
    Ok(())
}

impl Extractor for ZipExtractor {
    fn extract(self: Box<Self>, cancel: &CancelToken) -> ArchiveResult<()> {
        let mut archive = self.open()?;
        let entries = list(&mut archive)?;

        // resolve every destination before writing anything
        let mut targets = Vec::with_capacity(entries.len());
        for entry in &entries {
            targets.push(path::contained_path(&self.dest, &entry.name)?);
        }
        if entries.iter().any(|entry| is_git_path(&entry.name)) {
            tracing::warn!("Part of .git directory is on the list of files to extract");
            tracing::warn!("This may introduce unexpected problems");
        }
        fs::create_dir_all(&self.dest)?;

        let mut deferred = Deferred::new();
        let mut files = Vec::new();
        for (entry, target) in entries.iter().zip(targets) {
            if entry.is_dir() {
                fs::create_dir_all(&target)?;
                deferred.dir(target, entry.meta());
            } else if entry.is_symlink() {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                let link = read_symlink_target(&mut archive, entry)?;
                deferred.symlink(target, link, entry.meta());
            } else {
                files.push((entry, target));
            }
        }

        if self.concurrency == 1 || files.len() < 2 {
            for (entry, target) in &files {
                cancel.check()?;
                extract_file(&mut archive, entry, target)?;
            }
        } else {
            let (tx, rx) = unbounded();
            for job in &files {
                // rx is still held, so send cannot fail
                let _ = tx.send(job);
            }
            drop(tx);

            let abort = AtomicBool::new(false);
            let first_error: Mutex<Option<ArchiveError>> = Mutex::new(None);
            let shared = &archive;

            thread::scope(|scope| {
                for _ in 0..self.concurrency.min(files.len()) {
                    let rx = rx.clone();
                    let abort = &abort;
                    let first_error = &first_error;
                    let mut archive = shared.clone();
                    scope.spawn(move || {
                        for (entry, target) in rx.iter() {
                            if abort.load(Ordering::SeqCst) {
                                break;
                            }
                            let result = cancel
                                .check()
                                .and_then(|_| extract_file(&mut archive, entry, target));
                            if let Err(e) = result {
                                abort.store(true, Ordering::SeqCst);
                                if let Ok(mut slot) = first_error.lock() {
                                    slot.get_or_insert(e);
                                }
                                break;
                            }
                        }
                    });
                }
            });

            let error = first_error.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(e) = error {
                return Err(e);
            }
        }

        deferred.finish()?;
        tracing::debug!(dest = %self.dest.display(), entries = entries.len(), "zip extracted");
        Ok(())
    }
}

/// True when any component of the entry name is `.git`.
pub fn is_git_path(name: &str) -> bool {
    name.split(['/', '\\']).any(|part| part == ".git")
}

/// Uid and gid from the `0x7875` field of a raw extra block.
fn unix_owner(mut extra: &[u8]) -> Option<(u32, u32)> {
    while extra.len() >= 4 {
        let id = u16::from_le_bytes([extra[0], extra[1]]);
        let len = u16::from_le_bytes([extra[2], extra[3]]) as usize;
        let data = extra.get(4..4 + len)?;
        if id == EXTRA_UNIX_OWNER {
            return parse_unix_owner(data);
        }
        extra = &extra[4 + len..];
    }
    None
}

fn parse_unix_owner(data: &[u8]) -> Option<(u32, u32)> {
    let uid_len = *data.get(1)? as usize;
    let uid = read_var_le(data.get(2..2 + uid_len)?)?;
    let gid_len = *data.get(2 + uid_len)? as usize;
    let gid = read_var_le(data.get(3 + uid_len..3 + uid_len + gid_len)?)?;
    Some((uid, gid))
}

fn read_var_le(bytes: &[u8]) -> Option<u32> {
    if bytes.len() > 4 {
        return None;
    }
    Some(
        bytes
            .iter()
            .rev()
            .fold(0u32, |acc, b| (acc << 8) | u32::from(*b)),
    )
}

fn dos_to_unix(time: ZipTime) -> Option<i64> {
    NaiveDate::from_ymd_opt(i32::from(time.year()), u32::from(time.month()), u32::from(time.day()))?
        .and_hms_opt(u32::from(time.hour()), u32::from(time.minute()), u32::from(time.second()))
        .map(|dt| dt.and_utc().timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zip::writer::dos_datetime;
    use std::sync::Arc;

    fn header(name: &str, mode: u32) -> EntryHeader {
        EntryHeader {
            name: name.to_string(),
            mode,
            mtime: 1_600_000_000,
            owner: Some((7, 8)),
        }
    }

    #[test]
    fn test_dos_round_trip() {
        assert_eq!(dos_to_unix(dos_datetime(1_592_224_496)), Some(1_592_224_496));
    }

    #[test]
    fn test_unix_owner_extra() {
        let data = [1u8, 4, 0xe8, 0x03, 0, 0, 4, 0xe9, 0x03, 0, 0];
        assert_eq!(parse_unix_owner(&data), Some((1000, 1001)));
        assert_eq!(parse_unix_owner(&[1u8, 4, 0]), None);

        let mut extra = vec![0x55, 0x54, 5, 0, 1, 0, 0, 0, 0];
        extra.extend_from_slice(&[0x75, 0x78, 11, 0]);
        extra.extend_from_slice(&data);
        assert_eq!(unix_owner(&extra), Some((1000, 1001)));
        assert_eq!(unix_owner(&extra[..9]), None);
    }

    #[test]
    fn test_git_path() {
        assert!(is_git_path(".git/config"));
        assert!(is_git_path("vendor/lib/.git/HEAD"));
        assert!(!is_git_path(".gitignore"));
        assert!(!is_git_path("src/git/mod.rs"));
    }

    #[test]
    fn test_not_a_zip() {
        let data: Source = Arc::new(vec![0u8; 100]);
        let dir = tempfile::TempDir::new().unwrap();
        let extractor = ZipExtractor::new(data, 100, dir.path(), 1).unwrap();
        let err = extractor.entries().unwrap_err();
        assert!(matches!(err, ArchiveError::Zip(_) | ArchiveError::Io(_)), "{err}");
    }

    #[test]
    fn test_reads_own_output() {
        let mut spool = ZipSpool::new(Vec::new()).unwrap();
        spool
            .add_file(&header("a.txt", S_IFREG | 0o640), Method::Deflate(5), 8, &b"contents"[..])
            .unwrap();
        spool.add_dir(&header("d/", S_IFDIR | 0o700)).unwrap();
        let bytes = spool.finish().unwrap();
        let size = bytes.len() as u64;

        let dir = tempfile::TempDir::new().unwrap();
        let extractor = ZipExtractor::new(Arc::new(bytes), size, dir.path(), 1).unwrap();
        let entries = extractor.entries().unwrap();
        assert_eq!(entries.len(), 2);
        let entry = &entries[0];
        assert_eq!(entry.name, "a.txt");
        assert_eq!(entry.mode, S_IFREG | 0o640);
        assert_eq!(entry.mtime, 1_600_000_000);
        assert_eq!(entry.owner, Some((7, 8)));
        assert_eq!(entry.size, 8);
        assert!(entries[1].is_dir());
        assert_eq!(entries[1].mode & 0o7777, 0o700);
    }
}
