use std::fs::{File, Metadata};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use ::zip::write::{FileOptions, FullFileOptions};
use ::zip::{DateTime as ZipTime, ZipArchive, ZipWriter, ZIP64_BYTES_THR};
use chrono::{DateTime, Datelike, Timelike};
use filetime::FileTime;

use super::*;
use crate::meta;

/// Deflate can grow incompressible input; entries this close to the zip64
/// threshold reserve zip64 sizes up front.
const LARGE_FILE_MARGIN: u64 = 1 << 24;

/// Name and metadata written for one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryHeader {
    /// Forward-slash name; directories end in `/`.
    pub name: String,
    /// Unix mode including the file type bits.
    pub mode: u32,
    /// Modification time in unix seconds.
    pub mtime: i64,
    pub owner: Option<(u32, u32)>,
}

impl EntryHeader {
    pub fn from_metadata(name: String, md: &Metadata) -> Self {
        let file_type = md.file_type();
        let kind = if file_type.is_dir() {
            S_IFDIR
        } else if file_type.is_symlink() {
            S_IFLNK
        } else {
            S_IFREG
        };
        Self {
            name,
            mode: kind | meta::mode_bits(md),
            mtime: FileTime::from_last_modification_time(md).unix_seconds(),
            owner: meta::owner(md),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR || self.name.ends_with('/')
    }

    /// Writer options for this entry. `size` is the expected uncompressed
    /// size; large entries get zip64 fields in the local header.
    pub fn options(&self, method: Method, size: u64) -> ArchiveResult<FullFileOptions<'static>> {
        let (compression, level) = method.compression();
        let mut options: FullFileOptions<'static> = FileOptions::default()
            .compression_method(compression)
            .compression_level(level)
            .unix_permissions(self.mode)
            .last_modified_time(dos_datetime(self.mtime))
            .large_file(is_large(size));

        let mtime = self.mtime.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;
        let mut stamp = vec![1u8];
        stamp.extend_from_slice(&mtime.to_le_bytes());
        options.add_extra_data(EXTRA_EXT_TIMESTAMP, stamp.into_boxed_slice(), false)?;

        if let Some((uid, gid)) = self.owner {
            let mut owner = vec![1u8, 4];
            owner.extend_from_slice(&uid.to_le_bytes());
            owner.push(4);
            owner.extend_from_slice(&gid.to_le_bytes());
            options.add_extra_data(EXTRA_UNIX_OWNER, owner.into_boxed_slice(), false)?;
        }
        Ok(options)
    }
}

pub(crate) fn is_large(size: u64) -> bool {
    size.saturating_add(LARGE_FILE_MARGIN) > ZIP64_BYTES_THR
}

/// Zip writer for a forward-only sink.
///
/// `zip::ZipWriter` seeks back to patch entry sizes, so the archive is built
/// in an anonymous spool file and copied into the sink by
/// [`ZipSpool::finish`].
pub struct ZipSpool<W: Write> {
    zip: ZipWriter<File>,
    out: W,
}

impl<W: Write> ZipSpool<W> {
    pub fn new(out: W) -> ArchiveResult<Self> {
        Ok(Self {
            zip: ZipWriter::new(tempfile::tempfile()?),
            out,
        })
    }

    /// Spool inside `dir` instead of the system temp directory.
    pub fn new_in(out: W, dir: &Path) -> ArchiveResult<Self> {
        Ok(Self {
            zip: ZipWriter::new(tempfile::tempfile_in(dir)?),
            out,
        })
    }

    pub fn add_dir(&mut self, header: &EntryHeader) -> ArchiveResult<()> {
        self.zip
            .add_directory(header.name.as_str(), header.options(Method::Store, 0)?)?;
        Ok(())
    }

    /// Symlinks are stored with the link target as their contents.
    pub fn add_symlink(&mut self, header: &EntryHeader, target: &str) -> ArchiveResult<()> {
        self.zip
            .add_symlink(header.name.as_str(), target, header.options(Method::Store, 0)?)?;
        Ok(())
    }

    /// Compress `reader` into a new entry. `size` is the size reported by
    /// the file's metadata.
    pub fn add_file<R: Read>(
        &mut self,
        header: &EntryHeader,
        method: Method,
        size: u64,
        mut reader: R,
    ) -> ArchiveResult<()> {
        self.zip
            .start_file(header.name.as_str(), header.options(method, size)?)?;
        io::copy(&mut reader, &mut self.zip)?;
        Ok(())
    }

    /// Append every entry of `staged` as-is.
    pub fn merge<R: Read + Seek>(&mut self, staged: ZipArchive<R>) -> ArchiveResult<()> {
        self.zip.merge_archive(staged)?;
        Ok(())
    }

    /// Write the central directory and copy the archive into the sink.
    pub fn finish(self) -> ArchiveResult<W> {
        let Self { zip, mut out } = self;
        let mut spool = zip.finish()?;
        spool.seek(SeekFrom::Start(0))?;
        io::copy(&mut spool, &mut out)?;
        out.flush()?;
        Ok(out)
    }
}

/// MS-DOS time for `secs`, clamped to the representable range.
pub(crate) fn dos_datetime(secs: i64) -> ZipTime {
    let Some(dt) = DateTime::from_timestamp(secs, 0) else {
        return ZipTime::default();
    };
    let dt = dt.naive_utc();
    if dt.year() < 1980 {
        return ZipTime::default();
    }
    if dt.year() > 2107 {
        return ZipTime::from_date_and_time(2107, 12, 31, 23, 59, 58).unwrap_or_default();
    }
    ZipTime::from_date_and_time(
        dt.year() as u16,
        dt.month() as u8,
        dt.day() as u8,
        dt.hour() as u8,
        dt.minute() as u8,
        dt.second() as u8,
    )
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn header(name: &str, mode: u32) -> EntryHeader {
        EntryHeader {
            name: name.to_string(),
            mode,
            mtime: 1_700_000_000,
            owner: Some((1000, 1000)),
        }
    }

    fn le_u16(b: &[u8]) -> u16 {
        u16::from_le_bytes([b[0], b[1]])
    }

    #[test]
    fn test_dos_datetime() {
        // 2020-06-15 12:34:56 UTC
        let t = dos_datetime(1_592_224_496);
        assert_eq!((t.year(), t.month(), t.day()), (2020, 6, 15));
        assert_eq!((t.hour(), t.minute(), t.second()), (12, 34, 56));
        assert_eq!(dos_datetime(0), ZipTime::default());
        assert_eq!(dos_datetime(i64::from(i32::MAX) * 4).year(), 2107);
    }

    #[test]
    fn test_spool_layout() {
        let mut spool = ZipSpool::new(Vec::new()).unwrap();
        spool.add_dir(&header("dir/", S_IFDIR | 0o755)).unwrap();
        spool
            .add_file(&header("dir/a.txt", S_IFREG | 0o640), Method::Deflate(5), 5, &b"hello"[..])
            .unwrap();
        spool.add_symlink(&header("link", S_IFLNK | 0o777), "dir/a.txt").unwrap();
        let bytes = spool.finish().unwrap();

        assert_eq!(&bytes[..4], b"PK\x03\x04");
        let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 3);
        assert!(archive.by_index(0).unwrap().is_dir());

        let mut file = archive.by_name("dir/a.txt").unwrap();
        assert_eq!(file.unix_mode(), Some(S_IFREG | 0o640));
        let mut out = String::new();
        file.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello");
        drop(file);

        let link = archive.by_name("link").unwrap();
        assert!(link.is_symlink());
    }

    #[test]
    fn test_large_entry_reserves_zip64_in_local_header() {
        let mut spool = ZipSpool::new(Vec::new()).unwrap();
        spool
            .add_file(&header("big.bin", S_IFREG | 0o644), Method::Store, ZIP64_BYTES_THR, &b"data"[..])
            .unwrap();
        let bytes = spool.finish().unwrap();

        // sizes are patched in place, never written to a trailing descriptor
        let flags = le_u16(&bytes[6..]);
        assert_eq!(flags & 0x0008, 0);
        let name_len = le_u16(&bytes[26..]) as usize;
        let extra_len = le_u16(&bytes[28..]) as usize;
        assert!(extra_len >= 20);
        let extra = &bytes[30 + name_len..30 + name_len + extra_len];
        assert_eq!(le_u16(extra), 0x0001);

        let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut out = Vec::new();
        archive.by_index(0).unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, b"data");
    }

    #[test]
    fn test_large_file_threshold() {
        assert!(!is_large(0));
        assert!(!is_large(1 << 31));
        assert!(is_large(ZIP64_BYTES_THR));
        assert!(is_large(ZIP64_BYTES_THR - 1024));
    }
}
