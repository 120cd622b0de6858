//! Gzip stream-concat format.
//!
//! Each regular file becomes one independent gzip member carrying the file's
//! basename in the header name field and its project-relative path in the
//! comment field. Members are concatenated into the sink in pathname order.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use filetime::FileTime;
use flate2::bufread::GzDecoder;
use flate2::{Compression, GzBuilder};

use crate::cancel::CancelToken;
use crate::codec::{Archiver, Extractor, FileSet, Sink, Source};
use crate::error::{ArchiveError, ArchiveResult};
use crate::format::CompressionLevel;
use crate::path;
use crate::reader::SectionReader;

const COMMENT_ENCODED_PREFIX: &str = "e:";
const READ_BUFFER_SIZE: usize = 32 * 1024;

/// Writes one gzip member per regular file.
pub struct GzipArchiver {
    sink: Sink,
    root: PathBuf,
    level: Compression,
}

impl GzipArchiver {
    pub fn new(sink: Sink, root: &Path, level: CompressionLevel) -> ArchiveResult<Self> {
        Ok(Self {
            sink,
            root: path::resolve_root(root)?,
            level: Compression::new(level.gzip_level()),
        })
    }

    fn add_file(&mut self, name: &str, full: &Path) -> ArchiveResult<()> {
        let md = match fs::symlink_metadata(full) {
            Ok(md) => md,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::warn!(path = %name, "file does not exist, skipping");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if !md.file_type().is_file() {
            tracing::warn!(path = %name, "not a regular file");
            return Err(ArchiveError::NotRegularFile(PathBuf::from(name)));
        }

        let basename = full
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mtime = FileTime::from_last_modification_time(&md).unix_seconds();

        let mut file = File::open(full)?;
        let mut encoder = GzBuilder::new()
            .filename(basename)
            .comment(encode_comment(name))
            .mtime(u32::try_from(mtime).unwrap_or(0))
            .write(&mut self.sink, self.level);
        io::copy(&mut file, &mut encoder)?;
        encoder.finish()?;
        Ok(())
    }
}

impl Archiver for GzipArchiver {
    fn archive(mut self: Box<Self>, files: &FileSet, cancel: &CancelToken) -> ArchiveResult<()> {
        for name in files.keys() {
            cancel.check()?;
            path::entry_name(&self.root, name, false)?;
            let full = path::absolute(Path::new(name), &self.root);
            self.add_file(name, &full)?;
        }
        self.sink.flush()?;
        Ok(())
    }
}

/// Header comment for `name`: the path itself when it is printable ASCII
/// without `%`, otherwise `e:` followed by its percent-encoding.
pub fn encode_comment(name: &str) -> String {
    let plain = name.bytes().all(|b| (0x20..0x7f).contains(&b) && b != b'%');
    if plain {
        return name.to_string();
    }

    let mut out = String::with_capacity(COMMENT_ENCODED_PREFIX.len() + name.len() * 3);
    out.push_str(COMMENT_ENCODED_PREFIX);
    for b in name.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~' | b'/') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

/// Inverse of [`encode_comment`]. Returns `None` on a malformed escape.
pub fn decode_comment(comment: &str) -> Option<String> {
    let Some(encoded) = comment.strip_prefix(COMMENT_ENCODED_PREFIX) else {
        return Some(comment.to_string());
    };

    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// Reads gzip members one at a time and writes each under its header name.
pub struct GzipExtractor {
    reader: BufReader<SectionReader>,
    dest: PathBuf,
}

impl GzipExtractor {
    pub fn new(source: Source, size: u64, dest: &Path) -> ArchiveResult<Self> {
        Ok(Self {
            reader: BufReader::new(SectionReader::new(source, 0, size)),
            dest: path::resolve_root(dest)?,
        })
    }

    fn extract_member(&mut self) -> ArchiveResult<()> {
        let mut decoder = GzDecoder::new(&mut self.reader);
        let mut chunk = vec![0u8; READ_BUFFER_SIZE];
        let first = decoder.read(&mut chunk)?;

        let header = decoder
            .header()
            .ok_or_else(|| ArchiveError::malformed("gzip member without header"))?;
        let name = header
            .filename()
            .map(|n| String::from_utf8_lossy(n).into_owned())
            .ok_or_else(|| ArchiveError::malformed("gzip member without file name"))?;
        let mtime = header.mtime();

        let basename = Path::new(&name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| ArchiveError::malformed(format!("invalid gzip file name {:?}", name)))?;
        let target = path::contained_path(&self.dest, &basename)?;

        let mut file = File::create(&target)?;
        file.write_all(&chunk[..first])?;
        io::copy(&mut decoder, &mut file)?;
        file.sync_all()?;
        drop(file);

        if mtime != 0 {
            let time = FileTime::from_unix_time(i64::from(mtime), 0);
            filetime::set_file_times(&target, time, time)?;
        }
        tracing::debug!(path = %target.display(), "extracted gzip member");
        Ok(())
    }
}

impl Extractor for GzipExtractor {
    fn extract(mut self: Box<Self>, cancel: &CancelToken) -> ArchiveResult<()> {
        fs::create_dir_all(&self.dest)?;
        while !self.reader.fill_buf()?.is_empty() {
            cancel.check()?;
            self.extract_member()?;
        }
        Ok(())
    }
}
