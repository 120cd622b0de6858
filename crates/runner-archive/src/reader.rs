//! Random-access input for extractors.
//!
//! Extractors receive an `Arc<dyn ReaderAt>` plus a known size. Zip parses
//! the central directory once and hands each worker a clone of the archive
//! over its own [`SectionReader`], so positional reads must not share a cursor.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

/// Positional read without a shared cursor.
pub trait ReaderAt: Send + Sync {
    /// Read up to `buf.len()` bytes starting at `offset`. Returns 0 at EOF.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Fill `buf` completely or fail with `UnexpectedEof`.
    fn read_exact_at(&self, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
        while !buf.is_empty() {
            match self.read_at(buf, offset) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "failed to fill whole buffer",
                    ))
                }
                Ok(n) => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl ReaderAt for File {
    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(self, buf, offset)
    }

    #[cfg(windows)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_read(self, buf, offset)
    }
}

impl ReaderAt for Vec<u8> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let start = match usize::try_from(offset) {
            Ok(start) if start < self.len() => start,
            _ => return Ok(0),
        };
        let n = buf.len().min(self.len() - start);
        buf[..n].copy_from_slice(&self[start..start + n]);
        Ok(n)
    }
}

impl<T: ReaderAt + ?Sized> ReaderAt for Arc<T> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        (**self).read_at(buf, offset)
    }
}

/// `Read + Seek` view over the byte range `[start, end)` of a [`ReaderAt`].
///
/// Clones share the underlying input but keep their own position.
#[derive(Clone)]
pub struct SectionReader {
    inner: Arc<dyn ReaderAt>,
    start: u64,
    end: u64,
    pos: u64,
}

impl SectionReader {
    pub fn new(inner: Arc<dyn ReaderAt>, start: u64, len: u64) -> Self {
        Self {
            inner,
            start,
            end: start.saturating_add(len),
            pos: start,
        }
    }

    /// Length of the section.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

impl Read for SectionReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.end {
            return Ok(0);
        }
        let max = (self.end - self.pos).min(buf.len() as u64) as usize;
        let n = self.inner.read_at(&mut buf[..max], self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for SectionReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => self.start.checked_add(n),
            SeekFrom::End(n) => add_signed(self.end, n),
            SeekFrom::Current(n) => add_signed(self.pos, n),
        };
        match target {
            Some(t) if t >= self.start => {
                self.pos = t;
                Ok(t - self.start)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative offset",
            )),
        }
    }
}

fn add_signed(base: u64, delta: i64) -> Option<u64> {
    if delta >= 0 {
        base.checked_add(delta as u64)
    } else {
        base.checked_sub(delta.unsigned_abs())
    }
}
