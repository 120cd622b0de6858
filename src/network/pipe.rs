//! In-process pipe between an archive producer and a request body
//!
//! The writer half runs on a producer thread; the reader half is handed to
//! the HTTP client. Chunks travel over a bounded channel, so a stalled
//! upload blocks the producer. A producer failure is delivered to the
//! reader as an `io::Error`, which fails the request body.

use std::io::{self, Read, Write};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::error::HelperResult;

/// Chunks buffered between producer and consumer.
pub const PIPE_CAPACITY: usize = 16;

type Chunk = io::Result<Vec<u8>>;

/// Write half of a [`pipe`]. Clones share the channel; the reader sees end
/// of stream once every clone is dropped.
#[derive(Clone)]
pub struct PipeWriter {
    tx: Sender<Chunk>,
}

/// Read half of a [`pipe`].
pub struct PipeReader {
    rx: Receiver<Chunk>,
    chunk: Vec<u8>,
    pos: usize,
    failed: Option<(io::ErrorKind, String)>,
}

/// Create a connected writer/reader pair.
pub fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = bounded(PIPE_CAPACITY);
    (
        PipeWriter { tx },
        PipeReader {
            rx,
            chunk: Vec::new(),
            pos: 0,
            failed: None,
        },
    )
}

impl PipeWriter {
    /// Close the pipe so that the reader fails with `err`.
    pub fn close_with_error(self, err: io::Error) {
        // the reader may already be gone
        let _ = self.tx.send(Err(err));
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .send(Ok(buf.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some((kind, msg)) = &self.failed {
            return Err(io::Error::new(*kind, msg.clone()));
        }
        while self.pos == self.chunk.len() {
            match self.rx.recv() {
                Ok(Ok(chunk)) => {
                    self.chunk = chunk;
                    self.pos = 0;
                }
                Ok(Err(err)) => {
                    self.failed = Some((err.kind(), err.to_string()));
                    return Err(err);
                }
                // writer dropped: clean end of stream
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.chunk.len() - self.pos);
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Run `produce` on a new thread writing into a pipe; return the read half
/// and the producer's handle.
///
/// When `produce` fails, the reader sees the error instead of a clean end of
/// stream, and the handle yields the original error.
pub fn spawn_producer<F>(produce: F) -> (PipeReader, JoinHandle<HelperResult<()>>)
where
    F: FnOnce(PipeWriter) -> HelperResult<()> + Send + 'static,
{
    let (writer, reader) = pipe();
    let handle = thread::spawn(move || match produce(writer.clone()) {
        Ok(()) => Ok(()),
        Err(err) => {
            writer.close_with_error(io::Error::new(io::ErrorKind::Other, err.to_string()));
            Err(err)
        }
    });
    (reader, handle)
}
