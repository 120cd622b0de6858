//! `read-logs`: follow a job log file and print it with byte offsets.
//!
//! Every emitted line is `<offset> <content>\n` where `<offset>` is the file
//! position just past the line, so a consumer that reconnects can resume
//! with `--offset`. Lines longer than the read buffer are split into
//! buffer-sized pieces. Following stops with an error once the file is
//! removed.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use super::Context;
use crate::error::{HelperError, HelperResult};
use crate::retry::parse_duration;

/// Default read buffer, and so the longest emitted piece.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Pause between existence checks and after reaching end of file.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, clap::Args)]
pub struct ReadLogs {
    /// Log file to follow
    #[arg(long)]
    pub path: PathBuf,

    /// Byte offset to start reading from
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub offset: i64,

    /// How long to wait for the file to appear
    #[arg(long = "wait-file-timeout", default_value = "1m", value_parser = parse_duration)]
    pub wait_file_timeout: Duration,
}

impl ReadLogs {
    pub fn execute(&self, _ctx: &Context) -> HelperResult<()> {
        let reader = self.reader()?;
        let stdout = io::stdout();
        let mut out = stdout.lock();
        reader.follow(&mut out)
    }

    pub fn reader(&self) -> HelperResult<LogReader> {
        let offset = u64::try_from(self.offset)
            .map_err(|_| HelperError::InvalidInput(format!("negative offset {}", self.offset)))?;
        Ok(LogReader {
            path: self.path.clone(),
            offset,
            wait_file_timeout: self.wait_file_timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
            buf_size: DEFAULT_BUFFER_SIZE,
        })
    }
}

/// Tails one log file.
#[derive(Debug, Clone)]
pub struct LogReader {
    pub path: PathBuf,
    pub offset: u64,
    pub wait_file_timeout: Duration,
    pub poll_interval: Duration,
    pub buf_size: usize,
}

impl LogReader {
    /// Wait for the file to exist, checking once per poll interval.
    pub fn open(&self) -> HelperResult<File> {
        let attempts = wait_attempts(self.wait_file_timeout, self.poll_interval);
        if attempts == 0 {
            return Err(HelperError::InvalidInput("no attempts to open file".into()));
        }

        for attempt in 0..attempts {
            match File::open(&self.path) {
                Ok(file) => return Ok(file),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    tracing::debug!(attempt, path = %self.path.display(), "log file not there yet");
                }
                Err(e) => return Err(e.into()),
            }
            thread::sleep(self.poll_interval);
        }
        Err(HelperError::Failed(format!(
            "timeout waiting for file {}",
            self.path.display()
        )))
    }

    /// Emit lines into `out` until the file disappears.
    pub fn follow<W: Write>(&self, out: &mut W) -> HelperResult<()> {
        let mut file = self.open()?;
        file.seek(SeekFrom::Start(self.offset))?;

        let buf_size = self.buf_size.max(1);
        let mut reader = BufReader::with_capacity(buf_size, file);
        let mut line: Vec<u8> = Vec::with_capacity(buf_size);
        let mut offset = self.offset;

        loop {
            let available = reader.fill_buf()?;
            if available.is_empty() {
                if !line.is_empty() {
                    emit(out, offset, &line)?;
                    line.clear();
                }
                ensure_exists(&self.path)?;
                thread::sleep(self.poll_interval);
                continue;
            }

            let room = buf_size - line.len();
            let window = &available[..available.len().min(room)];
            let take = match window.iter().position(|&b| b == b'\n') {
                Some(i) => i + 1,
                None => window.len(),
            };
            line.extend_from_slice(&window[..take]);
            reader.consume(take);
            offset += take as u64;

            if line.last() == Some(&b'\n') || line.len() == buf_size {
                emit(out, offset, &line)?;
                line.clear();
            }
        }
    }
}

fn wait_attempts(timeout: Duration, interval: Duration) -> u128 {
    if interval.is_zero() {
        return 0;
    }
    timeout.as_nanos() / interval.as_nanos()
}

fn emit<W: Write>(out: &mut W, offset: u64, line: &[u8]) -> io::Result<()> {
    let content = line.strip_suffix(b"\n").unwrap_or(line);
    write!(out, "{offset} ")?;
    out.write_all(content)?;
    out.write_all(b"\n")?;
    out.flush()
}

fn ensure_exists(path: &Path) -> io::Result<()> {
    std::fs::metadata(path).map(|_| ())
}
