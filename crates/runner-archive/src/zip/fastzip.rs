use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use ::zip::{ZipArchive, ZipWriter};
use crossbeam_channel::{unbounded, Receiver, Sender};

use super::archiver::{prepare_entry, write_entry, PreparedEntry};
use super::*;
use crate::cancel::CancelToken;
use crate::codec::FileSet;
use crate::error::ArchiveError;
use crate::path;

/// Parallel zip archiver.
///
/// Regular files are deflated by `concurrency` workers, each into its own
/// single-entry archive under a per-invocation staging directory. The staged
/// archives are merged into the sink in pathname order. With `Store` no
/// workers are started.
pub struct FastZipArchiver {
    sink: Sink,
    root: PathBuf,
    method: Method,
    concurrency: usize,
    buffer_size: usize,
    staging_root: Option<PathBuf>,
}

struct Job {
    index: usize,
    header: EntryHeader,
    path: PathBuf,
    size: u64,
}

type JobResult = (usize, ArchiveResult<tempfile::TempPath>);

impl FastZipArchiver {
    pub fn new(sink: Sink, root: &Path, level: CompressionLevel, opts: &CodecOptions) -> ArchiveResult<Self> {
        Ok(Self {
            sink,
            root: path::resolve_root(root)?,
            method: Method::for_level(level),
            concurrency: opts.archiver_concurrency.max(1),
            buffer_size: opts.archiver_buffer_size.max(1),
            staging_root: opts.staging_dir.clone(),
        })
    }

    fn staging_dir(&self) -> io::Result<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("fastzip");
        match &self.staging_root {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                builder.tempdir_in(dir)
            }
            None => builder.tempdir(),
        }
    }
}

impl Archiver for FastZipArchiver {
    fn archive(self: Box<Self>, files: &FileSet, cancel: &CancelToken) -> ArchiveResult<()> {
        let mut entries = Vec::with_capacity(files.len());
        for name in files.keys() {
            if let Some(entry) = prepare_entry(&self.root, name)? {
                entries.push(entry);
            }
        }

        if self.method == Method::Store {
            let mut spool = ZipSpool::new(self.sink)?;
            for entry in &entries {
                cancel.check()?;
                write_entry(&mut spool, entry, Method::Store)?;
            }
            spool.finish()?;
            return Ok(());
        }

        let staging = self.staging_dir()?;
        tracing::debug!(
            staging = %staging.path().display(),
            workers = self.concurrency,
            "starting fastzip workers"
        );

        let (job_tx, job_rx) = unbounded::<Job>();
        for (index, entry) in entries.iter().enumerate() {
            if entry.md.file_type().is_file() {
                let job = Job {
                    index,
                    header: entry.header.clone(),
                    path: entry.full.clone(),
                    size: entry.md.len(),
                };
                // job_rx is still held, so send cannot fail
                let _ = job_tx.send(job);
            }
        }
        drop(job_tx);

        let abort = AtomicBool::new(false);
        let (result_tx, result_rx) = unbounded::<JobResult>();
        let staging_path = staging.path();
        let method = self.method;
        let buffer_size = self.buffer_size;
        let sink = self.sink;

        let outcome = thread::scope(|scope| {
            for _ in 0..self.concurrency {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                let abort = &abort;
                scope.spawn(move || worker(job_rx, result_tx, abort, staging_path, method, buffer_size));
            }
            drop(result_tx);

            let outcome = ZipSpool::new_in(sink, staging_path)
                .and_then(|spool| assemble(spool, entries, result_rx, cancel));
            if outcome.is_err() {
                abort.store(true, Ordering::SeqCst);
            }
            outcome
        });

        if let Err(e) = staging.close() {
            tracing::warn!(error = %e, "failed to remove staging directory");
        }
        outcome
    }
}

fn worker(
    jobs: Receiver<Job>,
    results: Sender<JobResult>,
    abort: &AtomicBool,
    staging: &Path,
    method: Method,
    buffer_size: usize,
) {
    for job in jobs.iter() {
        if abort.load(Ordering::SeqCst) {
            break;
        }
        let result = compress(&job, staging, method, buffer_size);
        if results.send((job.index, result)).is_err() {
            break;
        }
    }
}

/// Deflate one file into a single-entry archive in `staging`.
fn compress(job: &Job, staging: &Path, method: Method, buffer_size: usize) -> ArchiveResult<tempfile::TempPath> {
    let source = File::open(&job.path)?;
    let mut reader = BufReader::with_capacity(buffer_size, source);
    let staged = tempfile::NamedTempFile::new_in(staging)?;

    let mut writer = ZipWriter::new(BufWriter::with_capacity(buffer_size, staged.as_file()));
    writer.start_file(job.header.name.as_str(), job.header.options(method, job.size)?)?;
    io::copy(&mut reader, &mut writer)?;
    let out = writer.finish()?;
    out.into_inner().map_err(|e| e.into_error())?;

    // reopened by the assembler; drop the handle so large archives do not
    // hold one descriptor per finished file
    Ok(staged.into_temp_path())
}

/// Write entries in order, waiting for each file's worker result.
fn assemble(
    mut spool: ZipSpool<Sink>,
    entries: Vec<PreparedEntry>,
    results: Receiver<JobResult>,
    cancel: &CancelToken,
) -> ArchiveResult<()> {
    let mut ready: BTreeMap<usize, tempfile::TempPath> = BTreeMap::new();

    for (index, entry) in entries.into_iter().enumerate() {
        cancel.check()?;
        if !entry.md.file_type().is_file() {
            write_entry(&mut spool, &entry, Method::Store)?;
            continue;
        }

        let staged = loop {
            if let Some(done) = ready.remove(&index) {
                break done;
            }
            let (i, result) = results
                .recv()
                .map_err(|_| ArchiveError::malformed("fastzip workers exited early"))?;
            ready.insert(i, result?);
        };
        spool.merge(ZipArchive::new(BufReader::new(File::open(&staged)?))?)?;
    }

    spool.finish()?;
    Ok(())
}
