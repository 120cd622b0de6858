//! Paired stdout/stderr maskers sharing one phrase store.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use crate::error::MaskError;
use crate::masker::Masker;
use crate::store::Store;

/// Masking proxy for a child process's two output streams.
pub struct Proxy<O: Write, E: Write> {
    store: Arc<Store>,
    stdout: Masker<O>,
    stderr: Masker<E>,
}

impl<O: Write, E: Write> Proxy<O, E> {
    /// Open the store in `dir` and wrap both writers.
    pub fn open(dir: &Path, stdout: O, stderr: E) -> Result<Self, MaskError> {
        let store = Arc::new(Store::open(dir)?);
        Ok(Self::with_store(store, stdout, stderr))
    }

    pub fn with_store(store: Arc<Store>, stdout: O, stderr: E) -> Self {
        Self {
            stdout: Masker::new(stdout, Arc::clone(&store)),
            stderr: Masker::new(stderr, Arc::clone(&store)),
            store,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn stdout(&mut self) -> &mut Masker<O> {
        &mut self.stdout
    }

    pub fn stderr(&mut self) -> &mut Masker<E> {
        &mut self.stderr
    }

    /// Both writers at once, for pumping them from separate threads.
    pub fn split(&mut self) -> (&mut Masker<O>, &mut Masker<E>) {
        (&mut self.stdout, &mut self.stderr)
    }

    /// Flush residual bytes of both writers, then close the store.
    ///
    /// Returns the first flush error; the store is closed regardless.
    pub fn close(mut self) -> Result<(O, E), MaskError> {
        let out = self.stdout.finish();
        let err = self.stderr.finish();
        self.store.close();
        out?;
        err?;
        Ok((self.stdout.into_inner(), self.stderr.into_inner()))
    }
}
