//! Streaming longest-match phrase masker.

use std::io::{self, Write};
use std::sync::Arc;

use crate::error::MaskError;
use crate::store::Store;

/// Replacement written in place of a masked phrase.
pub const MASK: &[u8] = b"[MASKED]";

/// Writer that replaces registered phrases before forwarding bytes.
///
/// Phrases are reloaded from the store whenever its size changes, so
/// phrases added while output is flowing apply to later bytes. Up to
/// `longest phrase - 1` bytes are held back while they could still start a
/// phrase; [`Masker::finish`] flushes them.
pub struct Masker<W: Write> {
    inner: W,
    store: Option<Arc<Store>>,
    store_size: Option<u64>,
    phrases: Vec<Vec<u8>>,
    pending: Vec<u8>,
}

impl<W: Write> Masker<W> {
    /// Masker backed by `store`.
    pub fn new(inner: W, store: Arc<Store>) -> Self {
        Self {
            inner,
            store: Some(store),
            store_size: None,
            phrases: Vec::new(),
            pending: Vec::new(),
        }
    }

    /// Masker with a fixed phrase set.
    pub fn with_phrases<I, P>(inner: W, phrases: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Vec<u8>>,
    {
        let mut masker = Self {
            inner,
            store: None,
            store_size: None,
            phrases: Vec::new(),
            pending: Vec::new(),
        };
        masker.set_phrases(phrases.into_iter().map(Into::into).collect());
        masker
    }

    fn set_phrases(&mut self, mut phrases: Vec<Vec<u8>>) {
        phrases.retain(|p| !p.is_empty());
        phrases.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        phrases.dedup();
        self.phrases = phrases;
    }

    fn refresh(&mut self) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let size = match store.size() {
            Ok(size) => size,
            Err(e) => {
                tracing::debug!(error = %e, "phrase store unavailable, keeping current phrases");
                return;
            }
        };
        if self.store_size == Some(size) {
            return;
        }

        let phrases = match store.list() {
            Ok(phrases) => phrases,
            Err(e) => {
                tracing::warn!(error = %e, recovered = e.phrases.len(), "failed to read phrase store");
                e.phrases
            }
        };
        self.store_size = Some(size);
        self.set_phrases(phrases.into_iter().map(String::into_bytes).collect());
    }

    /// Bytes currently held back.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Emit everything in `pending` that can no longer become part of a
    /// longer match. With `eof` nothing is held back.
    fn drain(&mut self, eof: bool) -> io::Result<()> {
        let mut out = Vec::with_capacity(self.pending.len());
        let mut i = 0;
        while i < self.pending.len() {
            let rest = &self.pending[i..];
            let may_grow = !eof
                && self
                    .phrases
                    .iter()
                    .any(|p| p.len() > rest.len() && p.starts_with(rest));
            if may_grow {
                break;
            }
            // phrases are sorted longest first
            match self.phrases.iter().find(|p| rest.starts_with(p)) {
                Some(phrase) => {
                    out.extend_from_slice(MASK);
                    i += phrase.len();
                }
                None => {
                    out.push(rest[0]);
                    i += 1;
                }
            }
        }
        self.pending.drain(..i);
        if !out.is_empty() {
            self.inner.write_all(&out)?;
        }
        Ok(())
    }

    /// Flush held-back bytes and the inner writer.
    pub fn finish(&mut self) -> Result<(), MaskError> {
        self.drain(true).map_err(MaskError::Residual)?;
        self.inner.flush().map_err(MaskError::Residual)
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for Masker<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.refresh();
        self.pending.extend_from_slice(buf);
        self.drain(false)?;
        Ok(buf.len())
    }

    /// Flushes the inner writer. Held-back bytes stay pending.
    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
