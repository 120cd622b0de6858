//! Append-only encrypted phrase store.
//!
//! Layout of `masking.db`:
//!
//! ```text
//! [32 bytes header key half]
//! base64(nonce || ciphertext || tag)\n
//! base64(nonce || ciphertext || tag)\n
//! ...
//! ```
//!
//! The second key half lives in a sidecar file `runner<hex(sha256(path))>`
//! next to the store. The AEAD key is the XOR of both halves, so deleting
//! either file makes the records unreadable.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{ListError, StoreError};

/// Store file name inside the store directory.
pub const STORE_FILE: &str = "masking.db";
/// Size of each key half and of the derived key.
pub const KEY_SIZE: usize = 32;
/// XChaCha20 nonce size.
pub const NONCE_SIZE: usize = 24;

/// Encrypted, append-only phrase store.
///
/// `add` calls are serialized; `list` reads independently and only sees
/// complete lines.
pub struct Store {
    path: PathBuf,
    file: RwLock<Option<Arc<File>>>,
    cipher: XChaCha20Poly1305,
    write_lock: Mutex<()>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Sidecar key file path for the store in `dir`.
pub fn key_path(dir: &Path) -> PathBuf {
    let store = dir.join(STORE_FILE);
    let digest = Sha256::digest(store.to_string_lossy().as_bytes());
    dir.join(format!("runner{}", hex::encode(digest)))
}

impl Store {
    /// Open or create the store in `dir`, creating `dir` if needed.
    ///
    /// A missing store gets a fresh sidecar key before the file is created;
    /// an empty store gets a fresh header.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(STORE_FILE);
        let key_file = key_path(dir);

        let exists = match fs::symlink_metadata(&path) {
            Ok(_) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        if !exists {
            let mut half = Zeroizing::new([0u8; KEY_SIZE]);
            OsRng.fill_bytes(&mut half[..]);
            write_key_file(&key_file, &half[..])?;
            tracing::debug!(path = %path.display(), "created new store key");
        }

        let file = open_store_file(&path)?;
        let mut len = file.metadata()?.len();
        if len == 0 {
            let mut header = Zeroizing::new([0u8; KEY_SIZE]);
            OsRng.fill_bytes(&mut header[..]);
            (&file).write_all(&header[..])?;
            file.sync_all()?;
            len = KEY_SIZE as u64;
        }
        if len < KEY_SIZE as u64 {
            return Err(StoreError::ShortHeader { expected: KEY_SIZE });
        }

        let mut header = Zeroizing::new([0u8; KEY_SIZE]);
        read_exact_at(&file, &mut header[..], 0)?;
        let sidecar = Zeroizing::new(fs::read(&key_file)?);
        if sidecar.len() < KEY_SIZE {
            return Err(StoreError::ShortKey {
                path: key_file,
                expected: KEY_SIZE,
            });
        }

        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        for (k, (h, s)) in key.iter_mut().zip(header.iter().zip(sidecar.iter())) {
            *k = h ^ s;
        }
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key[..]));

        Ok(Self {
            path,
            file: RwLock::new(Some(Arc::new(file))),
            cipher,
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn handle(&self) -> Result<Arc<File>, StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        let guard = self.file.read().unwrap_or_else(|p| p.into_inner());
        guard.clone().ok_or(StoreError::Closed)
    }

    /// Append an encrypted record for `phrase` and fsync.
    pub fn add(&self, phrase: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let file = self.handle()?;

        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        let sealed = self
            .cipher
            .encrypt(XNonce::from_slice(&nonce), phrase.as_bytes())
            .map_err(|_| StoreError::Encrypt)?;

        let mut record = Vec::with_capacity(NONCE_SIZE + sealed.len());
        record.extend_from_slice(&nonce);
        record.extend_from_slice(&sealed);
        let mut line = STANDARD.encode(&record).into_bytes();
        line.push(b'\n');

        (&*file).write_all(&line)?;
        file.sync_all()?;
        Ok(())
    }

    /// Decrypt every complete record in append order.
    ///
    /// On a malformed record the error carries the phrases decoded so far.
    pub fn list(&self) -> Result<Vec<String>, ListError> {
        let file = self.handle()?;
        let len = file.metadata()?.len();
        if len <= KEY_SIZE as u64 {
            return Ok(Vec::new());
        }

        let mut body = vec![0u8; (len - KEY_SIZE as u64) as usize];
        read_exact_at(&file, &mut body, KEY_SIZE as u64)?;

        let mut phrases = Vec::new();
        let complete = body.iter().rposition(|&b| b == b'\n').map_or(0, |i| i + 1);
        for (index, line) in body[..complete].split(|&b| b == b'\n').enumerate() {
            if line.is_empty() {
                continue;
            }
            match self.open_record(line) {
                Ok(phrase) => phrases.push(phrase),
                Err(reason) => {
                    return Err(ListError {
                        phrases,
                        source: StoreError::Corrupt {
                            line: index + 1,
                            reason,
                        },
                    })
                }
            }
        }
        Ok(phrases)
    }

    fn open_record(&self, line: &[u8]) -> Result<String, String> {
        let record = STANDARD.decode(line).map_err(|e| e.to_string())?;
        if record.len() < NONCE_SIZE {
            return Err("record shorter than nonce".to_string());
        }
        let (nonce, sealed) = record.split_at(NONCE_SIZE);
        let plain = self
            .cipher
            .decrypt(XNonce::from_slice(nonce), sealed)
            .map_err(|_| "authentication failed".to_string())?;
        String::from_utf8(plain).map_err(|e| e.to_string())
    }

    /// Current size of the store file, used to notice new records.
    pub fn size(&self) -> Result<u64, StoreError> {
        Ok(self.handle()?.metadata()?.len())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the store. Further `add` and `list` calls fail with `Closed`.
    pub fn close(&self) {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut slot = self.file.write().unwrap_or_else(|p| p.into_inner());
        slot.take();
    }
}

fn write_key_file(path: &Path, key: &[u8]) -> io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(key)?;
    file.sync_all()
}

fn open_store_file(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.read(true).append(true).create(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    #[cfg(windows)]
    {
        use std::os::windows::fs::OpenOptionsExt;
        // FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE
        options.share_mode(0x1 | 0x2 | 0x4);
    }
    options.open(path)
}

fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    while !buf.is_empty() {
        #[cfg(unix)]
        let n = std::os::unix::fs::FileExt::read_at(file, buf, offset)?;
        #[cfg(windows)]
        let n = std::os::windows::fs::FileExt::seek_read(file, buf, offset)?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "store truncated"));
        }
        buf = &mut buf[n..];
        offset += n as u64;
    }
    Ok(())
}
