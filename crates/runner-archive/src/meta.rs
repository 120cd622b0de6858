//! File metadata capture and deferred application during extraction.

use std::collections::BTreeMap;
use std::fs::{self, FileType, Metadata};
use std::io;
use std::path::{Path, PathBuf};

use filetime::FileTime;

/// Metadata restored for an extracted entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMeta {
    /// Permission bits (`0o7777`).
    pub mode: u32,
    pub mtime: FileTime,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl EntryMeta {
    pub fn new(mode: u32, mtime: FileTime) -> Self {
        Self {
            mode: mode & 0o7777,
            mtime,
            uid: None,
            gid: None,
        }
    }

    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.uid = Some(uid);
        self.gid = Some(gid);
        self
    }

    /// Apply times, mode and ownership to `path`.
    ///
    /// Mode is not applied to symlinks. Ownership is best-effort.
    pub fn apply(&self, path: &Path, is_symlink: bool) -> io::Result<()> {
        if !is_symlink {
            set_mode(path, self.mode)?;
        }
        filetime::set_symlink_file_times(path, self.mtime, self.mtime)?;
        if let (Some(uid), Some(gid)) = (self.uid, self.gid) {
            lchown(path, uid, gid);
        }
        Ok(())
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(mode & 0o200 == 0);
    fs::set_permissions(path, perms)
}

#[cfg(unix)]
fn lchown(path: &Path, uid: u32, gid: u32) {
    if let Err(e) = std::os::unix::fs::lchown(path, Some(uid), Some(gid)) {
        tracing::trace!(path = %path.display(), error = %e, "lchown failed");
    }
}

#[cfg(not(unix))]
fn lchown(_path: &Path, _uid: u32, _gid: u32) {}

/// Permission bits of `md`.
#[cfg(unix)]
pub fn mode_bits(md: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    md.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
pub fn mode_bits(md: &Metadata) -> u32 {
    let base = if md.is_dir() { 0o755 } else { 0o644 };
    if md.permissions().readonly() {
        base & !0o222
    } else {
        base
    }
}

/// Owner of `md`, where the platform has one.
#[cfg(unix)]
pub fn owner(md: &Metadata) -> Option<(u32, u32)> {
    use std::os::unix::fs::MetadataExt;
    Some((md.uid(), md.gid()))
}

#[cfg(not(unix))]
pub fn owner(_md: &Metadata) -> Option<(u32, u32)> {
    None
}

/// Sockets, devices and named pipes.
#[cfg(unix)]
pub fn is_irregular(ft: &FileType) -> bool {
    use std::os::unix::fs::FileTypeExt;
    ft.is_socket() || ft.is_block_device() || ft.is_char_device() || ft.is_fifo()
}

#[cfg(not(unix))]
pub fn is_irregular(_ft: &FileType) -> bool {
    false
}

/// Capture [`EntryMeta`] from `md`.
pub fn capture(md: &Metadata) -> EntryMeta {
    let meta = EntryMeta::new(mode_bits(md), FileTime::from_last_modification_time(md));
    match owner(md) {
        Some((uid, gid)) => meta.with_owner(uid, gid),
        None => meta,
    }
}

/// Create a symlink at `path`, removing whatever is there first.
pub fn replace_symlink(target: &Path, path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(md) if md.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    symlink(target, path)
}

#[cfg(unix)]
fn symlink(target: &Path, path: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, path)
}

#[cfg(windows)]
fn symlink(target: &Path, path: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(target, path)
}

#[derive(Debug)]
enum Pending {
    Dir(EntryMeta),
    Symlink { target: PathBuf, meta: EntryMeta },
}

/// Directories and symlinks whose metadata is applied after all files.
///
/// Restrictive directory modes (e.g. `0500`) would otherwise block writing
/// the children, so directories are finished last and deepest first.
#[derive(Debug, Default)]
pub struct Deferred {
    entries: BTreeMap<PathBuf, Pending>,
}

impl Deferred {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dir(&mut self, path: PathBuf, meta: EntryMeta) {
        self.entries.insert(path, Pending::Dir(meta));
    }

    pub fn symlink(&mut self, path: PathBuf, target: PathBuf, meta: EntryMeta) {
        self.entries.insert(path, Pending::Symlink { target, meta });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Materialize symlinks, then apply directory metadata.
    pub fn finish(self) -> io::Result<()> {
        let mut dirs = Vec::new();
        for (path, pending) in self.entries {
            match pending {
                Pending::Symlink { target, meta } => {
                    replace_symlink(&target, &path)?;
                    meta.apply(&path, true)?;
                }
                Pending::Dir(meta) => dirs.push((path, meta)),
            }
        }

        for (path, meta) in dirs.into_iter().rev() {
            fs::create_dir_all(&path)?;
            meta.apply(&path, false)?;
        }
        Ok(())
    }
}
