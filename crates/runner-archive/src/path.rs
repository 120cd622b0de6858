//! Path containment for archive entries.
//!
//! Both directions use lexical resolution: archivers map a pathname to an
//! entry name relative to the root, extractors map an entry name to a path
//! under the destination. Anything resolving outside is `PathTraversal`.

use std::io;
use std::path::{Component, Path, PathBuf};

use crate::error::{ArchiveError, ArchiveResult};

/// Lexically clean a path: drop `.` components and fold `..` into the parent.
///
/// A leading `..` on a relative path is kept so that escapes stay visible.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let can_pop = matches!(
                    out.components().next_back(),
                    Some(Component::Normal(_))
                );
                if can_pop {
                    out.pop();
                } else if !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Make `path` absolute against `base` and normalize it.
pub fn absolute(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        normalize(path)
    } else {
        normalize(&base.join(path))
    }
}

/// Absolute, normalized form of an archive root.
pub fn resolve_root(root: &Path) -> io::Result<PathBuf> {
    if root.is_absolute() {
        Ok(normalize(root))
    } else {
        Ok(absolute(root, &std::env::current_dir()?))
    }
}

/// True when `path` equals `root` or lies beneath it.
pub fn is_within(root: &Path, path: &Path) -> bool {
    path == root || path.starts_with(root)
}

/// Entry name for `pathname` inside an archive rooted at `root`.
///
/// `root` must already be absolute and normalized. The name uses forward
/// slashes; directories get a trailing `/` when `is_dir` is set.
pub fn entry_name(root: &Path, pathname: &str, is_dir: bool) -> ArchiveResult<String> {
    let resolved = absolute(Path::new(pathname), root);
    if !is_within(root, &resolved) {
        return Err(ArchiveError::PathTraversal {
            path: resolved,
            root: root.to_path_buf(),
        });
    }

    let relative = resolved.strip_prefix(root).unwrap_or(Path::new(""));
    let mut name = to_slash(relative);
    if name.is_empty() {
        name.push('.');
    }
    if is_dir && !name.ends_with('/') {
        name.push('/');
    }
    Ok(name)
}

/// Destination path for the entry `name` extracted under `dest`.
///
/// `dest` must already be absolute and normalized.
pub fn contained_path(dest: &Path, name: &str) -> ArchiveResult<PathBuf> {
    let trimmed = name.trim_end_matches('/');
    if trimmed.starts_with('/') || Path::new(trimmed).has_root() {
        return Err(ArchiveError::PathTraversal {
            path: PathBuf::from(trimmed),
            root: dest.to_path_buf(),
        });
    }
    let relative: PathBuf = trimmed.split('/').filter(|s| !s.is_empty()).collect();
    let joined = normalize(&dest.join(relative));
    if !is_within(dest, &joined) {
        return Err(ArchiveError::PathTraversal {
            path: joined,
            root: dest.to_path_buf(),
        });
    }
    Ok(joined)
}

/// Forward-slash rendering of a relative path.
pub fn to_slash(path: &Path) -> String {
    let parts: Vec<String> = path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    parts.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
        assert_eq!(normalize(Path::new("a/../../b")), PathBuf::from("../b"));
        assert_eq!(normalize(Path::new("/../x")), PathBuf::from("/x"));
    }

    #[test]
    fn test_entry_name() {
        let root = Path::new("/work/project");
        assert_eq!(entry_name(root, "src/main.rs", false).unwrap(), "src/main.rs");
        assert_eq!(entry_name(root, "src", true).unwrap(), "src/");
        assert_eq!(entry_name(root, "/work/project/a", false).unwrap(), "a");
        assert_eq!(entry_name(root, "./b/../c", false).unwrap(), "c");
    }

    #[test]
    fn test_entry_name_rejects_escape() {
        let root = Path::new("/work/project");
        assert!(matches!(
            entry_name(root, "../other", false),
            Err(ArchiveError::PathTraversal { .. })
        ));
        assert!(matches!(
            entry_name(root, "/work/project-sibling/x", false),
            Err(ArchiveError::PathTraversal { .. })
        ));
    }

    #[test]
    fn test_contained_path() {
        let dest = Path::new("/out");
        assert_eq!(contained_path(dest, "a/b.txt").unwrap(), PathBuf::from("/out/a/b.txt"));
        assert_eq!(contained_path(dest, "dir/").unwrap(), PathBuf::from("/out/dir"));
        assert!(contained_path(dest, "../evil").is_err());
        assert!(contained_path(dest, "a/../../evil").is_err());
        assert!(contained_path(dest, "/etc/passwd").is_err());
    }
}
