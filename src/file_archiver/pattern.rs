//! Glob pattern splitting and compilation
//!
//! A pattern such as `build/**/*.log` is split into a literal base
//! (`build`) that can be resolved and containment-checked like a plain
//! path, and a glob suffix (`**/*.log`) matched against paths below it.

use globset::{GlobBuilder, GlobMatcher};

/// Characters that make a path component a glob.
pub const GLOB_META: &[char] = &['*', '?', '[', '{'];

pub fn has_meta(s: &str) -> bool {
    s.contains(GLOB_META)
}

/// Split `pattern` into its literal base and optional glob suffix.
///
/// Both halves use forward slashes. An absolute pattern keeps its leading
/// `/` on the base.
pub fn split_pattern(pattern: &str) -> (String, Option<String>) {
    let normalized = pattern.replace('\\', "/");
    let absolute = normalized.starts_with('/');
    let parts: Vec<&str> = normalized.split('/').filter(|p| !p.is_empty()).collect();

    let first_glob = parts.iter().position(|p| has_meta(p));
    let (base, suffix) = match first_glob {
        Some(i) => (&parts[..i], Some(parts[i..].join("/"))),
        None => (&parts[..], None),
    };

    let mut base = base.join("/");
    if absolute {
        base.insert(0, '/');
    }
    (base, suffix)
}

/// Compile a glob where `*` stays within one component and `**` spans any
/// number of components.
pub fn compile(glob: &str) -> Result<GlobMatcher, globset::Error> {
    Ok(GlobBuilder::new(glob)
        .literal_separator(true)
        .build()?
        .compile_matcher())
}

/// Number of components a glob without `**` can match.
pub fn fixed_depth(glob: &str) -> Option<usize> {
    if glob.contains("**") {
        None
    } else {
        Some(glob.split('/').filter(|p| !p.is_empty()).count())
    }
}
