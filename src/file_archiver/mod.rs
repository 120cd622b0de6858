//! File selection for artifact and cache archives
//!
//! Resolves `--path` patterns (plain paths or globs with `**`) below the
//! working directory, drops candidates matching an `--exclude` rule, adds
//! `git ls-files -o` output with `--untracked`, and answers whether an
//! existing archive is stale.
//!
//! Selected paths are stored relative to the working directory with
//! forward slashes. Patterns that resolve outside the working directory are
//! skipped with a warning; a pattern that matches nothing is a warning too.

pub mod expand;
pub mod pattern;

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use globset::GlobMatcher;
use runner_archive::path::{absolute, is_within, resolve_root, to_slash};
use runner_archive::FileSet;
use walkdir::WalkDir;

use crate::error::HelperResult;

/// Path selection flags shared by the uploading commands.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct PathArgs {
    /// Add paths to archive
    #[arg(long = "path")]
    pub paths: Vec<String>,

    /// Exclude paths from the archive
    #[arg(long)]
    pub exclude: Vec<String>,

    /// Add git untracked files
    #[arg(long)]
    pub untracked: bool,

    /// Detailed information
    #[arg(long)]
    pub verbose: bool,
}

impl PathArgs {
    /// Copy with environment variables expanded in every `--path` and
    /// `--exclude` value. A value that fails to expand is kept verbatim.
    pub fn expanded(&self) -> Self {
        let expand = |values: &[String]| -> Vec<String> {
            values
                .iter()
                .map(|value| match expand::expand_env(value) {
                    Ok(path) => path,
                    Err(e) => {
                        tracing::warn!("invalid path {value:?}: {e}");
                        value.clone()
                    }
                })
                .collect()
        };
        Self {
            paths: expand(&self.paths),
            exclude: expand(&self.exclude),
            ..self.clone()
        }
    }
}

struct ExcludeRule {
    pattern: String,
    matcher: GlobMatcher,
}

/// Files selected for one command invocation.
pub struct FileArchiver {
    wd: PathBuf,
    files: FileSet,
    excluded: BTreeMap<String, u64>,
    rules: Vec<ExcludeRule>,
    verbose: bool,
}

impl FileArchiver {
    /// Resolve `args` below `wd`.
    pub fn enumerate(wd: &Path, args: &PathArgs) -> HelperResult<Self> {
        let wd = resolve_root(wd)?;
        let rules = compile_rules(&wd, &args.exclude);

        let mut archiver = Self {
            wd,
            files: FileSet::new(),
            excluded: BTreeMap::new(),
            rules,
            verbose: args.verbose,
        };

        for pattern in &args.paths {
            archiver.process_pattern(pattern);
        }
        if args.untracked {
            archiver.process_untracked();
        }

        for (rule, count) in &archiver.excluded {
            tracing::info!("{rule}: excluded {count} files");
        }
        Ok(archiver)
    }

    pub fn wd(&self) -> &Path {
        &self.wd
    }

    /// Selected files keyed by forward-slash path relative to `wd`.
    pub fn files(&self) -> &FileSet {
        &self.files
    }

    pub fn into_files(self) -> FileSet {
        self.files
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Per-rule exclusion counters.
    pub fn excluded(&self) -> &BTreeMap<String, u64> {
        &self.excluded
    }

    /// Selected pathnames in sorted order.
    pub fn sorted_files(&self) -> Vec<&str> {
        self.files.keys().map(String::as_str).collect()
    }

    /// True when the archive at `archive` must be rebuilt.
    ///
    /// A missing archive or any stat error other than not-found counts as
    /// changed; otherwise the archive is stale only when some selected file
    /// is strictly newer than it.
    pub fn is_file_changed(&self, archive: &Path) -> bool {
        let archive = absolute(archive, &self.wd);
        match fs::metadata(&archive).and_then(|md| md.modified()) {
            Ok(archived) => self
                .files
                .values()
                .filter_map(|md| md.modified().ok())
                .any(|mtime| mtime > archived),
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(e) => {
                tracing::warn!(path = %archive.display(), error = %e, "cannot stat archive");
                true
            }
        }
    }

    fn process_pattern(&mut self, raw: &str) {
        let (base, glob) = pattern::split_pattern(raw);
        let base = absolute(Path::new(if base.is_empty() { "." } else { &base }), &self.wd);
        if !is_within(&self.wd, &base) {
            tracing::warn!("{raw}: not supported: outside build directory");
            return;
        }

        let found = match glob {
            None => self.walk(&base, None),
            Some(glob) => match pattern::compile(&glob) {
                Ok(matcher) => self.walk(&base, Some((&matcher, pattern::fixed_depth(&glob)))),
                Err(e) => {
                    tracing::warn!("{raw}: {e}");
                    return;
                }
            },
        };

        if found == 0 {
            tracing::warn!("{raw}: no matching files");
        } else {
            tracing::info!("{raw}: found {found} matching files and directories");
        }
    }

    /// Walk `base`, submitting every entry (or, with a glob, every entry at
    /// or below a match) to [`process`](Self::process).
    fn walk(&mut self, base: &Path, glob: Option<(&GlobMatcher, Option<usize>)>) -> usize {
        let walker = WalkDir::new(base)
            .follow_links(false)
            .follow_root_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| match glob {
                Some((matcher, Some(depth))) if entry.depth() > depth => {
                    prefix_matches(matcher, base, entry.path(), depth)
                }
                _ => true,
            });

        let mut found = 0;
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let missing = e
                        .io_error()
                        .is_some_and(|io| io.kind() == io::ErrorKind::NotFound);
                    if !missing {
                        tracing::warn!("walking {}: {e}", base.display());
                    }
                    continue;
                }
            };

            if let Some((matcher, _)) = glob {
                let depth = entry.depth();
                let matched = (1..=depth).any(|d| prefix_matches(matcher, base, entry.path(), d));
                if !matched {
                    continue;
                }
            }
            if self.process(entry.path()) {
                found += 1;
            }
        }
        found
    }

    fn process_untracked(&mut self) {
        tracing::debug!("Executing command: git ls-files -o -z");
        let output = Command::new("git")
            .args(["ls-files", "-o", "-z"])
            .current_dir(&self.wd)
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .output();

        let output = match output {
            Ok(output) if output.status.success() => output,
            Ok(output) => {
                tracing::warn!("untracked: git ls-files exited with {}", output.status);
                return;
            }
            Err(e) => {
                tracing::warn!("untracked: {e}");
                return;
            }
        };

        let mut found = 0;
        for name in output.stdout.split(|&b| b == 0).filter(|n| !n.is_empty()) {
            let name = String::from_utf8_lossy(name);
            let path = absolute(Path::new(name.as_ref()), &self.wd);
            if self.process(&path) {
                found += 1;
            }
        }

        if found == 0 {
            tracing::warn!("untracked: no files");
        } else {
            tracing::info!("untracked: found {found} files");
        }
    }

    /// Add one absolute candidate. Returns whether it was selected.
    fn process(&mut self, path: &Path) -> bool {
        if !is_within(&self.wd, path) {
            tracing::warn!("{}: not supported: outside build directory", path.display());
            return false;
        }
        let relative = match path.strip_prefix(&self.wd) {
            Ok(rel) if !rel.as_os_str().is_empty() => to_slash(rel),
            _ => return false,
        };

        if let Some(rule) = self.rules.iter().find(|r| r.matcher.is_match(&relative)) {
            *self.excluded.entry(rule.pattern.clone()).or_default() += 1;
            return false;
        }

        match fs::symlink_metadata(path) {
            Ok(md) => {
                if self.verbose {
                    tracing::info!("{relative}");
                }
                self.files.insert(relative, md);
                true
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => {
                tracing::warn!("{relative}: {e}");
                false
            }
        }
    }
}

/// Does the first `depth` components of `path` below `base` match?
fn prefix_matches(matcher: &GlobMatcher, base: &Path, path: &Path, depth: usize) -> bool {
    let Ok(rel) = path.strip_prefix(base) else {
        return false;
    };
    let prefix: PathBuf = rel.components().take(depth).collect();
    matcher.is_match(to_slash(&prefix))
}

/// Compile exclude rules, making absolute patterns project-relative.
fn compile_rules(wd: &Path, patterns: &[String]) -> Vec<ExcludeRule> {
    let mut rules = Vec::new();
    for raw in patterns {
        let slashed = raw.replace('\\', "/");
        let wd_prefix = format!("{}/", to_slash_abs(wd));
        let relative = slashed
            .strip_prefix(&wd_prefix)
            .unwrap_or(&slashed)
            .trim_start_matches("./")
            .to_string();

        match pattern::compile(&relative) {
            Ok(matcher) => rules.push(ExcludeRule {
                pattern: raw.clone(),
                matcher,
            }),
            Err(e) => tracing::warn!("{raw}: invalid exclude pattern: {e}"),
        }
    }
    rules
}

fn to_slash_abs(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
