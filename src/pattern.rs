//! Glob pattern resolution over checked-out trees
//!
//! Patterns use shell glob syntax relative to the tree root: `*` and `?`
//! never cross a `/`, `**` spans any number of directories. Nested
//! repositories are ordinary directories to the resolver, so a pattern like
//! `*_subds0/*_subds1/*.txt` reaches two levels of sub-repositories down.

use crate::error::{RemakeError, RemakeResult};
use globset::{GlobBuilder, GlobMatcher, GlobSet, GlobSetBuilder};
use std::collections::BTreeSet;
use std::path::Path;
use walkdir::WalkDir;

/// Per-component view of one pattern, used to prune directory descent
#[derive(Debug, Clone)]
struct ComponentPattern {
    components: Vec<ComponentMatcher>,
}

#[derive(Debug, Clone)]
enum ComponentMatcher {
    /// `**`: anything below may match
    Recursive,
    Glob(GlobMatcher),
}

/// A compiled set of input or output patterns
#[derive(Debug, Clone)]
pub struct PatternSet {
    globs: GlobSet,
    prefixes: Vec<ComponentPattern>,
}

fn normalize(pattern: &str) -> &str {
    pattern.trim_start_matches("./").trim_end_matches('/')
}

fn compile(pattern: &str) -> RemakeResult<GlobMatcher> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map(|g| g.compile_matcher())
        .map_err(|e| RemakeError::Glob {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })
}

impl PatternSet {
    /// Compile patterns, rejecting invalid globs up front
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> RemakeResult<Self> {
        let mut builder = GlobSetBuilder::new();
        let mut prefixes = Vec::with_capacity(patterns.len());
        let mut kept = Vec::with_capacity(patterns.len());

        for pattern in patterns {
            let pattern = normalize(pattern.as_ref());
            if pattern.is_empty() {
                continue;
            }
            let glob = GlobBuilder::new(pattern)
                .literal_separator(true)
                .build()
                .map_err(|e| RemakeError::Glob {
                    pattern: pattern.to_string(),
                    reason: e.to_string(),
                })?;
            builder.add(glob);

            let components = pattern
                .split('/')
                .map(|c| {
                    if c == "**" {
                        Ok(ComponentMatcher::Recursive)
                    } else {
                        compile(c).map(ComponentMatcher::Glob)
                    }
                })
                .collect::<RemakeResult<Vec<_>>>()?;
            prefixes.push(ComponentPattern { components });
            kept.push(pattern.to_string());
        }

        let globs = builder.build().map_err(|e| RemakeError::Glob {
            pattern: kept.join(", "),
            reason: e.to_string(),
        })?;

        Ok(Self {
            globs,
            prefixes,
        })
    }

    /// Whether a tree-relative file path matches any pattern
    pub fn is_match(&self, relative: &str) -> bool {
        self.globs.is_match(relative)
    }

    /// Whether files below the tree-relative directory could match any pattern
    pub fn may_contain(&self, directory: &str) -> bool {
        let parts: Vec<&str> = directory.split('/').filter(|c| !c.is_empty()).collect();
        self.prefixes.iter().any(|prefix| {
            for (index, part) in parts.iter().enumerate() {
                match prefix.components.get(index) {
                    Some(ComponentMatcher::Recursive) => return true,
                    Some(ComponentMatcher::Glob(matcher)) => {
                        // The final component names files, not directories
                        if index + 1 >= prefix.components.len() || !matcher.is_match(part) {
                            return false;
                        }
                    }
                    None => return false,
                }
            }
            true
        })
    }
}

/// Tree-relative, `/`-separated form of `path`
pub fn relative_str(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

/// Resolve patterns to the set of matching files below `root`
///
/// Symlinks are reported as files and never followed; repository metadata
/// (`.git`) is skipped at every level. The result is ordered and independent
/// of pattern order.
pub fn resolve_patterns<S: AsRef<str>>(root: &Path, patterns: &[S]) -> RemakeResult<BTreeSet<String>> {
    let set = PatternSet::new(patterns)?;
    resolve_pattern_set(root, &set)
}

/// [`resolve_patterns`] for an already compiled set
pub fn resolve_pattern_set(root: &Path, set: &PatternSet) -> RemakeResult<BTreeSet<String>> {
    let mut matches = BTreeSet::new();
    if !root.is_dir() {
        return Ok(matches);
    }

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 {
                return true;
            }
            if entry.file_name() == ".git" {
                return false;
            }
            if entry.file_type().is_dir() {
                return relative_str(root, entry.path()).is_some_and(|r| set.may_contain(&r));
            }
            true
        });

    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e
                .path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| root.display().to_string());
            RemakeError::io(
                format!("walking {}", path),
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("filesystem loop")),
            )
        })?;
        if entry.file_type().is_dir() {
            continue;
        }
        if let Some(relative) = relative_str(root, entry.path()) {
            if set.is_match(&relative) {
                matches.insert(relative);
            }
        }
    }

    Ok(matches)
}
