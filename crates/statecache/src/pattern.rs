//! Glob matching over project-relative paths.
//!
//! `?` matches a single non-separator character, `*` matches any run of
//! non-separator characters, `**` matches any run of whole path segments
//! (including none). Patterns are always matched against POSIX-style
//! (forward-slash) relative paths; absolute inputs have their root prefix
//! stripped before matching.

use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};

use crate::error::{CacheError, CacheResult};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone)]
pub struct FilePattern {
    raw: String,
    compiled: Pattern,
}

impl FilePattern {
    pub fn new(raw: impl Into<String>) -> CacheResult<Self> {
        let raw = raw.into();
        let compiled = Pattern::new(&raw)
            .map_err(|e| CacheError::Config(format!("invalid glob pattern {raw:?}: {e}")))?;
        Ok(FilePattern { raw, compiled })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, relative_path: &str) -> bool {
        self.compiled.matches_with(relative_path, MATCH_OPTIONS)
    }
}

impl PartialEq for FilePattern {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for FilePattern {}

/// Normalizes a path (relative or absolute) to a root-relative, forward-slash
/// string suitable for [`FilePattern::matches`].
pub fn relativize(root: &Path, candidate: &Path) -> PathBuf {
    let stripped = candidate.strip_prefix(root).unwrap_or(candidate);
    stripped.to_path_buf()
}

pub fn to_posix_string(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// `(includes, excludes)` conjunction. `includes` empty means "match everything".
#[derive(Debug, Clone, Default)]
pub struct FileFilter {
    pub includes: Vec<FilePattern>,
    pub excludes: Vec<FilePattern>,
}

impl FileFilter {
    pub fn new(includes: Vec<FilePattern>, excludes: Vec<FilePattern>) -> Self {
        FileFilter { includes, excludes }
    }

    pub fn from_patterns(includes: &[String], excludes: &[String]) -> CacheResult<Self> {
        let includes = includes
            .iter()
            .map(|p| FilePattern::new(p.clone()))
            .collect::<CacheResult<Vec<_>>>()?;
        let excludes = excludes
            .iter()
            .map(|p| FilePattern::new(p.clone()))
            .collect::<CacheResult<Vec<_>>>()?;
        Ok(FileFilter { includes, excludes })
    }

    pub fn matches(&self, relative_path: &str) -> bool {
        let included = self.includes.is_empty() || self.includes.iter().any(|p| p.matches(relative_path));
        if !included {
            return false;
        }
        !self.excludes.iter().any(|p| p.matches(relative_path))
    }
}

/// Conjunctive matching for name-pattern lists, used by [`crate::execution::ExecutionEntry`].
/// Unlike [`FileFilter`], every include must match (not just one).
pub fn matches_all(name: &str, includes: &[FilePattern]) -> bool {
    includes.iter().all(|p| p.matches(name))
}

pub fn matches_any(name: &str, excludes: &[FilePattern]) -> bool {
    excludes.iter().any(|p| p.matches(name))
}
