use serde::{Deserialize, Serialize};

/// Knobs the outer builder (or a `statecache.toml` fixture, for testing) can set.
///
/// Defaults match the documented defaults: caching enabled, checksums on,
/// every include list defaulting to "match everything".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Disable the cache entirely for the module(s) this config applies to.
    pub skip: bool,

    pub create_archive: bool,
    pub load_archive: bool,
    pub archive_file: Option<String>,

    pub enable_checksums: bool,
    pub include_all_checksums: bool,

    pub project_files_excludes: Vec<String>,
    pub build_files_excludes: Vec<String>,

    pub executions_includes: Vec<String>,
    pub executions_excludes: Vec<String>,

    /// When set, the planner computes classifications without mutating the
    /// live goal list or removing any execution from it.
    pub explain: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            skip: false,
            create_archive: false,
            load_archive: false,
            archive_file: None,
            enable_checksums: true,
            include_all_checksums: false,
            project_files_excludes: Vec::new(),
            build_files_excludes: Vec::new(),
            executions_includes: vec!["*".to_string()],
            executions_excludes: Vec::new(),
            explain: false,
        }
    }
}

impl CacheConfig {
    pub fn from_toml(text: &str) -> Result<Self, crate::error::CacheError> {
        toml::from_str(text).map_err(|e| crate::error::CacheError::Config(e.to_string()))
    }

    pub fn to_toml(&self) -> Result<String, crate::error::CacheError> {
        toml::to_string_pretty(self).map_err(|e| crate::error::CacheError::Config(e.to_string()))
    }
}
