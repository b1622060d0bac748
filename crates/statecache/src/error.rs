use std::path::PathBuf;

use thiserror::Error;

/// Error taxonomy for the cache engine.
///
/// Every fallible path in this crate returns [`CacheResult`]; the
/// [`crate::session::SessionCoordinator`] is the only place that catches these and
/// downgrades them to a module status instead of propagating them to the build.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed state at {path}: {reason}")]
    MalformedState { path: PathBuf, reason: String },

    #[error("invalid cache configuration: {0}")]
    Config(String),

    #[error("internal invariant violated: {0}")]
    Invariant(String),
}

pub type CacheResult<T> = Result<T, CacheError>;

impl CacheError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        CacheError::MalformedState {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error should be treated as "no usable prior state", i.e.
    /// downgrade the module to `UNAVAILABLE` rather than abort the session.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CacheError::Io { .. } | CacheError::MalformedState { .. })
    }
}
