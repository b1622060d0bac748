//! Incremental build cache: fingerprinting, configuration diffing, and
//! validity propagation for a multi-module builder.
//!
//! This crate is the state engine only. It has no CLI and does not itself
//! dispatch goals; it is loaded by an outer builder through the narrow
//! [`planner::DriverHooks`] interface and the [`session::SessionCoordinator`]
//! lifecycle hooks.

pub mod archive;
pub mod config;
pub mod config_tree;
pub mod error;
pub mod execution;
pub mod fingerprint;
pub mod pattern;
pub mod planner;
pub mod session;
pub mod state;
pub mod validity;
mod xml;

pub use config::CacheConfig;
pub use error::{CacheError, CacheResult};
pub use execution::ExecutionEntry;
pub use fingerprint::Fingerprint;
pub use planner::{DriverHooks, ExecutionPlan, ExecutionStatus};
pub use session::{CacheStats, ModuleDescriptor, ModuleKey, SessionCoordinator};
pub use state::ProjectState;
pub use validity::ProjectStateStatus;

use std::sync::OnceLock;

static ENGINE_VERSION: OnceLock<String> = OnceLock::new();

/// This engine's own version string, computed once and reused for the
/// lifetime of the process (surfaced in diagnostics, never persisted).
pub fn engine_version() -> &'static str {
    ENGINE_VERSION.get_or_init(|| env!("CARGO_PKG_VERSION").to_string())
}

#[cfg(test)]
mod tests {
    use super::engine_version;

    #[test]
    fn engine_version_is_stable_across_calls() {
        assert_eq!(engine_version(), engine_version());
        assert!(!engine_version().is_empty());
    }
}
