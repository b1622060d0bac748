//! Session coordinator (component C7): wires fingerprinting, validity
//! evaluation, planning, and archiving into the five lifecycle hooks the
//! outer builder drives.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, instrument, warn};

use crate::archive::{self, ModuleArchiveInput};
use crate::config::CacheConfig;
use crate::execution::ExecutionEntry;
use crate::fingerprint::{Fingerprint, FingerprintOptions};
use crate::pattern::{FileFilter, FilePattern};
use crate::planner::{self, DriverHooks, ExecutionPlan};
use crate::state::ProjectState;
use crate::validity::{self, ModuleInputs, ProjectStateStatus};

/// Compiles `executionsIncludes`/`executionsExcludes` into the pattern lists
/// [`crate::execution::ExecutionEntry::match_filters`] expects. An empty
/// include list defaults to `["*"]` (match everything); an invalid pattern in
/// either list disables filtering for the session rather than panicking, on
/// the theory that a cache that matches too much is safer than one that
/// silently excludes everything.
fn compile_execution_filters(config: &CacheConfig) -> (Vec<FilePattern>, Vec<FilePattern>) {
    let raw_includes: Vec<String> = if config.executions_includes.is_empty() {
        vec!["*".to_string()]
    } else {
        config.executions_includes.clone()
    };
    let includes: Result<Vec<FilePattern>, _> = raw_includes.iter().map(|p| FilePattern::new(p.clone())).collect();
    let excludes: Result<Vec<FilePattern>, _> =
        config.executions_excludes.iter().map(|p| FilePattern::new(p.clone())).collect();
    match (includes, excludes) {
        (Ok(includes), Ok(excludes)) => (includes, excludes),
        (_, _) => {
            warn!("invalid executionsIncludes/executionsExcludes pattern, disabling execution filtering for this session");
            (vec![FilePattern::new("*").expect("`*` is a valid glob pattern")], Vec::new())
        }
    }
}

pub type ModuleKey = (String, String);

#[derive(Debug, Clone)]
pub struct ModuleDescriptor {
    pub group_id: String,
    pub artifact_id: String,
    pub project_dir: PathBuf,
    pub build_dir: PathBuf,
    pub submodule_dirs: Vec<PathBuf>,
    pub state_path: PathBuf,
    pub upstream: Vec<ModuleKey>,
}

impl ModuleDescriptor {
    pub fn key(&self) -> ModuleKey {
        (self.group_id.clone(), self.artifact_id.clone())
    }
}

/// Counts collected once per session; not persisted, purely for optional
/// caller-side reporting.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub modules_valid: usize,
    pub modules_files_changed: usize,
    pub modules_invalid_downstream: usize,
    pub modules_unavailable: usize,
    pub executions_cached: usize,
    pub executions_new: usize,
    pub executions_diff: usize,
}

pub struct SessionCoordinator {
    config: CacheConfig,
    session_root: PathBuf,
    local_repo_root: PathBuf,
    statuses: Mutex<HashMap<ModuleKey, ProjectStateStatus>>,
    module_paths: Mutex<HashMap<ModuleKey, PathBuf>>,
    plans: Mutex<HashMap<ModuleKey, ExecutionPlan>>,
    pending_executions: Mutex<HashMap<ModuleKey, Vec<ExecutionEntry>>>,
}

impl SessionCoordinator {
    pub fn new(config: CacheConfig, session_root: PathBuf, local_repo_root: PathBuf) -> Self {
        SessionCoordinator {
            config,
            session_root,
            local_repo_root,
            statuses: Mutex::new(HashMap::new()),
            module_paths: Mutex::new(HashMap::new()),
            plans: Mutex::new(HashMap::new()),
            pending_executions: Mutex::new(HashMap::new()),
        }
    }

    #[instrument(skip(self, modules, resolve_executions, hooks))]
    pub fn after_projects_read<H: DriverHooks>(
        &self,
        modules: &[ModuleDescriptor],
        goal_list_contains_clean: bool,
        resolve_executions: impl Fn(&ModuleDescriptor) -> Vec<ExecutionEntry>,
        hooks: &mut H,
    ) -> HashMap<ModuleKey, ExecutionPlan> {
        if self.config.skip {
            debug!("cache disabled via configuration, skipping");
            return HashMap::new();
        }

        for module in modules {
            self.module_paths.lock().insert(module.key(), module.state_path.clone());
        }

        if self.config.load_archive {
            if let Some(archive_file) = &self.config.archive_file {
                let archive_path = self.session_root.join(archive_file);
                let module_excludes: HashMap<ModuleKey, Vec<String>> = modules
                    .iter()
                    .map(|m| (m.key(), self.config.build_files_excludes.clone()))
                    .collect();
                if let Err(err) = archive::load(&archive_path, &self.session_root, &self.local_repo_root, &module_excludes) {
                    warn!(error = %err, "failed to load archive, continuing without it");
                }
            }
        }

        if goal_list_contains_clean {
            debug!("clean phase present in goal list, skipping state processing entirely");
            return HashMap::new();
        }

        let inputs: HashMap<ModuleKey, ModuleInputs> = modules
            .iter()
            .map(|module| {
                let filter = FileFilter::from_patterns(&[], &self.config.project_files_excludes)
                    .unwrap_or_default();
                let fingerprint_options = FingerprintOptions {
                    enable_checksum: self.config.enable_checksums,
                    include_all_checksums: self.config.include_all_checksums,
                };
                (
                    module.key(),
                    ModuleInputs {
                        project_dir: &module.project_dir,
                        build_dir: &module.build_dir,
                        submodule_dirs: module.submodule_dirs.clone(),
                        state_path: &module.state_path,
                        skip_cache: self.config.skip,
                        filter,
                        fingerprint_options,
                    },
                )
            })
            .collect();

        let upstream_by_key: HashMap<ModuleKey, Vec<ModuleKey>> =
            modules.iter().map(|m| (m.key(), m.upstream.clone())).collect();
        let upstream_of = |key: &ModuleKey| upstream_by_key.get(key).cloned().unwrap_or_default();

        let statuses = validity::process_all(&inputs, upstream_of);

        let (exec_includes, exec_excludes) = compile_execution_filters(&self.config);

        let mut plans = HashMap::new();
        for module in modules {
            let key = module.key();
            let Some(status) = statuses.get(&key) else { continue };
            if status.is_unavailable() {
                continue;
            }
            let upcoming = resolve_executions(module);
            let session_root = self.session_root.to_string_lossy();
            let plan = planner::plan_module(
                status,
                &upcoming,
                &session_root,
                &exec_includes,
                &exec_excludes,
                self.config.explain,
                hooks,
            );
            plans.insert(key, plan);
        }

        *self.statuses.lock() = statuses;
        *self.plans.lock() = plans.clone();
        plans
    }

    /// Returns the side-output properties recorded for `key` if its state
    /// is currently `VALID`; empty otherwise.
    pub fn project_started(&self, key: &ModuleKey) -> BTreeMap<String, String> {
        match self.statuses.lock().get(key) {
            Some(ProjectStateStatus::Valid { state, .. }) => state.output_properties.clone(),
            _ => BTreeMap::new(),
        }
    }

    /// Records a completed goal for later persistence, unless it was
    /// sourced from the CLI or the `clean` phase, or falls outside the
    /// configured `executionsIncludes`/`executionsExcludes` name patterns.
    /// The execution's configuration is normalized against this session's
    /// root before storing, so the persisted record still fast-forwards if
    /// the workspace is later checked out somewhere else.
    pub fn goal_succeeded(
        &self,
        key: &ModuleKey,
        mut execution: ExecutionEntry,
        is_from_clean_phase: bool,
        is_cli_sourced: bool,
    ) {
        if !planner::should_record(is_from_clean_phase, is_cli_sourced) {
            return;
        }
        let (includes, excludes) = compile_execution_filters(&self.config);
        if !execution.match_filters(&includes, &excludes) {
            return;
        }
        execution
            .config
            .replace_exec_root_placeholder(&self.session_root.to_string_lossy());
        self.pending_executions.lock().entry(key.clone()).or_default().push(execution);
    }

    /// Persists the merged project state for `key`.
    #[instrument(skip(self, extra_properties))]
    pub fn project_succeeded(
        &self,
        key: &ModuleKey,
        new_fingerprint: Option<Fingerprint>,
        extra_properties: BTreeMap<String, String>,
    ) {
        let state_path = match self.module_paths.lock().get(key).cloned() {
            Some(path) => path,
            None => {
                warn!(?key, "project_succeeded called for an unknown module, nothing to persist");
                return;
            }
        };

        let prior = match ProjectState::load(&state_path) {
            Ok(Some(state)) => state,
            Ok(None) => ProjectState::new(key.0.clone(), key.1.clone(), Fingerprint::empty()),
            Err(err) => {
                warn!(error = %err, "failed to reload prior project state before merge, starting fresh");
                ProjectState::new(key.0.clone(), key.1.clone(), Fingerprint::empty())
            }
        };

        let new_executions = self.pending_executions.lock().remove(key).unwrap_or_default();
        let merged = ProjectState::merge(&prior, new_executions, new_fingerprint, extra_properties);

        if let Err(err) = merged.save(&state_path) {
            warn!(error = %err, "failed to persist project state");
        }
    }

    /// Creates the archive (if configured) and returns the session's stats.
    #[instrument(skip(self, modules, repo_artifact_files))]
    pub fn after_session_end(
        &self,
        modules: &[ModuleDescriptor],
        repo_artifact_files: &[PathBuf],
    ) -> CacheStats {
        if self.config.create_archive {
            if let Some(archive_file) = &self.config.archive_file {
                let archive_path = self.session_root.join(archive_file);
                let archive_modules: Vec<ModuleArchiveInput> = modules
                    .iter()
                    .map(|m| ModuleArchiveInput {
                        group_id: m.group_id.clone(),
                        artifact_id: m.artifact_id.clone(),
                        build_dir: &m.build_dir,
                        build_files_excludes: self.config.build_files_excludes.clone(),
                    })
                    .collect();
                if let Err(err) = archive::save(
                    &archive_path,
                    &self.session_root,
                    &self.local_repo_root,
                    &archive_modules,
                    repo_artifact_files,
                ) {
                    warn!(error = %err, "failed to create archive");
                }
            }
        }

        self.stats()
    }

    fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for status in self.statuses.lock().values() {
            match status {
                ProjectStateStatus::Valid { .. } => stats.modules_valid += 1,
                ProjectStateStatus::FilesChanged { .. } => stats.modules_files_changed += 1,
                ProjectStateStatus::InvalidDownstream { .. } => stats.modules_invalid_downstream += 1,
                ProjectStateStatus::Unavailable => stats.modules_unavailable += 1,
            }
        }
        for plan in self.plans.lock().values() {
            for (_, classification) in &plan.classifications {
                if classification.is_cached() {
                    stats.executions_cached += 1;
                } else if classification.is_new() {
                    stats.executions_new += 1;
                } else if classification.is_diff() {
                    stats.executions_diff += 1;
                }
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_tree::ConfigTree;
    use tempfile::tempdir;

    struct NoopHooks;
    impl DriverHooks for NoopHooks {
        fn remove_goal(&mut self, _: &str, _: &str, _: &str, _: &str) {}
    }

    fn execution() -> ExecutionEntry {
        ExecutionEntry {
            plugin_group: "p".to_string(),
            plugin_artifact: "q".to_string(),
            plugin_version: "1".to_string(),
            goal: "pkg".to_string(),
            execution_id: "default-pkg".to_string(),
            config: ConfigTree::new("configuration"),
        }
    }

    #[test]
    fn skip_config_short_circuits_everything() {
        let root = tempdir().unwrap();
        let coordinator = SessionCoordinator::new(
            CacheConfig { skip: true, ..Default::default() },
            root.path().to_path_buf(),
            root.path().to_path_buf(),
        );
        let mut hooks = NoopHooks;
        let plans = coordinator.after_projects_read(&[], false, |_| vec![], &mut hooks);
        assert!(plans.is_empty());
    }

    #[test]
    fn clean_phase_skips_state_processing_but_not_archive_load() {
        let root = tempdir().unwrap();
        let module = ModuleDescriptor {
            group_id: "g".to_string(),
            artifact_id: "a".to_string(),
            project_dir: root.path().join("a"),
            build_dir: root.path().join("a/target"),
            submodule_dirs: vec![],
            state_path: root.path().join("a/state.xml"),
            upstream: vec![],
        };
        std::fs::create_dir_all(&module.project_dir).unwrap();

        let coordinator = SessionCoordinator::new(CacheConfig::default(), root.path().to_path_buf(), root.path().to_path_buf());
        let mut hooks = NoopHooks;
        let plans = coordinator.after_projects_read(&[module], true, |_| vec![execution()], &mut hooks);
        assert!(plans.is_empty());
    }

    #[test]
    fn project_succeeded_persists_merged_state() {
        let root = tempdir().unwrap();
        let state_path = root.path().join("state.xml");
        let coordinator = SessionCoordinator::new(CacheConfig::default(), root.path().to_path_buf(), root.path().to_path_buf());
        coordinator
            .module_paths
            .lock()
            .insert(("g".to_string(), "a".to_string()), state_path.clone());

        let key = ("g".to_string(), "a".to_string());
        coordinator.goal_succeeded(&key, execution(), false, false);
        coordinator.project_succeeded(&key, Some(Fingerprint::empty()), BTreeMap::new());

        let persisted = ProjectState::load(&state_path).unwrap().unwrap();
        assert_eq!(persisted.executions.len(), 1);
    }

    #[test]
    fn clean_phase_executions_are_not_persisted() {
        let root = tempdir().unwrap();
        let state_path = root.path().join("state.xml");
        let coordinator = SessionCoordinator::new(CacheConfig::default(), root.path().to_path_buf(), root.path().to_path_buf());
        coordinator
            .module_paths
            .lock()
            .insert(("g".to_string(), "a".to_string()), state_path.clone());

        let key = ("g".to_string(), "a".to_string());
        coordinator.goal_succeeded(&key, execution(), true, false);
        coordinator.project_succeeded(&key, Some(Fingerprint::empty()), BTreeMap::new());

        let persisted = ProjectState::load(&state_path).unwrap().unwrap();
        assert!(persisted.executions.is_empty());
    }

    #[test]
    fn executions_excludes_keeps_a_matching_goal_out_of_persisted_state() {
        let root = tempdir().unwrap();
        let state_path = root.path().join("state.xml");
        let config = CacheConfig {
            executions_excludes: vec!["*:q:*:pkg@*".to_string()],
            ..Default::default()
        };
        let coordinator = SessionCoordinator::new(config, root.path().to_path_buf(), root.path().to_path_buf());
        coordinator
            .module_paths
            .lock()
            .insert(("g".to_string(), "a".to_string()), state_path.clone());

        let key = ("g".to_string(), "a".to_string());
        coordinator.goal_succeeded(&key, execution(), false, false);
        coordinator.project_succeeded(&key, Some(Fingerprint::empty()), BTreeMap::new());

        let persisted = ProjectState::load(&state_path).unwrap().unwrap();
        assert!(persisted.executions.is_empty());
    }
}
