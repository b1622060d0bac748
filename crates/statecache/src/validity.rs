//! Validity evaluation and downstream invalidation propagation (component C5).

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::path::{Path, PathBuf};

use tracing::{debug, instrument};

use crate::fingerprint::{fingerprint_project, Fingerprint, FingerprintOptions};
use crate::pattern::FileFilter;
use crate::state::ProjectState;

/// Per-module cache status. Transitions only ever go VALID -> INVALID_DOWNSTREAM;
/// everything else is recomputed fresh each session.
#[derive(Debug, Clone)]
pub enum ProjectStateStatus {
    Unavailable,
    Valid {
        state: ProjectState,
        current_fingerprint: Fingerprint,
    },
    FilesChanged {
        state: ProjectState,
        current_fingerprint: Fingerprint,
    },
    InvalidDownstream {
        state: ProjectState,
        current_fingerprint: Fingerprint,
    },
}

impl ProjectStateStatus {
    pub fn is_valid(&self) -> bool {
        matches!(self, ProjectStateStatus::Valid { .. })
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, ProjectStateStatus::Unavailable)
    }

    pub fn state(&self) -> Option<&ProjectState> {
        match self {
            ProjectStateStatus::Unavailable => None,
            ProjectStateStatus::Valid { state, .. }
            | ProjectStateStatus::FilesChanged { state, .. }
            | ProjectStateStatus::InvalidDownstream { state, .. } => Some(state),
        }
    }

    fn downgrade_to_invalid_downstream(&self) -> Option<ProjectStateStatus> {
        match self {
            ProjectStateStatus::Valid {
                state,
                current_fingerprint,
            } => Some(ProjectStateStatus::InvalidDownstream {
                state: state.clone(),
                current_fingerprint: current_fingerprint.clone(),
            }),
            _ => None,
        }
    }
}

/// What the fingerprinter needs to know about one module to compute its status.
pub struct ModuleInputs<'a> {
    pub project_dir: &'a Path,
    pub build_dir: &'a Path,
    pub submodule_dirs: Vec<PathBuf>,
    pub state_path: &'a Path,
    pub skip_cache: bool,
    pub filter: FileFilter,
    pub fingerprint_options: FingerprintOptions,
}

#[instrument(skip(inputs), fields(state_path = %inputs.state_path.display()))]
pub fn process_state(inputs: &ModuleInputs) -> ProjectStateStatus {
    if inputs.skip_cache {
        return ProjectStateStatus::Unavailable;
    }

    let state = match ProjectState::load(inputs.state_path) {
        Ok(Some(state)) => state,
        Ok(None) => return ProjectStateStatus::Unavailable,
        Err(err) => {
            tracing::warn!(error = %err, "failed to load project state, treating as unavailable");
            return ProjectStateStatus::Unavailable;
        }
    };

    let mut prune_dirs = inputs.submodule_dirs.clone();
    prune_dirs.push(inputs.build_dir.to_path_buf());

    let current_fingerprint = match fingerprint_project(
        inputs.project_dir,
        &prune_dirs,
        &inputs.filter,
        &inputs.fingerprint_options,
    ) {
        Ok(fp) => fp,
        Err(err) => {
            tracing::warn!(error = %err, "failed to fingerprint project, treating as unavailable");
            return ProjectStateStatus::Unavailable;
        }
    };

    if current_fingerprint.is_unchanged_from(&state.fingerprint) {
        ProjectStateStatus::Valid {
            state,
            current_fingerprint,
        }
    } else {
        debug!("project files changed since last recorded state");
        ProjectStateStatus::FilesChanged {
            state,
            current_fingerprint,
        }
    }
}

/// Propagates `INVALID_DOWNSTREAM` through the module dependency graph until
/// a fixed point is reached: any module that depends (directly or
/// transitively) on a non-VALID module is itself downgraded.
///
/// `upstream_of(module)` must return the set of modules `module` directly
/// depends on.
pub fn propagate_invalidation<M, F>(statuses: &mut HashMap<M, ProjectStateStatus>, upstream_of: F)
where
    M: Eq + Hash + Clone,
    F: Fn(&M) -> Vec<M>,
{
    let mut downstream: HashMap<M, Vec<M>> = HashMap::new();
    for module in statuses.keys() {
        for upstream in upstream_of(module) {
            downstream.entry(upstream).or_default().push(module.clone());
        }
    }

    let mut worklist: VecDeque<M> = statuses.keys().cloned().collect();
    let mut queued: HashSet<M> = worklist.iter().cloned().collect();

    while let Some(module) = worklist.pop_front() {
        queued.remove(&module);

        let is_valid = statuses.get(&module).map(|s| s.is_valid()).unwrap_or(false);
        if !is_valid {
            continue;
        }

        let any_upstream_invalid = upstream_of(&module).iter().any(|upstream| {
            statuses
                .get(upstream)
                .map(|s| !s.is_valid())
                .unwrap_or(false)
        });

        if any_upstream_invalid {
            if let Some(new_status) = statuses
                .get(&module)
                .and_then(|s| s.downgrade_to_invalid_downstream())
            {
                statuses.insert(module.clone(), new_status);
                for dependent in downstream.get(&module).cloned().unwrap_or_default() {
                    if queued.insert(dependent.clone()) {
                        worklist.push_back(dependent);
                    }
                }
            }
        }
    }
}

pub fn process_all<M, F>(
    inputs: &HashMap<M, ModuleInputs>,
    upstream_of: F,
) -> HashMap<M, ProjectStateStatus>
where
    M: Eq + Hash + Clone,
    F: Fn(&M) -> Vec<M>,
{
    let mut statuses: HashMap<M, ProjectStateStatus> = inputs
        .iter()
        .map(|(module, input)| (module.clone(), process_state(input)))
        .collect();
    propagate_invalidation(&mut statuses, upstream_of);
    statuses
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ExecutionEntry;

    fn valid(mtime: i64) -> ProjectStateStatus {
        let mut state = ProjectState::new("g", "a", Fingerprint::empty());
        state.executions = Vec::<ExecutionEntry>::new();
        let mut fp = Fingerprint::empty();
        fp.max_mtime_ms = mtime;
        state.fingerprint = fp.clone();
        ProjectStateStatus::Valid {
            state,
            current_fingerprint: fp,
        }
    }

    fn files_changed() -> ProjectStateStatus {
        let state = ProjectState::new("g", "a", Fingerprint::empty());
        ProjectStateStatus::FilesChanged {
            state,
            current_fingerprint: Fingerprint::empty(),
        }
    }

    #[test]
    fn e4_downstream_invalidation_chain() {
        let mut statuses = HashMap::new();
        statuses.insert("root", files_changed());
        statuses.insert("child", valid(1));
        statuses.insert("grandchild", valid(1));

        let upstream = |m: &&str| match *m {
            "child" => vec!["root"],
            "grandchild" => vec!["child"],
            _ => vec![],
        };

        propagate_invalidation(&mut statuses, upstream);

        assert!(matches!(statuses["root"], ProjectStateStatus::FilesChanged { .. }));
        assert!(matches!(statuses["child"], ProjectStateStatus::InvalidDownstream { .. }));
        assert!(matches!(
            statuses["grandchild"],
            ProjectStateStatus::InvalidDownstream { .. }
        ));
    }

    #[test]
    fn unaffected_modules_stay_valid() {
        let mut statuses = HashMap::new();
        statuses.insert("root", files_changed());
        statuses.insert("unrelated", valid(1));

        let upstream = |_: &&str| vec![];
        propagate_invalidation(&mut statuses, upstream);

        assert!(matches!(statuses["unrelated"], ProjectStateStatus::Valid { .. }));
    }

    #[test]
    fn diamond_dependency_propagates_through_both_paths() {
        let mut statuses = HashMap::new();
        statuses.insert("root", files_changed());
        statuses.insert("left", valid(1));
        statuses.insert("right", valid(1));
        statuses.insert("bottom", valid(1));

        let upstream = |m: &&str| match *m {
            "left" | "right" => vec!["root"],
            "bottom" => vec!["left", "right"],
            _ => vec![],
        };
        propagate_invalidation(&mut statuses, upstream);

        assert!(matches!(statuses["left"], ProjectStateStatus::InvalidDownstream { .. }));
        assert!(matches!(statuses["right"], ProjectStateStatus::InvalidDownstream { .. }));
        assert!(matches!(statuses["bottom"], ProjectStateStatus::InvalidDownstream { .. }));
    }

    #[test]
    fn propagation_is_idempotent_at_the_fixed_point() {
        let mut statuses = HashMap::new();
        statuses.insert("root", files_changed());
        statuses.insert("child", valid(1));
        let upstream = |m: &&str| if *m == "child" { vec!["root"] } else { vec![] };

        propagate_invalidation(&mut statuses, upstream);
        propagate_invalidation(&mut statuses, upstream);

        assert!(matches!(statuses["child"], ProjectStateStatus::InvalidDownstream { .. }));
    }
}
