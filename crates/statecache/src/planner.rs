//! Execution planning (component C6): classify upcoming goal invocations
//! against a module's recorded state, skip the ones that are unchanged, and
//! record what actually ran.

use crate::config_tree::{ConfigDiff, Diff};
use crate::execution::ExecutionEntry;
use crate::pattern::FilePattern;
use crate::validity::ProjectStateStatus;

#[derive(Debug, Clone)]
pub enum ExecutionStatus {
    New,
    Cached,
    Diff(Vec<Diff>),
}

impl ExecutionStatus {
    pub fn is_new(&self) -> bool {
        matches!(self, ExecutionStatus::New)
    }

    pub fn is_cached(&self) -> bool {
        matches!(self, ExecutionStatus::Cached)
    }

    pub fn is_diff(&self) -> bool {
        matches!(self, ExecutionStatus::Diff(_))
    }

    pub fn diffs(&self) -> Option<&[Diff]> {
        match self {
            ExecutionStatus::Diff(diffs) => Some(diffs),
            _ => None,
        }
    }
}

/// Narrow interface onto the outer builder's live goal plan: the only
/// mutation the planner ever performs on the build is removing goals it has
/// decided to skip.
pub trait DriverHooks {
    fn remove_goal(&mut self, plugin_group: &str, plugin_artifact: &str, goal: &str, execution_id: &str);
}

#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub classifications: Vec<(ExecutionEntry, ExecutionStatus)>,
}

impl ExecutionPlan {
    pub fn cached_count(&self) -> usize {
        self.classifications.iter().filter(|(_, s)| s.is_cached()).count()
    }

    pub fn has_work(&self) -> bool {
        self.classifications.iter().any(|(_, s)| !s.is_cached())
    }

    pub fn is_fast_forward(&self) -> bool {
        !self.classifications.is_empty() && !self.has_work()
    }
}

/// Classifies every upcoming execution against the module's status and, for
/// every `CACHED` result, asks the driver to skip that goal — unless
/// `explain` is set, in which case classification happens but nothing is
/// mutated.
///
/// `session_root`, when non-empty, is substituted out of both the recorded
/// and the upcoming configuration before diffing (see
/// [`crate::config_tree::ConfigTree::replace_exec_root_placeholder`]), so a
/// workspace checked out at a different path still fast-forwards.
///
/// `includes`/`excludes` are the compiled `executionsIncludes`/
/// `executionsExcludes` name patterns. An execution whose name (see
/// [`ExecutionEntry::name`]) fails [`ExecutionEntry::match_filters`] is
/// outside the cache's scope entirely: it is always classified `New` and
/// never skipped, regardless of what is recorded for it.
pub fn plan_module(
    status: &ProjectStateStatus,
    upcoming: &[ExecutionEntry],
    session_root: &str,
    includes: &[FilePattern],
    excludes: &[FilePattern],
    explain: bool,
    hooks: &mut impl DriverHooks,
) -> ExecutionPlan {
    let recorded: &[ExecutionEntry] = match status {
        ProjectStateStatus::Valid { state, .. } => &state.executions,
        ProjectStateStatus::FilesChanged { .. }
        | ProjectStateStatus::InvalidDownstream { .. }
        | ProjectStateStatus::Unavailable => {
            return ExecutionPlan {
                classifications: upcoming.iter().cloned().map(|e| (e, ExecutionStatus::New)).collect(),
            }
        }
    };

    let mut classifications = Vec::with_capacity(upcoming.len());
    for exec in upcoming {
        if !exec.match_filters(includes, excludes) {
            classifications.push((exec.clone(), ExecutionStatus::New));
            continue;
        }

        let recorded_match = recorded.iter().find(|candidate| candidate.matches(exec));
        let classification = match recorded_match {
            None => ExecutionStatus::New,
            Some(prior) => {
                let mut prior_config = prior.config.clone();
                let mut actual_config = exec.config.clone();
                prior_config.replace_exec_root_placeholder(session_root);
                actual_config.replace_exec_root_placeholder(session_root);
                let diff = ConfigDiff::compute(&prior_config, &actual_config);
                if diff.is_empty() {
                    ExecutionStatus::Cached
                } else {
                    ExecutionStatus::Diff(diff.as_slice().to_vec())
                }
            }
        };

        if classification.is_cached() && !explain {
            hooks.remove_goal(&exec.plugin_group, &exec.plugin_artifact, &exec.goal, &exec.execution_id);
        }

        classifications.push((exec.clone(), classification));
    }

    ExecutionPlan { classifications }
}

/// Whether a just-completed execution should be recorded into the persisted
/// state: executions issued directly from the CLI, or belonging to the
/// `clean` phase, are never recorded.
pub fn should_record(is_from_clean_phase: bool, is_cli_sourced: bool) -> bool {
    !is_from_clean_phase && !is_cli_sourced
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_tree::ConfigTree;
    use crate::state::ProjectState;
    use std::cell::RefCell;

    #[derive(Default)]
    struct RecordingHooks {
        removed: RefCell<Vec<(String, String, String, String)>>,
    }

    impl DriverHooks for RecordingHooks {
        fn remove_goal(&mut self, plugin_group: &str, plugin_artifact: &str, goal: &str, execution_id: &str) {
            self.removed.borrow_mut().push((
                plugin_group.to_string(),
                plugin_artifact.to_string(),
                goal.to_string(),
                execution_id.to_string(),
            ));
        }
    }

    fn execution(arg: &str) -> ExecutionEntry {
        let mut config = ConfigTree::new("configuration");
        let root = config.root();
        config.add_child(root, "arg", Some(arg.to_string()));
        ExecutionEntry {
            plugin_group: "p".to_string(),
            plugin_artifact: "q".to_string(),
            plugin_version: "1".to_string(),
            goal: "pkg".to_string(),
            execution_id: "default-pkg".to_string(),
            config,
        }
    }

    fn match_everything() -> Vec<FilePattern> {
        vec![FilePattern::new("*").unwrap()]
    }

    fn valid_status(recorded: Vec<ExecutionEntry>) -> ProjectStateStatus {
        let mut state = ProjectState::new("g", "a", crate::fingerprint::Fingerprint::empty());
        state.executions = recorded;
        ProjectStateStatus::Valid {
            state,
            current_fingerprint: crate::fingerprint::Fingerprint::empty(),
        }
    }

    #[test]
    fn e1_fast_forward_is_cached_and_removes_the_goal() {
        let status = valid_status(vec![execution("-O1")]);
        let upcoming = vec![execution("-O1")];
        let mut hooks = RecordingHooks::default();

        let plan = plan_module(&status, &upcoming, "", &match_everything(), &[], false, &mut hooks);
        assert!(plan.is_fast_forward());
        assert_eq!(hooks.removed.borrow().len(), 1);
    }

    #[test]
    fn e3_config_diff_is_reported_and_not_removed() {
        let status = valid_status(vec![execution("-O1")]);
        let upcoming = vec![execution("-O2")];
        let mut hooks = RecordingHooks::default();

        let plan = plan_module(&status, &upcoming, "", &match_everything(), &[], false, &mut hooks);
        assert_eq!(plan.classifications.len(), 1);
        assert!(plan.classifications[0].1.is_diff());
        let diffs = plan.classifications[0].1.diffs().unwrap();
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].path, "configuration/arg");
        assert!(hooks.removed.borrow().is_empty());
    }

    #[test]
    fn new_execution_with_no_prior_record_is_new() {
        let status = valid_status(vec![]);
        let upcoming = vec![execution("-O1")];
        let mut hooks = RecordingHooks::default();

        let plan = plan_module(&status, &upcoming, "", &match_everything(), &[], false, &mut hooks);
        assert!(plan.classifications[0].1.is_new());
    }

    #[test]
    fn files_changed_status_plans_everything_as_new_with_no_removals() {
        let state = ProjectState::new("g", "a", crate::fingerprint::Fingerprint::empty());
        let status = ProjectStateStatus::FilesChanged {
            state,
            current_fingerprint: crate::fingerprint::Fingerprint::empty(),
        };
        let upcoming = vec![execution("-O1")];
        let mut hooks = RecordingHooks::default();

        let plan = plan_module(&status, &upcoming, "", &match_everything(), &[], false, &mut hooks);
        assert!(plan.classifications[0].1.is_new());
        assert!(hooks.removed.borrow().is_empty());
    }

    #[test]
    fn explain_mode_classifies_without_mutating() {
        let status = valid_status(vec![execution("-O1")]);
        let upcoming = vec![execution("-O1")];
        let mut hooks = RecordingHooks::default();

        let plan = plan_module(&status, &upcoming, "", &match_everything(), &[], true, &mut hooks);
        assert!(plan.classifications[0].1.is_cached());
        assert!(hooks.removed.borrow().is_empty());
    }

    #[test]
    fn session_root_substitution_still_fast_forwards_after_a_workspace_move() {
        // Simulates `SessionCoordinator::goal_succeeded` already having
        // normalized the recorded config against the root it was saved
        // under; the upcoming config still carries the new session's raw
        // root and gets normalized by `plan_module` itself.
        let mut recorded = execution("/ci/workspace-1/out");
        recorded.config.replace_exec_root_placeholder("/ci/workspace-1");
        let status = valid_status(vec![recorded]);
        let upcoming = vec![execution("/ci/workspace-2/out")];
        let mut hooks = RecordingHooks::default();

        let plan = plan_module(&status, &upcoming, "/ci/workspace-2", &match_everything(), &[], false, &mut hooks);
        assert!(plan.classifications[0].1.is_cached());
    }

    #[test]
    fn clean_phase_and_cli_sourced_executions_are_never_recorded() {
        assert!(!should_record(true, false));
        assert!(!should_record(false, true));
        assert!(should_record(false, false));
    }

    #[test]
    fn excluded_execution_is_always_new_even_with_an_identical_record() {
        let status = valid_status(vec![execution("-O1")]);
        let upcoming = vec![execution("-O1")];
        let mut hooks = RecordingHooks::default();
        let excludes = vec![FilePattern::new("*:q:*:pkg@*").unwrap()];

        let plan = plan_module(&status, &upcoming, "", &match_everything(), &excludes, false, &mut hooks);
        assert!(plan.classifications[0].1.is_new());
        assert!(hooks.removed.borrow().is_empty());
    }

    #[test]
    fn execution_outside_the_include_list_is_always_new() {
        let status = valid_status(vec![execution("-O1")]);
        let upcoming = vec![execution("-O1")];
        let mut hooks = RecordingHooks::default();
        let includes = vec![FilePattern::new("*:other-plugin:*:*@*").unwrap()];

        let plan = plan_module(&status, &upcoming, "", &includes, &[], false, &mut hooks);
        assert!(plan.classifications[0].1.is_new());
        assert!(hooks.removed.borrow().is_empty());
    }
}
