//! A single recorded or upcoming goal invocation (component C3).

use crate::config_tree::ConfigTree;
use crate::pattern::{matches_all, matches_any, FilePattern};

/// Identity and configuration of one goal invocation.
///
/// Identity for "is this the same execution slot" purposes is the 5-tuple
/// excluding `config`; equality for "did anything change" purposes is the
/// whole struct (via [`ExecutionEntry::config`] compared through
/// [`crate::config_tree::ConfigDiff`]). Persistence is handled by
/// [`crate::xml`], not `serde`, since `config` has per-node dynamic tag
/// names that don't fit a fixed derive schema.
#[derive(Debug, Clone)]
pub struct ExecutionEntry {
    pub plugin_group: String,
    pub plugin_artifact: String,
    pub plugin_version: String,
    pub goal: String,
    pub execution_id: String,
    pub config: ConfigTree,
}

impl ExecutionEntry {
    /// `(plugin_group, plugin_artifact, plugin_version, goal, execution_id)` equality.
    pub fn matches(&self, other: &ExecutionEntry) -> bool {
        self.plugin_group == other.plugin_group
            && self.plugin_artifact == other.plugin_artifact
            && self.plugin_version == other.plugin_version
            && self.goal == other.goal
            && self.execution_id == other.execution_id
    }

    pub fn match_plugin(&self, group: &str, artifact: &str, goal: &str, execution_id: &str) -> bool {
        self.plugin_group == group
            && self.plugin_artifact == artifact
            && self.goal == goal
            && self.execution_id == execution_id
    }

    pub fn name(&self) -> String {
        format!(
            "{}:{}:{}:{}@{}",
            self.plugin_group, self.plugin_artifact, self.plugin_version, self.goal, self.execution_id
        )
    }

    /// Conjunctive include matching (every include pattern must match),
    /// simple exclude matching (any exclude pattern disqualifies).
    pub fn match_filters(&self, includes: &[FilePattern], excludes: &[FilePattern]) -> bool {
        let name = self.name();
        matches_all(&name, includes) && !matches_any(&name, excludes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(group: &str, artifact: &str, version: &str, goal: &str, id: &str) -> ExecutionEntry {
        ExecutionEntry {
            plugin_group: group.to_string(),
            plugin_artifact: artifact.to_string(),
            plugin_version: version.to_string(),
            goal: goal.to_string(),
            execution_id: id.to_string(),
            config: ConfigTree::default(),
        }
    }

    #[test]
    fn name_format_matches_gav_goal_id_convention() {
        let e = entry("g", "plugin-x", "1", "compile", "default");
        assert_eq!(e.name(), "g:plugin-x:1:compile@default");
    }

    #[test]
    fn matches_is_identity_only_ignoring_config() {
        let a = entry("g", "a", "1", "compile", "id");
        let mut b = a.clone();
        b.config.set_value(b.config.root(), Some("different".to_string()));
        assert!(a.matches(&b));
    }

    #[test]
    fn conjunctive_include_requires_every_pattern() {
        let e = entry("g", "plugin-x", "1", "compile", "id");
        let first = FilePattern::new("*:plugin-x:*:*@*").unwrap();
        let second = FilePattern::new("*:*:*:test@*").unwrap();
        assert!(!e.match_filters(&[first.clone(), second], &[]));
        assert!(e.match_filters(&[first], &[]));
    }

    #[test]
    fn exclude_disqualifies_a_match() {
        let e = entry("g", "plugin-x", "1", "compile", "id");
        let include = FilePattern::new("*").unwrap();
        let exclude = FilePattern::new("*:*:*:*@*").unwrap();
        assert!(!e.match_filters(&[include], &[exclude]));
    }

    #[test]
    fn e6_conjunctive_include_scenario() {
        let includes = vec![
            FilePattern::new("*:plugin-x:*:*@*").unwrap(),
            FilePattern::new("*:*:*:compile@*").unwrap(),
        ];
        let matches = entry("g", "plugin-x", "1", "compile", "id");
        let wrong_goal = entry("g", "plugin-x", "1", "test", "id");
        let wrong_plugin = entry("g", "plugin-y", "1", "compile", "id");

        assert!(matches.match_filters(&includes, &[]));
        assert!(!wrong_goal.match_filters(&includes, &[]));
        assert!(!wrong_plugin.match_filters(&includes, &[]));
    }
}
