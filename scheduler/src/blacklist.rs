use regex::Regex;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{SchedulerError, SchedulerResult};

/// A rule suppressing scheduling of matching `(task name, revision)` pairs.
/// Patterns are full-match regexes over the task-spec name; an empty
/// pattern list matches every name, an empty commit list every revision.
/// A rule with both lists empty would blacklist everything and is rejected.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct Rule {
    pub name: String,
    pub task_spec_patterns: Vec<String>,
    pub commits: Vec<String>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default)]
pub struct Blacklist {
    rules: Vec<(Rule, Vec<Regex>)>,
}

impl Blacklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rule(&mut self, rule: Rule) -> SchedulerResult<()> {
        if rule.name.is_empty() {
            return Err(SchedulerError::InvalidRule("rule has no name".to_string()));
        }
        if rule.task_spec_patterns.is_empty() && rule.commits.is_empty() {
            return Err(SchedulerError::InvalidRule(format!(
                "rule {:?} would match every task",
                rule.name
            )));
        }
        if self.rules.iter().any(|(r, _)| r.name == rule.name) {
            return Err(SchedulerError::InvalidRule(format!(
                "rule {:?} already exists",
                rule.name
            )));
        }
        let mut compiled = Vec::with_capacity(rule.task_spec_patterns.len());
        for pattern in &rule.task_spec_patterns {
            let anchored = format!("^(?:{pattern})$");
            let regex = Regex::new(&anchored).map_err(|e| {
                SchedulerError::InvalidRule(format!("bad pattern {pattern:?}: {e}"))
            })?;
            compiled.push(regex);
        }
        self.rules.push((rule, compiled));
        Ok(())
    }

    pub fn remove_rule(&mut self, name: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|(r, _)| r.name != name);
        self.rules.len() != before
    }

    pub fn rules(&self) -> Vec<&Rule> {
        self.rules.iter().map(|(r, _)| r).collect()
    }

    /// The name of the first rule matching the pair, if any.
    pub fn match_rule(&self, task_name: &str, revision: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|(rule, patterns)| {
                let name_matches =
                    patterns.is_empty() || patterns.iter().any(|p| p.is_match(task_name));
                let commit_matches =
                    rule.commits.is_empty() || rule.commits.iter().any(|c| c == revision);
                name_matches && commit_matches
            })
            .map(|(rule, _)| rule.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(name: &str, patterns: &[&str], commits: &[&str]) -> Rule {
        Rule {
            name: name.to_string(),
            task_spec_patterns: patterns.iter().map(|p| p.to_string()).collect(),
            commits: commits.iter().map(|c| c.to_string()).collect(),
            description: String::new(),
        }
    }

    #[test]
    fn test_match_by_pattern_and_commit() {
        let mut blacklist = Blacklist::new();
        blacklist
            .add_rule(rule("perf-off", &["Perf-.*"], &["abc"]))
            .unwrap();

        assert_eq!(blacklist.match_rule("Perf-Linux", "abc"), Some("perf-off"));
        assert_eq!(blacklist.match_rule("Perf-Linux", "def"), None);
        assert_eq!(blacklist.match_rule("Test-Linux", "abc"), None);
        // Full-match anchoring: a prefix hit is not enough.
        assert_eq!(blacklist.match_rule("Some-Perf-Linux", "abc"), None);
    }

    #[test]
    fn test_commit_only_rule_matches_all_names() {
        let mut blacklist = Blacklist::new();
        blacklist.add_rule(rule("bad-commit", &[], &["abc"])).unwrap();
        assert_eq!(blacklist.match_rule("Anything", "abc"), Some("bad-commit"));
        assert_eq!(blacklist.match_rule("Anything", "def"), None);
    }

    #[test]
    fn test_rejects_match_everything_rule() {
        let mut blacklist = Blacklist::new();
        assert!(blacklist.add_rule(rule("all", &[], &[])).is_err());
    }

    #[test]
    fn test_rejects_duplicate_and_bad_pattern() {
        let mut blacklist = Blacklist::new();
        blacklist.add_rule(rule("r", &["Build"], &[])).unwrap();
        assert!(blacklist.add_rule(rule("r", &["Test"], &[])).is_err());
        assert!(blacklist.add_rule(rule("broken", &["("], &[])).is_err());
    }

    #[test]
    fn test_remove_rule() {
        let mut blacklist = Blacklist::new();
        blacklist.add_rule(rule("r", &["Build"], &[])).unwrap();
        assert!(blacklist.remove_rule("r"));
        assert!(!blacklist.remove_rule("r"));
        assert_eq!(blacklist.match_rule("Build", "abc"), None);
    }
}
