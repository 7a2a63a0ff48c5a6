use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use conveyor_lib::task::{Task, TaskStatus};
use conveyor_store::TaskCacheSnapshot;

use crate::candidates::Candidate;

/// A mutable, group-local overlay over a task-cache snapshot, scoped to one
/// `(repo, task name)` scoring group. Virtually committed candidates become
/// synthetic tasks here; stolen commits are subtracted from local copies of
/// their predecessors. Nothing in this view ever reaches the real cache.
pub(crate) struct GroupView {
    repo: String,
    name: String,
    snapshot: Arc<TaskCacheSnapshot>,
    tasks: HashMap<String, Task>,
    by_commit: HashMap<String, String>,
}

impl GroupView {
    pub fn new(repo: impl Into<String>, name: impl Into<String>, snapshot: Arc<TaskCacheSnapshot>) -> Self {
        Self {
            repo: repo.into(),
            name: name.into(),
            snapshot,
            tasks: HashMap::new(),
            by_commit: HashMap::new(),
        }
    }

    pub fn known_task_name(&self) -> bool {
        !self.tasks.is_empty() || self.snapshot.known_task_name(&self.repo, &self.name)
    }

    pub fn get_task(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id).or_else(|| self.snapshot.get(id))
    }

    /// The newest task of this group covering the commit, preferring local
    /// (virtually committed or mutated) state over the snapshot.
    pub fn task_for_commit(&self, commit: &str) -> Option<&Task> {
        if let Some(id) = self.by_commit.get(commit) {
            return self.tasks.get(id);
        }
        self.snapshot
            .task_for_commit(&self.repo, &self.name, commit)
            .and_then(|t| self.get_task(&t.id))
    }

    /// Virtually commit a scored candidate: insert it as a synthetic pending
    /// task and subtract its commits from the local copy of the predecessor
    /// it steals from.
    pub fn commit_candidate(&mut self, candidate: &Candidate) {
        let id = candidate.id();
        let mut task = Task::new(id.clone(), candidate.key.clone(), Utc::now());
        task.attempt = candidate.attempt;
        task.commits = candidate.commits.clone();
        task.retry_of = candidate.retry_of.clone();
        task.status = TaskStatus::Pending;

        for commit in &task.commits {
            self.by_commit.insert(commit.clone(), id.clone());
        }

        if let Some(pred_id) = &candidate.stealing_from_id {
            match self.get_task(pred_id).cloned() {
                Some(mut pred) => {
                    pred.commits.retain(|c| !candidate.commits.contains(c));
                    self.tasks.insert(pred.id.clone(), pred);
                }
                None => tracing::warn!(
                    "candidate {} steals from unknown task {pred_id}",
                    candidate.name()
                ),
            }
        }

        self.tasks.insert(id, task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use conveyor_lib::repo::RepoState;
    use conveyor_lib::specs::TaskSpec;
    use conveyor_lib::task::TaskKey;

    const REPO: &str = "repo";

    fn cached_task(id: &str, revision: &str, commits: &[&str]) -> Task {
        let mut task = Task::new(
            id,
            TaskKey::new(RepoState::new(REPO, revision), "Build"),
            Utc::now(),
        );
        task.commits = commits.iter().map(|c| c.to_string()).collect();
        task
    }

    fn candidate_at(revision: &str, commits: &[&str], steal: Option<&str>) -> Candidate {
        let mut candidate = Candidate::new(
            TaskKey::new(RepoState::new(REPO, revision), "Build"),
            Arc::new(TaskSpec::default()),
        );
        candidate.commits = commits.iter().map(|c| c.to_string()).collect();
        candidate.stealing_from_id = steal.map(String::from);
        candidate
    }

    #[test]
    fn test_overlay_does_not_touch_snapshot() {
        let snapshot = Arc::new(TaskCacheSnapshot::from_tasks(vec![cached_task(
            "1",
            "c3",
            &["c3", "c2", "c1", "c0"],
        )]));
        let mut view = GroupView::new(REPO, "Build", snapshot.clone());

        let candidate = candidate_at("c1", &["c1", "c0"], Some("1"));
        view.commit_candidate(&candidate);

        // The view sees the steal and the synthetic task...
        assert_eq!(view.get_task("1").unwrap().commits, vec!["c3", "c2"]);
        assert_eq!(view.task_for_commit("c0").unwrap().id, candidate.id());
        assert_eq!(view.task_for_commit("c3").unwrap().id, "1");
        // ...while the snapshot is untouched.
        assert_eq!(snapshot.get("1").unwrap().commits.len(), 4);
        assert_eq!(snapshot.task_for_commit(REPO, "Build", "c0").unwrap().id, "1");
    }

    #[test]
    fn test_known_task_name_via_synthetic() {
        let snapshot = Arc::new(TaskCacheSnapshot::from_tasks(vec![]));
        let mut view = GroupView::new(REPO, "Build", snapshot);
        assert!(!view.known_task_name());
        view.commit_candidate(&candidate_at("c0", &["c0"], None));
        assert!(view.known_task_name());
    }
}
