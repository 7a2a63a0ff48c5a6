use conveyor_lib::{
    graph::{CommitGraph, Walk},
    task::Task,
    window::Window,
};

use crate::{view::GroupView, SchedulerResult};

/// Hard cap on blamelist size. A walk that would exceed it falls back to
/// covering only the revision itself (or nothing off-head).
pub(crate) const MAX_BLAMELIST_COMMITS: usize = 500;

#[derive(Debug, Clone, Default)]
pub(crate) struct Blamelist {
    pub commits: Vec<String>,
    pub steal_from: Option<Task>,
}

/// Compute the set of commits for which a run of this group's task at
/// `revision` would be the newest data point, plus the prior task it steals
/// from, if any.
///
/// Walks the commit DAG backward from `revision`:
/// - first-ever run of the task name: just the revision when it is a branch
///   head, else nothing;
/// - a prior task at the same revision: a retry, taking over the prior's
///   whole blamelist;
/// - otherwise bisect/extension: accumulate until hitting a commit owned by
///   a prior task other than the tracked steal target, the end of history,
///   the edge of the scheduling window, or the size cap.
pub(crate) fn compute(
    view: &GroupView,
    graph: &CommitGraph,
    window: &Window,
    revision: &str,
) -> SchedulerResult<Blamelist> {
    if !view.known_task_name() {
        if graph.is_branch_head(revision) {
            return Ok(Blamelist {
                commits: vec![revision.to_string()],
                steal_from: None,
            });
        }
        return Ok(Blamelist::default());
    }

    // A walk starting outside the window covers nothing.
    if !window.test_commit_hash(graph, revision) {
        return Ok(Blamelist::default());
    }

    let repo = graph.repo();
    let mut commits: Vec<String> = Vec::new();
    let mut steal_from: Option<Task> = None;
    let mut retry = false;
    let mut overflowed = false;

    graph.recurse(revision, |commit| {
        if !window.test_commit(repo, commit) {
            return Walk::StopBranch;
        }
        if let Some(prev) = view.task_for_commit(&commit.hash) {
            if commit.hash == revision && prev.revision() == revision {
                // Zeroth step of the walk hit a prior task at the same
                // revision: this is a retry.
                steal_from = Some(prev.clone());
                retry = true;
                return Walk::Done;
            }
            if let Some(tracked) = &steal_from {
                if tracked.id != prev.id {
                    return Walk::StopBranch;
                }
            } else {
                steal_from = Some(prev.clone());
            }
        }
        commits.push(commit.hash.clone());
        if commits.len() > MAX_BLAMELIST_COMMITS {
            overflowed = true;
            return Walk::Done;
        }
        Walk::Continue
    })?;

    if retry {
        let prior = steal_from.expect("retry implies a prior task");
        return Ok(Blamelist {
            commits: prior.commits.clone(),
            steal_from: Some(prior),
        });
    }

    if overflowed {
        tracing::debug!(
            "blamelist for {} at {revision} overflowed {MAX_BLAMELIST_COMMITS} commits",
            repo
        );
        if graph.is_branch_head(revision) {
            return Ok(Blamelist {
                commits: vec![revision.to_string()],
                steal_from: None,
            });
        }
        return Ok(Blamelist::default());
    }

    if !commits.is_empty() && !commits.iter().any(|c| c == revision) {
        // Should be impossible: the walk starts at the revision. Keep the
        // candidate alive but make the violation visible.
        tracing::error!("blamelist for {repo}@{revision} does not contain its own revision");
    }

    Ok(Blamelist {
        commits,
        steal_from,
    })
}
