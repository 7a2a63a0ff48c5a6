use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::graph::{Commit, CommitGraph};

/// The rolling scheduling window: per repo, the earliest point in time for
/// which commits and jobs are eligible for scheduling. A commit is inside
/// the window if it is newer than `now - duration` OR among the newest
/// `num_commits` commits of its repo, whichever reaches further back.
#[derive(Debug, Clone)]
pub struct Window {
    duration: Duration,
    num_commits: usize,
    start_times: HashMap<String, DateTime<Utc>>,
    default_start: DateTime<Utc>,
}

impl Window {
    pub fn new(duration: Duration, num_commits: usize) -> Self {
        let now = Utc::now();
        Self {
            duration,
            num_commits,
            start_times: HashMap::new(),
            default_start: now - duration,
        }
    }

    /// Recompute the per-repo start times from the current commit graphs.
    pub fn update<G: std::borrow::Borrow<CommitGraph>>(
        &mut self,
        now: DateTime<Utc>,
        graphs: &HashMap<String, G>,
    ) {
        self.default_start = now - self.duration;
        self.start_times = graphs
            .iter()
            .map(|(repo, graph)| {
                let graph = graph.borrow();
                let mut start = self.default_start;
                if let Some(nth) = graph.nth_newest_timestamp(self.num_commits) {
                    if nth < start {
                        start = nth;
                    }
                }
                (repo.clone(), start)
            })
            .collect();
    }

    /// The earliest eligible timestamp for the repo.
    pub fn start(&self, repo: &str) -> DateTime<Utc> {
        self.start_times.get(repo).copied().unwrap_or(self.default_start)
    }

    /// The earliest eligible timestamp across all repos; used to bound
    /// store reads.
    pub fn earliest_start(&self) -> DateTime<Utc> {
        self.start_times
            .values()
            .copied()
            .min()
            .unwrap_or(self.default_start)
    }

    pub fn test_time(&self, repo: &str, ts: DateTime<Utc>) -> bool {
        ts >= self.start(repo)
    }

    pub fn test_commit(&self, repo: &str, commit: &Commit) -> bool {
        self.test_time(repo, commit.timestamp)
    }

    /// Test a commit by hash; unknown hashes are outside the window.
    pub fn test_commit_hash(&self, graph: &CommitGraph, hash: &str) -> bool {
        graph
            .get(hash)
            .is_some_and(|c| self.test_time(graph.repo(), c.timestamp))
    }
}
