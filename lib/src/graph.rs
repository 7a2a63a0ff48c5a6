use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{LibError, LibResult};

/// A single commit in a repository DAG.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize)]
pub struct Commit {
    pub hash: String,
    pub parents: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// A consistent snapshot of a repository as seen by the commit source:
/// the full set of commits plus the current branch heads.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize, Default)]
pub struct RepoSnapshot {
    pub commits: Vec<Commit>,
    /// branch name -> head commit hash
    pub branch_heads: HashMap<String, String>,
}

/// Source of commit data for a set of repositories. Read-only to the
/// scheduler core; refreshed once per loop iteration.
#[async_trait::async_trait]
pub trait CommitSource: Send + Sync {
    async fn fetch(&self, repo: &str) -> LibResult<RepoSnapshot>;
}

/// A fixed in-memory commit source, used for tests and file-backed adapters.
#[derive(Debug, Default)]
pub struct StaticCommitSource {
    snapshots: HashMap<String, RepoSnapshot>,
}

impl StaticCommitSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, repo: impl Into<String>, snapshot: RepoSnapshot) {
        self.snapshots.insert(repo.into(), snapshot);
    }
}

#[async_trait::async_trait]
impl CommitSource for StaticCommitSource {
    async fn fetch(&self, repo: &str) -> LibResult<RepoSnapshot> {
        self.snapshots
            .get(repo)
            .cloned()
            .ok_or_else(|| LibError::UnknownRepo(repo.to_string()))
    }
}

/// Control flow for [`CommitGraph::recurse`].
pub enum Walk {
    /// Keep going into this commit's parents.
    Continue,
    /// Do not recurse into this commit's parents; keep walking siblings.
    StopBranch,
    /// Abort the whole walk.
    Done,
}

/// Per-repository commit DAG with branch heads. Rebuilt incrementally from
/// [`RepoSnapshot`]s; duplicate hashes are ignored on re-apply.
#[derive(Debug, Clone)]
pub struct CommitGraph {
    repo: String,
    commits: HashMap<String, Commit>,
    branch_heads: HashMap<String, String>,
}

impl CommitGraph {
    pub fn new(repo: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            commits: HashMap::new(),
            branch_heads: HashMap::new(),
        }
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    pub fn len(&self) -> usize {
        self.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    pub fn get(&self, hash: &str) -> Option<&Commit> {
        self.commits.get(hash)
    }

    pub fn branch_heads(&self) -> &HashMap<String, String> {
        &self.branch_heads
    }

    pub fn is_branch_head(&self, hash: &str) -> bool {
        self.branch_heads.values().any(|h| h == hash)
    }

    /// Apply a snapshot, returning the hashes that were not previously known,
    /// in commit-timestamp order (oldest first).
    pub fn apply(&mut self, snapshot: RepoSnapshot) -> Vec<String> {
        let mut added = Vec::new();
        for commit in snapshot.commits {
            if !self.commits.contains_key(&commit.hash) {
                added.push(commit.clone());
                self.commits.insert(commit.hash.clone(), commit);
            }
        }
        self.branch_heads = snapshot.branch_heads;
        added.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.hash.cmp(&b.hash)));
        added.into_iter().map(|c| c.hash).collect()
    }

    /// The timestamp of the Nth-newest commit, if at least N commits exist.
    pub fn nth_newest_timestamp(&self, n: usize) -> Option<DateTime<Utc>> {
        if n == 0 || self.commits.len() < n {
            return None;
        }
        let mut timestamps: Vec<DateTime<Utc>> =
            self.commits.values().map(|c| c.timestamp).collect();
        timestamps.sort_unstable_by(|a, b| b.cmp(a));
        timestamps.get(n - 1).copied()
    }

    /// Depth-first walk from `from` following parent links. Each commit is
    /// visited at most once; joins in the DAG are deduplicated. The visitor
    /// steers the walk via [`Walk`].
    pub fn recurse<F>(&self, from: &str, mut visit: F) -> LibResult<()>
    where
        F: FnMut(&Commit) -> Walk,
    {
        let start = self.get(from).ok_or_else(|| LibError::UnknownCommit {
            repo: self.repo.clone(),
            commit: from.to_string(),
        })?;

        let mut stack: Vec<&Commit> = vec![start];
        let mut visited: HashSet<&str> = HashSet::new();
        while let Some(commit) = stack.pop() {
            if !visited.insert(commit.hash.as_str()) {
                continue;
            }
            match visit(commit) {
                Walk::Done => return Ok(()),
                Walk::StopBranch => continue,
                Walk::Continue => {}
            }
            for parent in &commit.parents {
                match self.get(parent) {
                    Some(p) => stack.push(p),
                    // The source may truncate history; treat a missing parent
                    // like a root.
                    None => tracing::debug!(
                        "commit {} lists unknown parent {} in {}",
                        commit.hash,
                        parent,
                        self.repo
                    ),
                }
            }
        }
        Ok(())
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod test_util {
    use super::*;
    use chrono::TimeZone;

    /// Build a linear chain `c0 <- c1 <- ... <- c{n-1}` with one-minute
    /// spacing, `c{n-1}` being the head of `main`.
    pub fn linear_graph(repo: &str, n: usize) -> CommitGraph {
        let mut graph = CommitGraph::new(repo);
        let base = Utc.with_ymd_and_hms(2024, 4, 1, 12, 0, 0).unwrap();
        let commits = (0..n)
            .map(|i| Commit {
                hash: format!("c{i}"),
                parents: if i == 0 {
                    vec![]
                } else {
                    vec![format!("c{}", i - 1)]
                },
                timestamp: base + chrono::Duration::minutes(i as i64),
            })
            .collect();
        let mut branch_heads = HashMap::new();
        branch_heads.insert("main".to_string(), format!("c{}", n - 1));
        graph.apply(RepoSnapshot {
            commits,
            branch_heads,
        });
        graph
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::linear_graph;
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_apply_returns_new_hashes_once() {
        let mut graph = CommitGraph::new("repo");
        let base = Utc.with_ymd_and_hms(2024, 4, 1, 12, 0, 0).unwrap();
        let snapshot = RepoSnapshot {
            commits: vec![
                Commit {
                    hash: "a".to_string(),
                    parents: vec![],
                    timestamp: base,
                },
                Commit {
                    hash: "b".to_string(),
                    parents: vec!["a".to_string()],
                    timestamp: base + chrono::Duration::minutes(1),
                },
            ],
            branch_heads: HashMap::from([("main".to_string(), "b".to_string())]),
        };
        assert_eq!(graph.apply(snapshot.clone()), vec!["a", "b"]);
        assert_eq!(graph.apply(snapshot), Vec::<String>::new());
        assert!(graph.is_branch_head("b"));
        assert!(!graph.is_branch_head("a"));
    }

    #[test]
    fn test_recurse_dedups_dag_joins() {
        // a <- b, a <- c, {b, c} <- d
        let mut graph = CommitGraph::new("repo");
        let base = Utc.with_ymd_and_hms(2024, 4, 1, 12, 0, 0).unwrap();
        let commits = vec![
            Commit {
                hash: "a".to_string(),
                parents: vec![],
                timestamp: base,
            },
            Commit {
                hash: "b".to_string(),
                parents: vec!["a".to_string()],
                timestamp: base + chrono::Duration::minutes(1),
            },
            Commit {
                hash: "c".to_string(),
                parents: vec!["a".to_string()],
                timestamp: base + chrono::Duration::minutes(2),
            },
            Commit {
                hash: "d".to_string(),
                parents: vec!["b".to_string(), "c".to_string()],
                timestamp: base + chrono::Duration::minutes(3),
            },
        ];
        graph.apply(RepoSnapshot {
            commits,
            branch_heads: HashMap::from([("main".to_string(), "d".to_string())]),
        });

        let mut seen = Vec::new();
        graph
            .recurse("d", |c| {
                seen.push(c.hash.clone());
                Walk::Continue
            })
            .unwrap();
        seen.sort();
        assert_eq!(seen, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_recurse_stop_branch() {
        let graph = linear_graph("repo", 5);
        let mut seen = Vec::new();
        graph
            .recurse("c4", |c| {
                seen.push(c.hash.clone());
                if c.hash == "c2" {
                    Walk::StopBranch
                } else {
                    Walk::Continue
                }
            })
            .unwrap();
        assert_eq!(seen, vec!["c4", "c3", "c2"]);
    }

    #[test]
    fn test_nth_newest_timestamp() {
        let graph = linear_graph("repo", 3);
        let newest = graph.nth_newest_timestamp(1).unwrap();
        let oldest = graph.nth_newest_timestamp(3).unwrap();
        assert!(newest > oldest);
        assert_eq!(graph.nth_newest_timestamp(4), None);
        assert_eq!(graph.nth_newest_timestamp(0), None);
    }
}
