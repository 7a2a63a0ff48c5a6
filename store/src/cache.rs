use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use conveyor_lib::{
    job::Job,
    task::{Task, TaskKey},
};

use crate::{Store, StoreResult};

/// An immutable view over the tasks inside the scheduling window plus all
/// unfinished tasks. The cache writer builds a fresh snapshot and swaps the
/// pointer; readers hold their Arc for the duration of a computation.
#[derive(Debug, Default)]
pub struct TaskCacheSnapshot {
    tasks: HashMap<String, Task>,
    by_key: HashMap<TaskKey, Vec<String>>,
    /// (repo, task name) -> commit -> id of the newest task covering it.
    by_commit: HashMap<(String, String), HashMap<String, String>>,
    known_names: HashMap<String, HashSet<String>>,
    unfinished: Vec<String>,
}

impl TaskCacheSnapshot {
    pub fn from_tasks(mut tasks: Vec<Task>) -> Self {
        // Oldest first, so newer tasks overwrite commit ownership.
        tasks.sort_by(|a, b| a.created.cmp(&b.created).then(a.id.cmp(&b.id)));

        let mut snapshot = TaskCacheSnapshot::default();
        for task in tasks {
            snapshot
                .by_key
                .entry(task.key.clone())
                .or_default()
                .push(task.id.clone());
            snapshot
                .known_names
                .entry(task.repo().to_string())
                .or_default()
                .insert(task.name().to_string());
            let commits = snapshot
                .by_commit
                .entry((task.repo().to_string(), task.name().to_string()))
                .or_default();
            for commit in &task.commits {
                commits.insert(commit.clone(), task.id.clone());
            }
            if !task.done() {
                snapshot.unfinished.push(task.id.clone());
            }
            snapshot.tasks.insert(task.id.clone(), task);
        }
        snapshot
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// All cached tasks with the given key, oldest first.
    pub fn tasks_by_key(&self, key: &TaskKey) -> Vec<&Task> {
        self.by_key
            .get(key)
            .map(|ids| ids.iter().filter_map(|id| self.tasks.get(id)).collect())
            .unwrap_or_default()
    }

    /// The newest task of the named spec whose blamelist covers the commit.
    pub fn task_for_commit(&self, repo: &str, name: &str, commit: &str) -> Option<&Task> {
        self.by_commit
            .get(&(repo.to_string(), name.to_string()))
            .and_then(|commits| commits.get(commit))
            .and_then(|id| self.tasks.get(id))
    }

    /// Whether any task of the named spec has ever run in the repo, within
    /// the cache window.
    pub fn known_task_name(&self, repo: &str, name: &str) -> bool {
        self.known_names
            .get(repo)
            .is_some_and(|names| names.contains(name))
    }

    pub fn unfinished(&self) -> Vec<&Task> {
        self.unfinished
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .collect()
    }
}

/// Windowed task cache. Single writer (the main loop, via [`update`]);
/// readers take a snapshot.
pub struct TaskCache {
    store: Arc<dyn Store>,
    snapshot: RwLock<Arc<TaskCacheSnapshot>>,
}

impl TaskCache {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            snapshot: RwLock::new(Arc::new(TaskCacheSnapshot::default())),
        }
    }

    /// Reload from the store: everything inside the window plus unfinished
    /// tasks that predate it, then atomically publish the new snapshot.
    pub async fn update(&self, window_start: DateTime<Utc>) -> StoreResult<()> {
        let mut tasks = self.store.get_tasks_in_window(window_start).await?;
        let mut seen: HashSet<String> = tasks.iter().map(|t| t.id.clone()).collect();
        for task in self.store.unfinished_tasks().await? {
            if seen.insert(task.id.clone()) {
                tasks.push(task);
            }
        }
        let snapshot = Arc::new(TaskCacheSnapshot::from_tasks(tasks));
        *self.snapshot.write().expect("task cache lock poisoned") = snapshot;
        Ok(())
    }

    pub fn snapshot(&self) -> Arc<TaskCacheSnapshot> {
        self.snapshot
            .read()
            .expect("task cache lock poisoned")
            .clone()
    }
}

/// An immutable view over jobs in the window plus all unfinished jobs.
#[derive(Debug, Default)]
pub struct JobCacheSnapshot {
    jobs: HashMap<String, Job>,
    unfinished: Vec<String>,
}

impl JobCacheSnapshot {
    pub fn from_jobs(jobs: Vec<Job>) -> Self {
        let mut snapshot = JobCacheSnapshot::default();
        for job in jobs {
            if !job.done() {
                snapshot.unfinished.push(job.id.clone());
            }
            snapshot.jobs.insert(job.id.clone(), job);
        }
        snapshot.unfinished.sort();
        snapshot
    }

    pub fn get(&self, id: &str) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn unfinished(&self) -> Vec<&Job> {
        self.unfinished
            .iter()
            .filter_map(|id| self.jobs.get(id))
            .collect()
    }
}

/// Windowed job cache with the same snapshot discipline as [`TaskCache`].
pub struct JobCache {
    store: Arc<dyn Store>,
    snapshot: RwLock<Arc<JobCacheSnapshot>>,
}

impl JobCache {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            snapshot: RwLock::new(Arc::new(JobCacheSnapshot::default())),
        }
    }

    pub async fn update(&self, window_start: DateTime<Utc>) -> StoreResult<()> {
        let mut jobs = self.store.get_jobs_in_window(window_start).await?;
        let mut seen: HashSet<String> = jobs.iter().map(|j| j.id.clone()).collect();
        for job in self.store.unfinished_jobs().await? {
            if seen.insert(job.id.clone()) {
                jobs.push(job);
            }
        }
        let snapshot = Arc::new(JobCacheSnapshot::from_jobs(jobs));
        *self.snapshot.write().expect("job cache lock poisoned") = snapshot;
        Ok(())
    }

    pub fn snapshot(&self) -> Arc<JobCacheSnapshot> {
        self.snapshot
            .read()
            .expect("job cache lock poisoned")
            .clone()
    }
}
