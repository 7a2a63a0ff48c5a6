use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use conveyor_lib::{
    job::Job,
    task::{Task, TaskKey},
};

use crate::{ensure, Store, StoreError, StoreResult};

/// In-memory store. The backing maps are BTreeMaps keyed by id so windowed
/// iteration and "newest first" scans stay deterministic.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: Mutex<InMemoryDb>,
}

#[derive(Debug, Default)]
struct InMemoryDb {
    tasks: BTreeMap<String, Task>,
    jobs: BTreeMap<String, Job>,
    by_worker_id: HashMap<String, String>,
    next_id: u64,
    fail_next_put_tasks: bool,
}

impl InMemoryDb {
    fn assign_id(&mut self) -> String {
        self.next_id += 1;
        // Zero-padded so lexicographic order equals assignment order.
        format!("{:016}", self.next_id)
    }

    fn put_tasks(&mut self, tasks: &[Task]) -> StoreResult<()> {
        if self.fail_next_put_tasks {
            self.fail_next_put_tasks = false;
            return Err(StoreError::Backend("scripted put_tasks failure".to_string()));
        }
        // Validate the whole batch before touching the maps so the write
        // stays atomic.
        for task in tasks {
            ensure(!task.id.is_empty(), "task id must be assigned before put")?;
            ensure(task.key.repo_state.valid(), "task key has an invalid repo state")?;
        }
        for task in tasks {
            if !task.worker_task_id.is_empty() {
                self.by_worker_id
                    .insert(task.worker_task_id.clone(), task.id.clone());
            }
            self.tasks.insert(task.id.clone(), task.clone());
        }
        Ok(())
    }

    fn put_jobs(&mut self, jobs: &[Job]) -> StoreResult<()> {
        for job in jobs {
            ensure(!job.id.is_empty(), "job id must be assigned before put")?;
        }
        for job in jobs {
            self.jobs.insert(job.id.clone(), job.clone());
        }
        Ok(())
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `put_tasks` call fail, for drain-abort tests.
    pub fn fail_next_put_tasks(&self) {
        self.inner.lock().unwrap().fail_next_put_tasks = true;
    }

    pub fn task_count(&self) -> usize {
        self.inner.lock().unwrap().tasks.len()
    }
}

#[async_trait::async_trait]
impl Store for InMemoryStore {
    async fn assign_id(&self) -> StoreResult<String> {
        Ok(self.inner.lock().unwrap().assign_id())
    }

    async fn put_tasks(&self, tasks: &[Task]) -> StoreResult<()> {
        self.inner.lock().unwrap().put_tasks(tasks)
    }

    async fn put_jobs(&self, jobs: &[Job]) -> StoreResult<()> {
        self.inner.lock().unwrap().put_jobs(jobs)
    }

    async fn get_task(&self, id: &str) -> StoreResult<Option<Task>> {
        Ok(self.inner.lock().unwrap().tasks.get(id).cloned())
    }

    async fn get_job(&self, id: &str) -> StoreResult<Option<Job>> {
        Ok(self.inner.lock().unwrap().jobs.get(id).cloned())
    }

    async fn get_task_by_worker_id(&self, worker_task_id: &str) -> StoreResult<Option<Task>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .by_worker_id
            .get(worker_task_id)
            .and_then(|id| inner.tasks.get(id))
            .cloned())
    }

    async fn get_tasks_by_key(&self, key: &TaskKey) -> StoreResult<Vec<Task>> {
        let inner = self.inner.lock().unwrap();
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| &t.key == key)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created.cmp(&b.created).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    async fn get_task_for_commit(
        &self,
        repo: &str,
        revision: &str,
        name: &str,
    ) -> StoreResult<Option<Task>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .tasks
            .values()
            .filter(|t| {
                t.repo() == repo && t.name() == name && t.commits.iter().any(|c| c == revision)
            })
            .max_by(|a, b| a.created.cmp(&b.created).then(a.id.cmp(&b.id)))
            .cloned())
    }

    async fn get_tasks_in_window(&self, start: DateTime<Utc>) -> StoreResult<Vec<Task>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .tasks
            .values()
            .filter(|t| t.created >= start)
            .cloned()
            .collect())
    }

    async fn get_jobs_in_window(&self, start: DateTime<Utc>) -> StoreResult<Vec<Job>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .jobs
            .values()
            .filter(|j| j.created >= start)
            .cloned()
            .collect())
    }

    async fn unfinished_tasks(&self) -> StoreResult<Vec<Task>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .tasks
            .values()
            .filter(|t| !t.done())
            .cloned()
            .collect())
    }

    async fn unfinished_jobs(&self) -> StoreResult<Vec<Job>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .jobs
            .values()
            .filter(|j| !j.done())
            .cloned()
            .collect())
    }
}
