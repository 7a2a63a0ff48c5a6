mod cache;
mod mem;

pub use cache::{JobCache, JobCacheSnapshot, TaskCache, TaskCacheSnapshot};
pub use mem::InMemoryStore;

use chrono::{DateTime, Utc};
use thiserror::Error as ThisError;

use conveyor_lib::{
    job::Job,
    task::{Task, TaskKey},
};

#[derive(ThisError, Debug)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflicting write: {0}")]
    Conflict(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

pub(crate) fn ensure(expression: bool, message: &str) -> StoreResult<()> {
    if !expression {
        return Err(StoreError::Backend(message.to_string()));
    }
    Ok(())
}

/// The persistence layer for jobs and tasks. Implementations must make
/// `put_tasks`/`put_jobs` atomic per call: either the whole batch is
/// visible afterwards or none of it is.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    /// Assign a fresh persistent id. Ids are strictly increasing, so a
    /// successor's id always compares newer than its predecessors'.
    async fn assign_id(&self) -> StoreResult<String>;

    async fn put_tasks(&self, tasks: &[Task]) -> StoreResult<()>;

    async fn put_jobs(&self, jobs: &[Job]) -> StoreResult<()>;

    async fn get_task(&self, id: &str) -> StoreResult<Option<Task>>;

    async fn get_job(&self, id: &str) -> StoreResult<Option<Job>>;

    async fn get_task_by_worker_id(&self, worker_task_id: &str) -> StoreResult<Option<Task>>;

    /// All tasks with the given key, sorted by creation time.
    async fn get_tasks_by_key(&self, key: &TaskKey) -> StoreResult<Vec<Task>>;

    /// The most recently created task of the named spec whose blamelist
    /// contains the commit.
    async fn get_task_for_commit(
        &self,
        repo: &str,
        revision: &str,
        name: &str,
    ) -> StoreResult<Option<Task>>;

    /// All tasks created at or after `start`, across repos.
    async fn get_tasks_in_window(&self, start: DateTime<Utc>) -> StoreResult<Vec<Task>>;

    async fn get_jobs_in_window(&self, start: DateTime<Utc>) -> StoreResult<Vec<Job>>;

    async fn unfinished_tasks(&self) -> StoreResult<Vec<Task>>;

    async fn unfinished_jobs(&self) -> StoreResult<Vec<Job>>;
}
