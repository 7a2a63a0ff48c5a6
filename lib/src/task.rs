use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::repo::RepoState;

/// The status of a triggered task.
#[derive(
    PartialEq, Debug, Clone, Copy, Deserialize, Serialize, Eq, PartialOrd, Ord, Hash, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Triggered on the worker pool but not yet picked up by a bot.
    Pending,
    /// Picked up by a bot and executing.
    Running,
    /// Finished and succeeded.
    Success,
    /// Finished and failed on its own account.
    Failure,
    /// Finished due to an infrastructure problem (expired, bot died, ...).
    Mishap,
}

impl TaskStatus {
    pub fn is_done(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failure | TaskStatus::Mishap)
    }

    pub fn success(&self) -> bool {
        matches!(self, TaskStatus::Success)
    }
}

impl From<TaskStatus> for i32 {
    fn from(status: TaskStatus) -> i32 {
        match status {
            TaskStatus::Success => 0,
            TaskStatus::Pending => 1000,
            TaskStatus::Running => 2000,
            TaskStatus::Failure => -1000,
            TaskStatus::Mishap => -2000,
        }
    }
}

/// Uniquely identifies a task candidate: the repo state under test, the
/// task-spec name, and (for manually requested runs) the forcing job id.
#[derive(
    PartialEq, Debug, Clone, Deserialize, Serialize, Eq, PartialOrd, Ord, Hash, ToSchema, Default,
)]
pub struct TaskKey {
    pub repo_state: RepoState,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forced_job_id: Option<String>,
}

impl TaskKey {
    pub fn new(repo_state: RepoState, name: impl Into<String>) -> Self {
        Self {
            repo_state,
            name: name.into(),
            forced_job_id: None,
        }
    }

    pub fn forced(repo_state: RepoState, name: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self {
            repo_state,
            name: name.into(),
            forced_job_id: Some(job_id.into()),
        }
    }

    /// The same key with a different task-spec name; used to look up
    /// dependency tasks.
    pub fn with_name(&self, name: impl Into<String>) -> Self {
        Self {
            repo_state: self.repo_state.clone(),
            name: name.into(),
            forced_job_id: self.forced_job_id.clone(),
        }
    }

    pub fn is_try_job(&self) -> bool {
        self.repo_state.is_try_job()
    }

    pub fn is_forced(&self) -> bool {
        self.forced_job_id.is_some()
    }
}

/// A task as persisted in the store: one attempt of one task spec at one
/// repo state, carrying the blamelist of commits it is the newest data
/// point for.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct Task {
    pub id: String,
    pub key: TaskKey,
    /// Attempt number, starting at 0.
    pub attempt: u32,
    /// The blamelist: commit hashes attributed to this run. Mutated at most
    /// once, when a successor steals commits.
    pub commits: Vec<String>,
    pub created: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    /// Id of the failed predecessor this task retries, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<String>,
    /// Ids of the dependency tasks whose outputs this task consumes.
    pub parent_task_ids: Vec<String>,
    /// Digest of the isolated inputs uploaded for this task.
    pub isolated_input: String,
    /// Digest of the isolated outputs, set on success.
    pub isolated_output: String,
    /// The task id assigned by the worker pool.
    pub worker_task_id: String,
    /// Ids of the jobs this task belongs to.
    pub jobs: Vec<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, key: TaskKey, created: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            key,
            attempt: 0,
            commits: Vec::new(),
            created,
            started: None,
            finished: None,
            status: TaskStatus::Pending,
            retry_of: None,
            parent_task_ids: Vec::new(),
            isolated_input: String::new(),
            isolated_output: String::new(),
            worker_task_id: String::new(),
            jobs: Vec::new(),
        }
    }

    pub fn done(&self) -> bool {
        self.status.is_done()
    }

    pub fn repo(&self) -> &str {
        &self.key.repo_state.repo
    }

    pub fn revision(&self) -> &str {
        &self.key.repo_state.revision
    }

    pub fn name(&self) -> &str {
        &self.key.name
    }
}
