use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::repo::RepoState;

/// The status of a job. Monotone until terminal: a job moves from
/// `InProgress` to exactly one of the done states.
#[derive(
    PartialEq, Debug, Clone, Copy, Deserialize, Serialize, Eq, PartialOrd, Ord, Hash, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    InProgress,
    Success,
    Failure,
    Mishap,
    Canceled,
}

impl JobStatus {
    pub fn is_done(&self) -> bool {
        !matches!(self, JobStatus::InProgress)
    }

    /// Severity used to combine per-task outcomes into a job outcome;
    /// higher is worse.
    fn severity(&self) -> i32 {
        match self {
            JobStatus::Success => 0,
            JobStatus::InProgress => 1,
            JobStatus::Canceled => 2,
            JobStatus::Failure => 3,
            JobStatus::Mishap => 4,
        }
    }

    pub fn worst(self, other: JobStatus) -> JobStatus {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

impl FromIterator<JobStatus> for JobStatus {
    fn from_iter<T: IntoIterator<Item = JobStatus>>(iter: T) -> Self {
        iter.into_iter()
            .fold(JobStatus::Success, JobStatus::worst)
    }
}

/// A job: a request to bring a set of task specs to completion at one repo
/// state. Jobs are created for new commits, for periodic triggers, for
/// try-job patches, and manually (forced).
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct Job {
    pub id: String,
    /// The job-spec name.
    pub name: String,
    pub repo_state: RepoState,
    pub created: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
    /// Transitive closure of task-spec names this job needs, sorted.
    pub dependencies: Vec<String>,
    pub status: JobStatus,
    /// Manually requested; tasks for this job are keyed by the job id so
    /// they never dedup against regular runs.
    pub is_force: bool,
}

impl Job {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        repo_state: RepoState,
        dependencies: Vec<String>,
        created: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            repo_state,
            created,
            finished: None,
            dependencies,
            status: JobStatus::InProgress,
            is_force: false,
        }
    }

    pub fn done(&self) -> bool {
        self.status.is_done()
    }

    pub fn is_try_job(&self) -> bool {
        self.repo_state.is_try_job()
    }
}
