use chrono::{DateTime, Utc};
use conveyor_lib::task::TaskStatus;
use derive_getters::Getters;
use serde::{Deserialize, Serialize};

use crate::{request::TriggerRequest, PoolResult};

/// One dimension a bot provides: a key with one or more values.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize)]
pub struct Dimension {
    pub key: String,
    pub values: Vec<String>,
}

/// A bot as reported by the worker pool.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct BotInfo {
    pub id: String,
    pub dimensions: Vec<Dimension>,
    pub is_dead: bool,
    pub quarantined: bool,
    /// The pool task currently running on the bot, empty when idle.
    pub task_id: String,
}

impl BotInfo {
    pub fn is_free(&self) -> bool {
        !self.is_dead && !self.quarantined && self.task_id.is_empty()
    }
}

/// The state of a task as reported by the worker pool.
#[derive(PartialEq, Debug, Clone, Copy, Deserialize, Serialize, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PoolTaskState {
    Pending,
    Running,
    Completed,
    Expired,
    TimedOut,
    BotDied,
    Canceled,
    Killed,
    NoResource,
}

/// The status of one pool task, as returned by status queries.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize)]
pub struct PoolTaskResult {
    pub id: String,
    pub state: PoolTaskState,
    /// Set when the task completed with a non-zero exit.
    #[serde(default)]
    pub failure: bool,
    #[serde(default)]
    pub started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed: Option<DateTime<Utc>>,
    /// Digest of the isolated outputs, when the task produced any.
    #[serde(default)]
    pub output_digest: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl PoolTaskResult {
    /// Map the pool's view of the task onto the scheduler's task status.
    pub fn task_status(&self) -> TaskStatus {
        match self.state {
            PoolTaskState::Pending => TaskStatus::Pending,
            PoolTaskState::Running => TaskStatus::Running,
            PoolTaskState::Completed => {
                if self.failure {
                    TaskStatus::Failure
                } else {
                    TaskStatus::Success
                }
            }
            PoolTaskState::Expired
            | PoolTaskState::TimedOut
            | PoolTaskState::BotDied
            | PoolTaskState::Canceled
            | PoolTaskState::Killed
            | PoolTaskState::NoResource => TaskStatus::Mishap,
        }
    }
}

/// Response to a successful trigger: the pool-assigned task id and the
/// pool-recorded creation timestamp.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize, Getters)]
pub struct TriggerResponse {
    task_id: String,
    created: DateTime<Utc>,
}

impl TriggerResponse {
    pub fn new(task_id: impl Into<String>, created: DateTime<Utc>) -> Self {
        Self {
            task_id: task_id.into(),
            created,
        }
    }
}

/// Client for the worker pool RPC surface. The scheduler only consumes this
/// trait; concrete transports live behind it.
#[async_trait::async_trait]
pub trait PoolClient: Send + Sync {
    /// List all bots in the named pool, free or not.
    async fn list_bots(&self, pool: &str) -> PoolResult<Vec<BotInfo>>;

    /// Trigger a task; returns the pool task id and creation time.
    async fn trigger_task(&self, req: &TriggerRequest) -> PoolResult<TriggerResponse>;

    /// Status of a single pool task.
    async fn get_task_status(&self, task_id: &str) -> PoolResult<PoolTaskResult>;

    /// Bulk status query by time range and tags.
    async fn list_tasks(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        tags: &[String],
    ) -> PoolResult<Vec<PoolTaskResult>>;
}
