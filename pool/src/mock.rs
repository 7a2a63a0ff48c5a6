use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::{
    client::{BotInfo, Dimension, PoolClient, PoolTaskResult, PoolTaskState, TriggerResponse},
    request::TriggerRequest,
    PoolError, PoolResult,
};

/// A scripted worker pool for tests: bots and task results are set up front,
/// triggers are recorded, and individual triggers can be made to fail.
#[derive(Debug, Default)]
pub struct MockPoolClient {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    bots: HashMap<String, Vec<BotInfo>>,
    results: HashMap<String, PoolTaskResult>,
    triggered: Vec<TriggerRequest>,
    fail_triggers: Vec<String>,
    next_task_num: u64,
}

impl MockPoolClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_bots(&self, pool: impl Into<String>, bots: Vec<BotInfo>) {
        self.inner.lock().unwrap().bots.insert(pool.into(), bots);
    }

    pub fn push_result(&self, result: PoolTaskResult) {
        self.inner
            .lock()
            .unwrap()
            .results
            .insert(result.id.clone(), result);
    }

    /// Make the next trigger of the named task fail with an rpc error.
    pub fn fail_trigger(&self, task_name: impl Into<String>) {
        self.inner.lock().unwrap().fail_triggers.push(task_name.into());
    }

    /// All trigger requests received so far.
    pub fn triggered(&self) -> Vec<TriggerRequest> {
        self.inner.lock().unwrap().triggered.clone()
    }

    /// Mark a previously triggered pool task as finished.
    pub fn finish_task(&self, task_id: &str, failure: bool, output_digest: &str) {
        let now = Utc::now();
        self.push_result(PoolTaskResult {
            id: task_id.to_string(),
            state: PoolTaskState::Completed,
            failure,
            started: Some(now),
            completed: Some(now),
            output_digest: output_digest.to_string(),
            tags: vec![],
        });
    }
}

/// Helper to build a bot with single-valued dimensions.
pub fn mock_bot(id: &str, dimensions: &[(&str, &str)]) -> BotInfo {
    BotInfo {
        id: id.to_string(),
        dimensions: dimensions
            .iter()
            .map(|(k, v)| Dimension {
                key: k.to_string(),
                values: vec![v.to_string()],
            })
            .collect(),
        is_dead: false,
        quarantined: false,
        task_id: String::new(),
    }
}

#[async_trait::async_trait]
impl PoolClient for MockPoolClient {
    async fn list_bots(&self, pool: &str) -> PoolResult<Vec<BotInfo>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .bots
            .get(pool)
            .cloned()
            .unwrap_or_default())
    }

    async fn trigger_task(&self, req: &TriggerRequest) -> PoolResult<TriggerResponse> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pos) = inner.fail_triggers.iter().position(|n| n == &req.name) {
            inner.fail_triggers.remove(pos);
            return Err(PoolError::Rpc(format!("scripted failure for {}", req.name)));
        }
        inner.next_task_num += 1;
        let task_id = format!("pool-task-{}", inner.next_task_num);
        inner.triggered.push(req.clone());
        inner.results.insert(
            task_id.clone(),
            PoolTaskResult {
                id: task_id.clone(),
                state: PoolTaskState::Pending,
                failure: false,
                started: None,
                completed: None,
                output_digest: String::new(),
                tags: req.tags.clone(),
            },
        );
        Ok(TriggerResponse::new(task_id, Utc::now()))
    }

    async fn get_task_status(&self, task_id: &str) -> PoolResult<PoolTaskResult> {
        self.inner
            .lock()
            .unwrap()
            .results
            .get(task_id)
            .cloned()
            .ok_or_else(|| PoolError::TaskNotFound(task_id.to_string()))
    }

    async fn list_tasks(
        &self,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
        tags: &[String],
    ) -> PoolResult<Vec<PoolTaskResult>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .results
            .values()
            .filter(|r| tags.iter().all(|t| r.tags.contains(t)))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(name: &str) -> TriggerRequest {
        TriggerRequest {
            name: name.to_string(),
            priority: 50,
            expiration_secs: 3600,
            slices: vec![],
            tags: vec![format!("name:{name}")],
            service_account: String::new(),
            pubsub_topic: String::new(),
            pubsub_userdata: String::new(),
        }
    }

    #[tokio::test]
    async fn test_trigger_and_status() {
        let pool = MockPoolClient::new();
        let resp = pool.trigger_task(&request("Build")).await.unwrap();
        let status = pool.get_task_status(resp.task_id()).await.unwrap();
        assert_eq!(status.state, PoolTaskState::Pending);

        pool.finish_task(resp.task_id(), false, "digest123");
        let status = pool.get_task_status(resp.task_id()).await.unwrap();
        assert_eq!(status.state, PoolTaskState::Completed);
        assert!(!status.failure);
        assert_eq!(status.output_digest, "digest123");
        assert_eq!(pool.triggered().len(), 1);
    }

    #[tokio::test]
    async fn test_scripted_trigger_failure_is_one_shot() {
        let pool = MockPoolClient::new();
        pool.fail_trigger("Build");
        assert!(pool.trigger_task(&request("Build")).await.is_err());
        assert!(pool.trigger_task(&request("Build")).await.is_ok());
    }

    #[tokio::test]
    async fn test_list_tasks_filters_by_tag() {
        let pool = MockPoolClient::new();
        pool.trigger_task(&request("Build")).await.unwrap();
        pool.trigger_task(&request("Test")).await.unwrap();
        let now = Utc::now();
        let found = pool
            .list_tasks(now, now, &["name:Build".to_string()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }
}
