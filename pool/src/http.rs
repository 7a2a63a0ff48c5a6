use std::time::Duration;

use backoff::{exponential::ExponentialBackoff, SystemClock};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use url::Url;

use crate::{
    client::{BotInfo, PoolClient, PoolTaskResult, TriggerResponse},
    request::TriggerRequest,
    PoolError, PoolResult,
};

/// JSON-over-HTTP worker pool client. Transient failures are retried with
/// exponential backoff; anything left after the backoff budget surfaces as
/// a single loop-granularity error.
#[derive(Debug, Clone)]
pub struct HttpPoolClient {
    base: Url,
    client: reqwest::Client,
}

impl HttpPoolClient {
    pub fn new(base: Url, timeout: Duration) -> PoolResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PoolError::Rpc(e.to_string()))?;
        Ok(Self { base, client })
    }

    fn endpoint(&self, path: &str) -> PoolResult<Url> {
        self.base
            .join(path)
            .map_err(|e| PoolError::Rpc(format!("bad endpoint {path}: {e}")))
    }

    fn backoff() -> ExponentialBackoff<SystemClock> {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(250),
            max_interval: Duration::from_secs(5),
            max_elapsed_time: Some(Duration::from_secs(30)),
            ..Default::default()
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> PoolResult<T> {
        let op = || async {
            let resp = self
                .client
                .get(url.clone())
                .send()
                .await
                .map_err(|e| backoff::Error::transient(PoolError::Rpc(e.to_string())))?;
            if resp.status() == reqwest::StatusCode::NOT_FOUND {
                return Err(backoff::Error::permanent(PoolError::TaskNotFound(
                    url.path().to_string(),
                )));
            }
            if resp.status().is_server_error() {
                return Err(backoff::Error::transient(PoolError::Rpc(format!(
                    "{} returned {}",
                    url,
                    resp.status()
                ))));
            }
            let resp = resp
                .error_for_status()
                .map_err(|e| backoff::Error::permanent(PoolError::Rpc(e.to_string())))?;
            resp.json::<T>()
                .await
                .map_err(|e| backoff::Error::permanent(PoolError::Rpc(e.to_string())))
        };
        backoff::future::retry(Self::backoff(), op).await
    }

    async fn post_json<B: serde::Serialize, T: DeserializeOwned>(
        &self,
        url: Url,
        body: &B,
    ) -> PoolResult<T> {
        let op = || async {
            let resp = self
                .client
                .post(url.clone())
                .json(body)
                .send()
                .await
                .map_err(|e| backoff::Error::transient(PoolError::Rpc(e.to_string())))?;
            if resp.status().is_server_error() {
                return Err(backoff::Error::transient(PoolError::Rpc(format!(
                    "{} returned {}",
                    url,
                    resp.status()
                ))));
            }
            let resp = resp
                .error_for_status()
                .map_err(|e| backoff::Error::permanent(PoolError::Rpc(e.to_string())))?;
            resp.json::<T>()
                .await
                .map_err(|e| backoff::Error::permanent(PoolError::Rpc(e.to_string())))
        };
        backoff::future::retry(Self::backoff(), op).await
    }
}

#[async_trait::async_trait]
impl PoolClient for HttpPoolClient {
    async fn list_bots(&self, pool: &str) -> PoolResult<Vec<BotInfo>> {
        let mut url = self.endpoint("bots/list")?;
        url.query_pairs_mut()
            .append_pair("dimensions", &format!("pool:{pool}"));
        self.get_json(url).await
    }

    async fn trigger_task(&self, req: &TriggerRequest) -> PoolResult<TriggerResponse> {
        let url = self.endpoint("tasks/new")?;
        tracing::debug!("HttpPoolClient.trigger_task: {}", req.name);
        self.post_json(url, req).await
    }

    async fn get_task_status(&self, task_id: &str) -> PoolResult<PoolTaskResult> {
        let url = self.endpoint(&format!("task/{task_id}/result"))?;
        self.get_json(url).await
    }

    async fn list_tasks(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        tags: &[String],
    ) -> PoolResult<Vec<PoolTaskResult>> {
        let mut url = self.endpoint("tasks/list")?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("start", &start.timestamp().to_string());
            pairs.append_pair("end", &end.timestamp().to_string());
            for tag in tags {
                pairs.append_pair("tags", tag);
            }
        }
        self.get_json(url).await
    }
}
