pub mod config;
pub mod error;
pub mod server;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use url::Url;

use conveyor_lib::{graph::CommitSource, specs::ConfigSource};
use conveyor_pool::{HttpPoolClient, InputUploader, NoopUploader, PoolClient};
use conveyor_scheduler::{SchedulerOpts, TaskScheduler};
use conveyor_store::{InMemoryStore, Store};

use crate::config::{WorkdirCommitSource, WorkdirConfigSource};
use crate::error::HostResult;

fn default_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_workdir() -> PathBuf {
    PathBuf::from("workdir")
}

fn default_window_hours() -> i64 {
    4 * 24
}

fn default_window_commit_count() -> usize {
    300
}

fn default_time_decay_amt() -> f64 {
    0.9
}

fn default_score_threshold() -> f64 {
    0.0
}

fn default_schedule_limit_per_spec() -> usize {
    100
}

fn default_loop_period_secs() -> u64 {
    5
}

fn default_rpc_timeout_secs() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log() -> usize {
    7
}

#[derive(Default, Clone, Serialize, Deserialize, Debug, Parser)]
#[command(
    name = "conveyor",
    about = "Continuous-integration task scheduler",
    long_about = None
)]
#[serde(default)]
pub struct Cli {
    #[arg(long, require_equals = true, default_value = "0.0.0.0:8080")]
    #[serde(default = "default_address")]
    /// Server bind address
    /// [default: 0.0.0.0:8080]
    pub address: String,

    #[arg(long, require_equals = true, default_value = "workdir")]
    #[serde(default = "default_workdir")]
    /// Working directory holding repo snapshots, task configs and the
    /// periodic trigger files
    pub workdir: PathBuf,

    #[arg(long = "repo", require_equals = true)]
    /// Repository under scheduling; may be repeated
    pub repos: Vec<String>,

    #[arg(long = "pool", require_equals = true)]
    /// Worker pool to query for bots; may be repeated
    pub pools: Vec<String>,

    #[arg(long, require_equals = true, default_value = "96")]
    #[serde(default = "default_window_hours")]
    /// Scheduling window as a trailing duration, in hours
    pub window_hours: i64,

    #[arg(long, require_equals = true, default_value = "300")]
    #[serde(default = "default_window_commit_count")]
    /// Minimum number of eligible commits per repo, extending the window
    pub window_commit_count: usize,

    #[arg(long, require_equals = true, default_value = "0.9")]
    #[serde(default = "default_time_decay_amt")]
    /// Score multiplier at 24 hours of revision age
    pub time_decay_amt: f64,

    #[arg(long, require_equals = true, default_value = "0.0")]
    #[serde(default = "default_score_threshold")]
    /// Candidates scoring at or below this are not scheduled
    pub score_threshold: f64,

    #[arg(long, require_equals = true, default_value = "100")]
    #[serde(default = "default_schedule_limit_per_spec")]
    /// Max tasks triggered per task spec per iteration
    pub schedule_limit_per_spec: usize,

    #[arg(long, require_equals = true)]
    /// Worker pool server URL; without it a pool client cannot be built
    pub pool_server: Option<Url>,

    #[arg(long, require_equals = true, default_value = "")]
    /// CAS instance for input references; empty selects the legacy
    /// isolate form
    pub cas_instance: String,

    #[arg(long, require_equals = true, default_value = "")]
    /// Isolate server for legacy input references
    pub isolate_server: String,

    #[arg(long, require_equals = true, default_value = "")]
    /// Pub/sub topic attached to triggered tasks
    pub pubsub_topic: String,

    #[arg(long, require_equals = true, default_value = "5")]
    #[serde(default = "default_loop_period_secs")]
    /// Main loop period in seconds
    pub loop_period_secs: u64,

    #[arg(long, require_equals = true, default_value = "60")]
    #[serde(default = "default_rpc_timeout_secs")]
    /// Timeout for worker pool RPCs, in seconds
    pub rpc_timeout_secs: u64,

    #[arg(long, require_equals = true)]
    /// Path to a JSON config file merged under the command line arguments
    pub config_path: Option<PathBuf>,

    #[arg(long, require_equals = true)]
    pub log_path: Option<PathBuf>,

    #[arg(long, require_equals = true, default_value = "7")]
    #[serde(default = "default_max_log")]
    pub max_log: usize,

    #[arg(long, require_equals = true, env = "RUST_LOG", default_value = "info")]
    #[serde(default = "default_log_level")]
    /// Set the log level
    pub log_level: String,
}

impl Cli {
    /// Read the options from the config file and merge them with the
    /// current options; command line values take precedence.
    pub fn merge_from_file(&mut self) -> HostResult<()> {
        let Some(path) = &self.config_path else {
            return Ok(());
        };
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        let mut config: Value = serde_json::from_reader(reader)?;
        let this = serde_json::to_value(&self)?;
        merge(&mut config, &this);

        *self = serde_json::from_value(config)?;
        Ok(())
    }

    pub fn scheduler_opts(&self) -> SchedulerOpts {
        SchedulerOpts {
            repos: self.repos.clone(),
            pools: self.pools.clone(),
            window_duration: chrono::Duration::hours(self.window_hours),
            window_commit_count: self.window_commit_count,
            time_decay_amt: self.time_decay_amt,
            score_threshold: self.score_threshold,
            schedule_limit_per_spec: self.schedule_limit_per_spec,
            trigger_dir: self.workdir.join("trigger"),
            cas_instance: self.cas_instance.clone(),
            isolate_server: self.isolate_server.clone(),
            pubsub_topic: self.pubsub_topic.clone(),
        }
    }
}

/// Merges two json values, overwriting `a` with the non-null values of `b`.
fn merge(a: &mut Value, b: &Value) {
    match (a, b) {
        (Value::Object(a), Value::Object(b)) => {
            for (k, v) in b {
                merge(a.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
        (a, b) if !b.is_null() => *a = b.clone(),
        // If b is null, just keep a (which means do nothing).
        _ => {}
    }
}

#[derive(Clone)]
pub struct SchedulerState {
    pub opts: Arc<Cli>,
    pub scheduler: Arc<TaskScheduler>,
}

impl SchedulerState {
    pub fn init() -> HostResult<Self> {
        // Read the command line arguments, then the config file.
        let mut opts = Cli::parse();
        opts.merge_from_file()?;
        Self::from_opts(opts)
    }

    pub fn from_opts(opts: Cli) -> HostResult<Self> {
        if opts.repos.is_empty() {
            return Err(crate::error::HostError::Config(
                "at least one --repo is required".to_string(),
            ));
        }
        if !opts.workdir.exists() {
            std::fs::create_dir_all(&opts.workdir)?;
        }
        std::fs::create_dir_all(opts.workdir.join("trigger"))?;

        let pool: Arc<dyn PoolClient> = match &opts.pool_server {
            Some(url) => Arc::new(HttpPoolClient::new(
                url.clone(),
                Duration::from_secs(opts.rpc_timeout_secs),
            )?),
            None => {
                return Err(crate::error::HostError::Config(
                    "--pool-server is required".to_string(),
                ))
            }
        };
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let uploader: Arc<dyn InputUploader> = Arc::new(NoopUploader);
        let commits: Arc<dyn CommitSource> =
            Arc::new(WorkdirCommitSource::new(opts.workdir.clone()));
        let config: Arc<dyn ConfigSource> =
            Arc::new(WorkdirConfigSource::new(opts.workdir.clone()));

        let scheduler = Arc::new(TaskScheduler::new(
            opts.scheduler_opts(),
            store,
            pool,
            uploader,
            commits,
            config,
        ));
        info!("scheduling {} repos", opts.repos.len());
        Ok(Self {
            opts: Arc::new(opts),
            scheduler,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_prefers_cli_values() {
        let mut config = serde_json::json!({
            "address": "10.0.0.1:9000",
            "window_hours": 48,
        });
        let cli = serde_json::json!({
            "address": "0.0.0.0:8080",
            "window_hours": null,
        });
        merge(&mut config, &cli);
        assert_eq!(config["address"], "0.0.0.0:8080");
        assert_eq!(config["window_hours"], 48);
    }

    #[test]
    fn test_init_requires_repo_and_pool_server() {
        let opts = Cli {
            repos: vec![],
            ..Default::default()
        };
        assert!(SchedulerState::from_opts(opts).is_err());

        let opts = Cli {
            repos: vec!["https://example.org/repo.git".to_string()],
            workdir: std::env::temp_dir().join("conveyor-cli-test"),
            pool_server: None,
            ..Default::default()
        };
        assert!(SchedulerState::from_opts(opts).is_err());
    }
}
