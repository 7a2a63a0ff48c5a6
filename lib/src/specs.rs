use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::repo::RepoState;
use crate::{LibError, LibResult};

fn default_priority() -> f64 {
    0.5
}

fn default_max_attempts() -> u32 {
    2
}

fn default_execution_timeout_secs() -> u64 {
    4 * 60 * 60
}

fn default_io_timeout_secs() -> u64 {
    40 * 60
}

fn default_expiration_secs() -> u64 {
    4 * 60 * 60
}

/// A named cache mounted into the task's working directory.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct CacheSpec {
    pub name: String,
    pub path: String,
}

/// A versioned package installed before the task runs.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct PackageSpec {
    pub name: String,
    pub path: String,
    pub version: String,
}

/// Definition of a single schedulable task, loaded from config at a given
/// repo state. Command arguments, extra args and extra tags may contain
/// `<(VAR)` placeholders, expanded at trigger time.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize, ToSchema)]
#[serde(default)]
pub struct TaskSpec {
    /// Required bot dimensions, as "key:value" pairs. Must be non-empty.
    pub dimensions: Vec<String>,
    /// Names of task specs whose isolated outputs this task consumes.
    pub dependencies: Vec<String>,
    /// Scheduling priority in (0, 1]; higher is more urgent.
    pub priority: f64,
    pub command: Vec<String>,
    pub extra_args: Vec<String>,
    pub extra_tags: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub env_prefixes: BTreeMap<String, Vec<String>>,
    pub caches: Vec<CacheSpec>,
    pub packages: Vec<PackageSpec>,
    pub outputs: Vec<String>,
    /// Isolate file describing the task's inputs.
    pub isolate: String,
    pub service_account: String,
    pub execution_timeout_secs: u64,
    pub io_timeout_secs: u64,
    pub expiration_secs: u64,
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    pub idempotent: bool,
}

impl Default for TaskSpec {
    fn default() -> Self {
        Self {
            dimensions: Vec::new(),
            dependencies: Vec::new(),
            priority: default_priority(),
            command: Vec::new(),
            extra_args: Vec::new(),
            extra_tags: BTreeMap::new(),
            env: BTreeMap::new(),
            env_prefixes: BTreeMap::new(),
            caches: Vec::new(),
            packages: Vec::new(),
            outputs: Vec::new(),
            isolate: String::new(),
            service_account: String::new(),
            execution_timeout_secs: default_execution_timeout_secs(),
            io_timeout_secs: default_io_timeout_secs(),
            expiration_secs: default_expiration_secs(),
            max_attempts: default_max_attempts(),
            idempotent: false,
        }
    }
}

/// Definition of a job: a named set of task specs to bring to completion.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize, ToSchema, Default)]
#[serde(default)]
pub struct JobSpec {
    /// Direct task-spec dependencies of the job.
    pub task_specs: Vec<String>,
    /// When set, the job is only created by the matching periodic trigger
    /// instead of per landed commit.
    pub trigger: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: f64,
}

/// The full task configuration at a single repo state.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TasksCfg {
    pub tasks: BTreeMap<String, TaskSpec>,
    pub jobs: BTreeMap<String, JobSpec>,
}

impl TasksCfg {
    /// Validate the config: dimensions non-empty, priorities in range,
    /// dependencies resolvable within this config, no dependency cycles.
    pub fn validate(&self) -> LibResult<()> {
        for (name, task) in &self.tasks {
            if task.dimensions.is_empty() {
                return Err(LibError::InvalidConfig(format!(
                    "task {name} has no dimensions"
                )));
            }
            if !(task.priority > 0.0 && task.priority <= 1.0) {
                return Err(LibError::InvalidConfig(format!(
                    "task {name} has priority {} outside (0, 1]",
                    task.priority
                )));
            }
            for dep in &task.dependencies {
                if !self.tasks.contains_key(dep) {
                    return Err(LibError::InvalidConfig(format!(
                        "task {name} depends on undefined task {dep}"
                    )));
                }
            }
        }
        for (name, job) in &self.jobs {
            for dep in &job.task_specs {
                if !self.tasks.contains_key(dep) {
                    return Err(LibError::InvalidConfig(format!(
                        "job {name} references undefined task {dep}"
                    )));
                }
            }
        }
        self.check_cycles()?;
        Ok(())
    }

    fn check_cycles(&self) -> LibResult<()> {
        // Kahn's algorithm; leftover nodes imply a cycle.
        let mut indegree: BTreeMap<&str, usize> =
            self.tasks.keys().map(|k| (k.as_str(), 0)).collect();
        for task in self.tasks.values() {
            for dep in &task.dependencies {
                if let Some(d) = indegree.get_mut(dep.as_str()) {
                    *d += 1;
                }
            }
        }
        let mut queue: VecDeque<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(k, _)| *k)
            .collect();
        let mut seen = 0usize;
        while let Some(name) = queue.pop_front() {
            seen += 1;
            for dep in &self.tasks[name].dependencies {
                let d = indegree.get_mut(dep.as_str()).expect("validated above");
                *d -= 1;
                if *d == 0 {
                    queue.push_back(dep.as_str());
                }
            }
        }
        if seen != self.tasks.len() {
            return Err(LibError::InvalidConfig(
                "task dependency cycle detected".to_string(),
            ));
        }
        Ok(())
    }

    /// The transitive closure of task-spec names a job depends on, sorted.
    pub fn job_dependencies(&self, job_name: &str, rs: &RepoState) -> LibResult<Vec<String>> {
        let job = self.jobs.get(job_name).ok_or_else(|| LibError::UnknownJobSpec {
            repo: rs.repo.clone(),
            revision: rs.revision.clone(),
            name: job_name.to_string(),
        })?;
        let mut closure: BTreeSet<String> = BTreeSet::new();
        let mut queue: VecDeque<&str> = job.task_specs.iter().map(String::as_str).collect();
        while let Some(name) = queue.pop_front() {
            if !closure.insert(name.to_string()) {
                continue;
            }
            let task = self.tasks.get(name).ok_or_else(|| LibError::UnknownTaskSpec {
                repo: rs.repo.clone(),
                revision: rs.revision.clone(),
                name: name.to_string(),
            })?;
            for dep in &task.dependencies {
                queue.push_back(dep);
            }
        }
        Ok(closure.into_iter().collect())
    }

    pub fn task_spec(&self, name: &str, rs: &RepoState) -> LibResult<&TaskSpec> {
        self.tasks.get(name).ok_or_else(|| LibError::UnknownTaskSpec {
            repo: rs.repo.clone(),
            revision: rs.revision.clone(),
            name: name.to_string(),
        })
    }
}

/// Source of task configuration, resolved at a repo state. The scheduler
/// treats configuration as immutable per revision; sources are expected to
/// cache accordingly.
#[async_trait::async_trait]
pub trait ConfigSource: Send + Sync {
    async fn tasks_cfg(&self, rs: &RepoState) -> LibResult<Arc<TasksCfg>>;
}

/// A config source serving one fixed config per repo, for tests and for
/// deployments whose config does not vary per revision.
#[derive(Debug, Default)]
pub struct StaticConfigSource {
    configs: HashMap<String, Arc<TasksCfg>>,
}

impl StaticConfigSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, repo: impl Into<String>, cfg: TasksCfg) {
        self.configs.insert(repo.into(), Arc::new(cfg));
    }
}

#[async_trait::async_trait]
impl ConfigSource for StaticConfigSource {
    async fn tasks_cfg(&self, rs: &RepoState) -> LibResult<Arc<TasksCfg>> {
        self.configs
            .get(&rs.repo)
            .cloned()
            .ok_or_else(|| LibError::UnknownRepo(rs.repo.clone()))
    }
}
