use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use conveyor_lib::{
    graph::CommitGraph,
    id::candidate_id,
    job::Job,
    specs::{ConfigSource, TaskSpec, TasksCfg},
    task::{TaskKey, TaskStatus},
    window::Window,
};
use conveyor_store::TaskCacheSnapshot;

use crate::blacklist::Blacklist;

/// Back-reference from a candidate to one of the jobs that wants it.
#[derive(PartialEq, Debug, Clone, Serialize, ToSchema)]
pub struct JobRef {
    pub id: String,
    pub created: DateTime<Utc>,
}

/// Scoring intermediates, recorded for observability only.
#[derive(PartialEq, Debug, Clone, Serialize, ToSchema, Default)]
pub struct ScoringSnapshot {
    pub blamelist_length: usize,
    pub stole_from_length: usize,
    pub testedness_increase: f64,
    pub decay: f64,
}

/// Per-candidate diagnostics. Additive records written by the stage that
/// produced them; never an input to any scheduling decision.
#[derive(PartialEq, Debug, Clone, Serialize, ToSchema, Default)]
pub struct Diagnostics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filtering: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scoring: Option<ScoringSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matching: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triggering: Option<String>,
}

/// A runnable task candidate, alive for one loop iteration.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub key: TaskKey,
    pub spec: Arc<TaskSpec>,
    /// Owning jobs, sorted by creation time then id, deduplicated.
    pub jobs: Vec<JobRef>,
    pub score: f64,
    pub commits: Vec<String>,
    pub stealing_from_id: Option<String>,
    pub retry_of: Option<String>,
    pub attempt: u32,
    pub parent_task_ids: Vec<String>,
    pub isolated_hashes: Vec<String>,
    pub isolated_input: Option<String>,
    pub diagnostics: Diagnostics,
}

impl Candidate {
    pub fn new(key: TaskKey, spec: Arc<TaskSpec>) -> Self {
        Self {
            key,
            spec,
            jobs: Vec::new(),
            score: 0.0,
            commits: Vec::new(),
            stealing_from_id: None,
            retry_of: None,
            attempt: 0,
            parent_task_ids: Vec::new(),
            isolated_hashes: Vec::new(),
            isolated_input: None,
            diagnostics: Diagnostics::default(),
        }
    }

    pub fn id(&self) -> String {
        candidate_id(&self.key)
    }

    pub fn is_try_job(&self) -> bool {
        self.key.is_try_job()
    }

    pub fn is_forced(&self) -> bool {
        self.key.is_forced()
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

    /// Record an owning job, keeping the list sorted by creation time and
    /// stable under re-insertion of the same job.
    pub fn add_job(&mut self, job: &Job) {
        if self.jobs.iter().any(|j| j.id == job.id) {
            return;
        }
        let job_ref = JobRef {
            id: job.id.clone(),
            created: job.created,
        };
        let pos = self
            .jobs
            .partition_point(|j| (j.created, &j.id) <= (job_ref.created, &job_ref.id));
        self.jobs.insert(pos, job_ref);
    }

    pub fn earliest_job_created(&self) -> Option<DateTime<Utc>> {
        self.jobs.first().map(|j| j.created)
    }

    pub fn view(&self) -> CandidateView {
        CandidateView {
            id: self.id(),
            name: self.key.name.clone(),
            repo: self.key.repo_state.repo.clone(),
            revision: self.key.repo_state.revision.clone(),
            forced: self.is_forced(),
            try_job: self.is_try_job(),
            score: self.score,
            commits: self.commits.clone(),
            stealing_from_id: self.stealing_from_id.clone(),
            retry_of: self.retry_of.clone(),
            attempt: self.attempt,
            jobs: self.jobs.clone(),
            diagnostics: self.diagnostics.clone(),
        }
    }
}

/// Serializable summary of a candidate, as surfaced by the status endpoint.
#[derive(PartialEq, Debug, Clone, Serialize, ToSchema)]
pub struct CandidateView {
    pub id: String,
    pub name: String,
    pub repo: String,
    pub revision: String,
    pub forced: bool,
    pub try_job: bool,
    pub score: f64,
    pub commits: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stealing_from_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<String>,
    pub attempt: u32,
    pub jobs: Vec<JobRef>,
    pub diagnostics: Diagnostics,
}

/// Build the deduplicated candidate set from the unfinished jobs whose
/// creation time falls inside the scheduling window.
pub(crate) async fn generate(
    unfinished_jobs: Vec<Job>,
    window: &Window,
    config: &dyn ConfigSource,
) -> BTreeMap<TaskKey, Candidate> {
    let mut cfgs: HashMap<conveyor_lib::repo::RepoState, Option<Arc<TasksCfg>>> = HashMap::new();
    let mut candidates: BTreeMap<TaskKey, Candidate> = BTreeMap::new();

    for job in unfinished_jobs {
        if !window.test_time(&job.repo_state.repo, job.created) {
            tracing::debug!("job {} created outside the scheduling window", job.id);
            continue;
        }
        let cfg = match cfgs.get(&job.repo_state) {
            Some(cached) => cached.clone(),
            None => {
                let resolved = match config.tasks_cfg(&job.repo_state).await {
                    Ok(cfg) => Some(cfg),
                    Err(e) => {
                        tracing::warn!(
                            "failed to resolve task config for job {} at {}@{}: {e}",
                            job.id,
                            job.repo_state.repo,
                            job.repo_state.revision
                        );
                        None
                    }
                };
                cfgs.insert(job.repo_state.clone(), resolved.clone());
                resolved
            }
        };
        let Some(cfg) = cfg else {
            continue;
        };

        for name in &job.dependencies {
            let key = if job.is_force {
                TaskKey::forced(job.repo_state.clone(), name, &job.id)
            } else {
                TaskKey::new(job.repo_state.clone(), name)
            };
            if let Some(existing) = candidates.get_mut(&key) {
                existing.add_job(&job);
                continue;
            }
            let spec = match cfg.task_spec(name, &job.repo_state) {
                Ok(spec) => Arc::new(spec.clone()),
                Err(e) => {
                    tracing::warn!("job {} wants unknown task spec: {e}", job.id);
                    continue;
                }
            };
            let mut candidate = Candidate::new(key.clone(), spec);
            candidate.add_job(&job);
            candidates.insert(key, candidate);
        }
    }
    candidates
}

pub(crate) struct FilterContext<'a> {
    pub snapshot: &'a TaskCacheSnapshot,
    pub blacklist: &'a Blacklist,
    pub window: &'a Window,
    pub graphs: &'a HashMap<String, Arc<CommitGraph>>,
}

/// Apply the filter rules to a candidate. Returns true when the candidate
/// stays schedulable; a drop reason lands in the diagnostics and metrics.
pub(crate) fn filter(candidate: &mut Candidate, ctx: &FilterContext<'_>) -> bool {
    let reject = |candidate: &mut Candidate, reason: &str, detail: String| {
        candidate.diagnostics.filtering = Some(detail);
        conveyor_metrics::inc_candidates_filtered(reason);
        false
    };

    // 1. Blacklist.
    if let Some(rule) = ctx
        .blacklist
        .match_rule(candidate.name(), candidate.revision())
    {
        return reject(
            candidate,
            "blacklisted",
            format!("blacklisted by rule {rule:?}"),
        );
    }

    // 2. Revision inside the scheduling window. Try jobs are pinned to the
    // patch, not the base revision's age.
    if !candidate.is_try_job() {
        let Some(graph) = ctx.graphs.get(candidate.repo()) else {
            return reject(
                candidate,
                "unknown_repo",
                format!("no commit graph for repo {}", candidate.repo()),
            );
        };
        if !ctx.window.test_commit_hash(graph, candidate.revision()) {
            return reject(
                candidate,
                "out_of_window",
                format!(
                    "revision {} is outside the scheduling window",
                    candidate.revision()
                ),
            );
        }
    }

    // 3 + 4. Previous tasks with the same key.
    let previous = ctx.snapshot.tasks_by_key(&candidate.key);
    if let Some(active) = previous
        .iter()
        .find(|t| !t.done() || t.status == TaskStatus::Success)
    {
        return reject(
            candidate,
            "deduplicated",
            format!("task {} is already {:?}", active.id, active.status),
        );
    }
    if let Some(failed) = previous.last() {
        // Everything left in `previous` is done and unsuccessful.
        if failed.attempt + 1 >= candidate.spec.max_attempts {
            return reject(
                candidate,
                "max_attempts",
                format!(
                    "task {} used the last of {} attempts",
                    failed.id, candidate.spec.max_attempts
                ),
            );
        }
        candidate.retry_of = Some(failed.id.clone());
        candidate.attempt = failed.attempt + 1;
    }

    // 5. Dependencies fulfilled.
    let mut parents: Vec<(String, String)> = Vec::new();
    for dep in &candidate.spec.dependencies {
        let dep_key = candidate.key.with_name(dep);
        let satisfied = ctx
            .snapshot
            .tasks_by_key(&dep_key)
            .into_iter()
            .filter(|t| t.done() && t.status.success() && !t.isolated_output.is_empty())
            .next_back();
        match satisfied {
            Some(task) => parents.push((task.id.clone(), task.isolated_output.clone())),
            None => {
                return reject(
                    candidate,
                    "dependency_unmet",
                    format!("dependency {dep} has no successful task"),
                );
            }
        }
    }
    parents.sort();
    candidate.parent_task_ids = parents.iter().map(|(id, _)| id.clone()).collect();
    candidate.isolated_hashes = parents.into_iter().map(|(_, hash)| hash).collect();

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use conveyor_lib::graph::test_util::linear_graph;
    use conveyor_lib::job::Job;
    use conveyor_lib::repo::RepoState;
    use conveyor_lib::specs::{JobSpec, StaticConfigSource};
    use conveyor_lib::task::Task;

    const REPO: &str = "https://example.org/repo.git";

    fn test_cfg() -> TasksCfg {
        let mut cfg = TasksCfg::default();
        cfg.tasks.insert(
            "Build".to_string(),
            TaskSpec {
                dimensions: vec!["os:linux".to_string()],
                ..Default::default()
            },
        );
        cfg.tasks.insert(
            "Test".to_string(),
            TaskSpec {
                dimensions: vec!["os:linux".to_string()],
                dependencies: vec!["Build".to_string()],
                ..Default::default()
            },
        );
        cfg.jobs.insert(
            "ci".to_string(),
            JobSpec {
                task_specs: vec!["Test".to_string()],
                ..Default::default()
            },
        );
        cfg
    }

    fn test_job(id: &str, revision: &str) -> Job {
        Job::new(
            id,
            "ci",
            RepoState::new(REPO, revision),
            vec!["Build".to_string(), "Test".to_string()],
            Utc::now(),
        )
    }

    fn test_window(graph: &CommitGraph) -> Window {
        let mut window = Window::new(Duration::days(365), 5);
        window.update(
            Utc::now(),
            &HashMap::from([(REPO.to_string(), graph.clone())]),
        );
        window
    }

    async fn generate_for(jobs: Vec<Job>, graph: &CommitGraph) -> BTreeMap<TaskKey, Candidate> {
        let mut config = StaticConfigSource::new();
        config.insert(REPO, test_cfg());
        generate(jobs, &test_window(graph), &config).await
    }

    #[tokio::test]
    async fn test_generate_dedups_by_key() {
        let graph = linear_graph(REPO, 3);
        let jobs = vec![test_job("job1", "c2"), test_job("job2", "c2")];
        let candidates = generate_for(jobs, &graph).await;

        // Two jobs at the same repo state share both candidates.
        assert_eq!(candidates.len(), 2);
        for candidate in candidates.values() {
            assert_eq!(candidate.jobs.len(), 2);
            assert_eq!(candidate.jobs[0].id, "job1");
        }
    }

    #[tokio::test]
    async fn test_generate_keys_forced_jobs_separately() {
        let graph = linear_graph(REPO, 3);
        let mut forced = test_job("job2", "c2");
        forced.is_force = true;
        let candidates = generate_for(vec![test_job("job1", "c2"), forced], &graph).await;

        // Forced jobs never share candidates with regular ones.
        assert_eq!(candidates.len(), 4);
    }

    #[tokio::test]
    async fn test_generate_skips_jobs_outside_window() {
        let graph = linear_graph(REPO, 3);
        let mut old = test_job("job1", "c2");
        old.created = Utc::now() - Duration::days(999);
        let candidates = generate_for(vec![old], &graph).await;
        assert!(candidates.is_empty());
    }

    fn filter_with_snapshot(
        candidate: &mut Candidate,
        snapshot: &TaskCacheSnapshot,
        graph: &CommitGraph,
    ) -> bool {
        let window = test_window(graph);
        let graphs = HashMap::from([(REPO.to_string(), Arc::new(graph.clone()))]);
        let ctx = FilterContext {
            snapshot,
            blacklist: &Blacklist::new(),
            window: &window,
            graphs: &graphs,
        };
        filter(candidate, &ctx)
    }

    fn build_candidate(name: &str, revision: &str) -> Candidate {
        let mut spec = match name {
            "Test" => TaskSpec {
                dependencies: vec!["Build".to_string()],
                ..Default::default()
            },
            _ => TaskSpec::default(),
        };
        spec.dimensions = vec!["os:linux".to_string()];
        Candidate::new(
            TaskKey::new(RepoState::new(REPO, revision), name),
            Arc::new(spec),
        )
    }

    fn done_task(id: &str, name: &str, revision: &str, status: TaskStatus, output: &str) -> Task {
        let mut task = Task::new(
            id,
            TaskKey::new(RepoState::new(REPO, revision), name),
            Utc::now(),
        );
        task.status = status;
        task.isolated_output = output.to_string();
        task.commits = vec![revision.to_string()];
        task
    }

    #[test]
    fn test_filter_dedups_against_pending_task() {
        let graph = linear_graph(REPO, 3);
        let mut pending = done_task("1", "Build", "c2", TaskStatus::Success, "out");
        pending.status = TaskStatus::Pending;
        let snapshot = TaskCacheSnapshot::from_tasks(vec![pending]);

        let mut candidate = build_candidate("Build", "c2");
        assert!(!filter_with_snapshot(&mut candidate, &snapshot, &graph));
        assert!(candidate
            .diagnostics
            .filtering
            .as_deref()
            .unwrap()
            .contains("already"));
    }

    #[test]
    fn test_filter_sets_retry_of_on_failed_predecessor() {
        let graph = linear_graph(REPO, 3);
        let failed = done_task("1", "Build", "c2", TaskStatus::Failure, "");
        let snapshot = TaskCacheSnapshot::from_tasks(vec![failed]);

        let mut candidate = build_candidate("Build", "c2");
        assert!(filter_with_snapshot(&mut candidate, &snapshot, &graph));
        assert_eq!(candidate.retry_of.as_deref(), Some("1"));
        assert_eq!(candidate.attempt, 1);
    }

    #[test]
    fn test_filter_drops_when_attempts_exhausted() {
        let graph = linear_graph(REPO, 3);
        let mut retry = done_task("2", "Build", "c2", TaskStatus::Failure, "");
        retry.attempt = 1;
        retry.retry_of = Some("1".to_string());
        let first = done_task("1", "Build", "c2", TaskStatus::Failure, "");
        let snapshot = TaskCacheSnapshot::from_tasks(vec![first, retry]);

        let mut candidate = build_candidate("Build", "c2");
        assert!(!filter_with_snapshot(&mut candidate, &snapshot, &graph));
        assert!(candidate
            .diagnostics
            .filtering
            .as_deref()
            .unwrap()
            .contains("attempts"));
    }

    #[test]
    fn test_filter_requires_dependency_output() {
        let graph = linear_graph(REPO, 3);

        // Successful dependency without isolated output does not count.
        let no_output = done_task("1", "Build", "c2", TaskStatus::Success, "");
        let snapshot = TaskCacheSnapshot::from_tasks(vec![no_output]);
        let mut candidate = build_candidate("Test", "c2");
        assert!(!filter_with_snapshot(&mut candidate, &snapshot, &graph));

        let with_output = done_task("1", "Build", "c2", TaskStatus::Success, "digest1");
        let snapshot = TaskCacheSnapshot::from_tasks(vec![with_output]);
        let mut candidate = build_candidate("Test", "c2");
        assert!(filter_with_snapshot(&mut candidate, &snapshot, &graph));
        assert_eq!(candidate.parent_task_ids, vec!["1"]);
        assert_eq!(candidate.isolated_hashes, vec!["digest1"]);
    }

    #[test]
    fn test_filter_blacklist() {
        let graph = linear_graph(REPO, 3);
        let snapshot = TaskCacheSnapshot::from_tasks(vec![]);
        let window = test_window(&graph);
        let graphs = HashMap::from([(REPO.to_string(), Arc::new(graph.clone()))]);

        let mut blacklist = Blacklist::new();
        blacklist
            .add_rule(crate::blacklist::Rule {
                name: "no-builds".to_string(),
                task_spec_patterns: vec!["Build.*".to_string()],
                commits: vec!["c2".to_string()],
                description: String::new(),
            })
            .unwrap();

        let ctx = FilterContext {
            snapshot: &snapshot,
            blacklist: &blacklist,
            window: &window,
            graphs: &graphs,
        };
        let mut candidate = build_candidate("Build", "c2");
        assert!(!filter(&mut candidate, &ctx));
        let mut other_rev = build_candidate("Build", "c1");
        assert!(filter(&mut other_rev, &ctx));
    }
}
