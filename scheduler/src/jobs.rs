use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;

use conveyor_lib::{
    graph::CommitGraph,
    job::{Job, JobStatus},
    repo::RepoState,
    specs::{ConfigSource, TaskSpec, TasksCfg},
    task::{TaskKey, TaskStatus},
    window::Window,
};
use conveyor_store::{Store, TaskCacheSnapshot};

use crate::SchedulerResult;

/// Create one job per triggerless job spec for every newly landed commit.
/// Commits outside the scheduling window (old history seen on a first
/// sync) get no jobs.
pub(crate) async fn create_jobs_for_new_commits(
    store: &Arc<dyn Store>,
    config: &Arc<dyn ConfigSource>,
    window: &Window,
    graphs: &HashMap<String, Arc<CommitGraph>>,
    new_commits: &HashMap<String, Vec<String>>,
) -> SchedulerResult<Vec<Job>> {
    let mut jobs = Vec::new();
    for (repo, hashes) in new_commits {
        let Some(graph) = graphs.get(repo) else {
            continue;
        };
        for hash in hashes {
            if !window.test_commit_hash(graph, hash) {
                continue;
            }
            let rs = RepoState::new(repo.clone(), hash.clone());
            let cfg = match config.tasks_cfg(&rs).await {
                Ok(cfg) => cfg,
                Err(e) => {
                    tracing::warn!("no task config for new commit {repo}@{hash}: {e}");
                    continue;
                }
            };
            for (name, spec) in &cfg.jobs {
                if spec.trigger.is_some() {
                    continue;
                }
                let dependencies = cfg.job_dependencies(name, &rs)?;
                let id = store.assign_id().await?;
                jobs.push(Job::new(id, name.clone(), rs.clone(), dependencies, Utc::now()));
            }
        }
    }
    if !jobs.is_empty() {
        store.put_jobs(&jobs).await?;
        tracing::info!("created {} jobs for new commits", jobs.len());
    }
    Ok(jobs)
}

/// Fire periodic-trigger jobs: every file in the trigger directory names a
/// trigger label; job specs carrying that label are instantiated at the
/// current branch heads of every repo. The file is deleted only after the
/// jobs are persisted, so deletion is the commit point.
pub(crate) async fn trigger_periodic_jobs(
    dir: &Path,
    store: &Arc<dyn Store>,
    config: &Arc<dyn ConfigSource>,
    graphs: &HashMap<String, Arc<CommitGraph>>,
) -> SchedulerResult<Vec<Job>> {
    let mut created = Vec::new();
    if !dir.exists() {
        return Ok(created);
    }

    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let Ok(label) = entry.file_name().into_string() else {
            tracing::warn!("ignoring non-utf8 trigger file {:?}", entry.path());
            continue;
        };

        let mut jobs = Vec::new();
        // Multiple branches may share a head; create each job once.
        let mut seen: BTreeSet<(String, String, String)> = BTreeSet::new();
        for (repo, graph) in graphs {
            for head in graph.branch_heads().values() {
                let rs = RepoState::new(repo.clone(), head.clone());
                let cfg = match config.tasks_cfg(&rs).await {
                    Ok(cfg) => cfg,
                    Err(e) => {
                        tracing::warn!("no task config at {repo}@{head}: {e}");
                        continue;
                    }
                };
                for (name, spec) in &cfg.jobs {
                    if spec.trigger.as_deref() != Some(label.as_str()) {
                        continue;
                    }
                    if !seen.insert((repo.clone(), head.clone(), name.clone())) {
                        continue;
                    }
                    let dependencies = cfg.job_dependencies(name, &rs)?;
                    let id = store.assign_id().await?;
                    jobs.push(Job::new(id, name.clone(), rs.clone(), dependencies, Utc::now()));
                }
            }
        }

        store.put_jobs(&jobs).await?;
        tokio::fs::remove_file(entry.path()).await?;
        tracing::info!("periodic trigger {label:?} created {} jobs", jobs.len());
        created.extend(jobs);
    }
    Ok(created)
}

/// Derive a job's status from the latest attempt of each of its task names.
/// A name with no terminal task (or a failure that will still be retried)
/// keeps the job in progress; otherwise the worst per-name outcome wins.
/// Retry exhaustion uses the same criterion as candidate filtering, so a
/// job only fails once its spec's last attempt has failed.
pub(crate) fn derive_job_status(job: &Job, cfg: &TasksCfg, snapshot: &TaskCacheSnapshot) -> JobStatus {
    let mut statuses = Vec::with_capacity(job.dependencies.len());
    for name in &job.dependencies {
        let key = if job.is_force {
            TaskKey::forced(job.repo_state.clone(), name, &job.id)
        } else {
            TaskKey::new(job.repo_state.clone(), name)
        };
        let tasks = snapshot.tasks_by_key(&key);
        let Some(latest) = tasks.last() else {
            return JobStatus::InProgress;
        };
        let max_attempts = cfg
            .tasks
            .get(name)
            .map(|spec| spec.max_attempts)
            .unwrap_or_else(|| TaskSpec::default().max_attempts);
        let exhausted = latest.attempt + 1 >= max_attempts;
        let status = match latest.status {
            TaskStatus::Pending | TaskStatus::Running => JobStatus::InProgress,
            TaskStatus::Success => JobStatus::Success,
            TaskStatus::Failure if exhausted => JobStatus::Failure,
            TaskStatus::Mishap if exhausted => JobStatus::Mishap,
            // A failure with attempts left gets retried before it counts
            // against the job.
            TaskStatus::Failure | TaskStatus::Mishap => JobStatus::InProgress,
        };
        if status == JobStatus::InProgress {
            return JobStatus::InProgress;
        }
        statuses.push(status);
    }
    statuses.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    use conveyor_lib::graph::test_util::linear_graph;
    use conveyor_lib::specs::{JobSpec, StaticConfigSource};
    use conveyor_lib::task::Task;
    use conveyor_store::InMemoryStore;

    const REPO: &str = "https://example.org/repo.git";

    fn test_cfg(trigger: Option<&str>) -> TasksCfg {
        let mut cfg = TasksCfg::default();
        cfg.tasks.insert(
            "Build".to_string(),
            TaskSpec {
                dimensions: vec!["os:linux".to_string()],
                ..Default::default()
            },
        );
        cfg.jobs.insert(
            "ci".to_string(),
            JobSpec {
                task_specs: vec!["Build".to_string()],
                trigger: trigger.map(String::from),
                ..Default::default()
            },
        );
        cfg
    }

    fn sources(trigger: Option<&str>) -> (Arc<dyn Store>, Arc<dyn ConfigSource>) {
        let mut config = StaticConfigSource::new();
        config.insert(REPO, test_cfg(trigger));
        (
            Arc::new(InMemoryStore::new()),
            Arc::new(config) as Arc<dyn ConfigSource>,
        )
    }

    fn window_and_graphs(
        graph: CommitGraph,
    ) -> (Window, HashMap<String, Arc<CommitGraph>>) {
        let mut window = Window::new(Duration::days(365), 5);
        window.update(
            Utc::now(),
            &HashMap::from([(REPO.to_string(), graph.clone())]),
        );
        (window, HashMap::from([(REPO.to_string(), Arc::new(graph))]))
    }

    #[tokio::test]
    async fn test_jobs_created_per_new_commit() {
        let (store, config) = sources(None);
        let (window, graphs) = window_and_graphs(linear_graph(REPO, 3));

        let new_commits =
            HashMap::from([(REPO.to_string(), vec!["c1".to_string(), "c2".to_string()])]);
        let jobs = create_jobs_for_new_commits(&store, &config, &window, &graphs, &new_commits)
            .await
            .unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(store.unfinished_jobs().await.unwrap().len(), 2);
        assert_eq!(jobs[0].dependencies, vec!["Build"]);
    }

    #[tokio::test]
    async fn test_triggered_specs_not_created_per_commit() {
        let (store, config) = sources(Some("nightly"));
        let (window, graphs) = window_and_graphs(linear_graph(REPO, 3));

        let new_commits = HashMap::from([(REPO.to_string(), vec!["c2".to_string()])]);
        let jobs = create_jobs_for_new_commits(&store, &config, &window, &graphs, &new_commits)
            .await
            .unwrap();
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn test_out_of_window_commits_get_no_jobs() {
        let (store, config) = sources(None);
        let graph = linear_graph(REPO, 10);
        let newest = graph.nth_newest_timestamp(1).unwrap();
        let mut window = Window::new(Duration::seconds(1), 3);
        window.update(
            newest + Duration::days(1),
            &HashMap::from([(REPO.to_string(), graph.clone())]),
        );
        let graphs = HashMap::from([(REPO.to_string(), Arc::new(graph))]);

        let new_commits = HashMap::from([(
            REPO.to_string(),
            vec!["c0".to_string(), "c9".to_string()],
        )]);
        let jobs = create_jobs_for_new_commits(&store, &config, &window, &graphs, &new_commits)
            .await
            .unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].repo_state.revision, "c9");
    }

    #[tokio::test]
    async fn test_periodic_trigger_files() {
        let (store, config) = sources(Some("nightly"));
        let graph = Arc::new(linear_graph(REPO, 3));
        let graphs = HashMap::from([(REPO.to_string(), graph)]);

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("nightly"), b"").unwrap();
        std::fs::write(dir.path().join("weekly"), b"").unwrap();

        let jobs = trigger_periodic_jobs(dir.path(), &store, &config, &graphs)
            .await
            .unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, "ci");
        assert_eq!(jobs[0].repo_state.revision, "c2");

        // Both files are consumed: deletion is the commit point.
        assert!(!dir.path().join("nightly").exists());
        assert!(!dir.path().join("weekly").exists());

        // Re-running without files creates nothing.
        let jobs = trigger_periodic_jobs(dir.path(), &store, &config, &graphs)
            .await
            .unwrap();
        assert!(jobs.is_empty());
    }

    fn job_with_deps(deps: &[&str]) -> Job {
        Job::new(
            "job1",
            "ci",
            RepoState::new(REPO, "c2"),
            deps.iter().map(|d| d.to_string()).collect(),
            Utc::now(),
        )
    }

    fn status_cfg(max_attempts: u32) -> TasksCfg {
        let mut cfg = TasksCfg::default();
        for name in ["Build", "Test"] {
            cfg.tasks.insert(
                name.to_string(),
                TaskSpec {
                    dimensions: vec!["os:linux".to_string()],
                    max_attempts,
                    ..Default::default()
                },
            );
        }
        cfg
    }

    fn task_for(name: &str, status: TaskStatus, attempt: u32, retry_of: Option<&str>) -> Task {
        let mut task = Task::new(
            format!("task-{name}-{attempt}"),
            TaskKey::new(RepoState::new(REPO, "c2"), name),
            Utc::now(),
        );
        task.status = status;
        task.attempt = attempt;
        task.retry_of = retry_of.map(String::from);
        task
    }

    #[test]
    fn test_job_status_waits_for_all_names() {
        let job = job_with_deps(&["Build", "Test"]);
        let snapshot = TaskCacheSnapshot::from_tasks(vec![task_for(
            "Build",
            TaskStatus::Success,
            0,
            None,
        )]);
        assert_eq!(
            derive_job_status(&job, &status_cfg(2), &snapshot),
            JobStatus::InProgress
        );
    }

    #[test]
    fn test_job_status_success() {
        let job = job_with_deps(&["Build"]);
        let snapshot =
            TaskCacheSnapshot::from_tasks(vec![task_for("Build", TaskStatus::Success, 0, None)]);
        assert_eq!(
            derive_job_status(&job, &status_cfg(2), &snapshot),
            JobStatus::Success
        );
    }

    #[test]
    fn test_job_status_fresh_failure_keeps_in_progress() {
        let job = job_with_deps(&["Build"]);
        let snapshot =
            TaskCacheSnapshot::from_tasks(vec![task_for("Build", TaskStatus::Failure, 0, None)]);
        assert_eq!(
            derive_job_status(&job, &status_cfg(2), &snapshot),
            JobStatus::InProgress
        );
    }

    #[test]
    fn test_job_status_exhausted_failure_fails_job() {
        let job = job_with_deps(&["Build"]);
        let first = task_for("Build", TaskStatus::Failure, 0, None);
        let retry = task_for("Build", TaskStatus::Failure, 1, Some(first.id.as_str()));
        let snapshot = TaskCacheSnapshot::from_tasks(vec![first, retry]);
        assert_eq!(
            derive_job_status(&job, &status_cfg(2), &snapshot),
            JobStatus::Failure
        );
    }

    #[test]
    fn test_job_status_respects_configured_max_attempts() {
        // With three attempts allowed, a failed first retry is still
        // retryable, so the job stays open exactly as long as the
        // candidate filter keeps scheduling attempts.
        let job = job_with_deps(&["Build"]);
        let first = task_for("Build", TaskStatus::Failure, 0, None);
        let retry = task_for("Build", TaskStatus::Failure, 1, Some(first.id.as_str()));
        let snapshot = TaskCacheSnapshot::from_tasks(vec![first.clone(), retry.clone()]);
        assert_eq!(
            derive_job_status(&job, &status_cfg(3), &snapshot),
            JobStatus::InProgress
        );

        let last = task_for("Build", TaskStatus::Mishap, 2, Some(retry.id.as_str()));
        let snapshot = TaskCacheSnapshot::from_tasks(vec![first, retry, last]);
        assert_eq!(
            derive_job_status(&job, &status_cfg(3), &snapshot),
            JobStatus::Mishap
        );
    }

    #[test]
    fn test_job_status_unknown_spec_uses_default_attempts() {
        // A name the config no longer defines falls back to the default
        // attempt budget instead of wedging the job open forever.
        let job = job_with_deps(&["Build"]);
        let first = task_for("Build", TaskStatus::Failure, 0, None);
        let retry = task_for("Build", TaskStatus::Failure, 1, Some(first.id.as_str()));
        let snapshot = TaskCacheSnapshot::from_tasks(vec![first, retry]);
        assert_eq!(
            derive_job_status(&job, &TasksCfg::default(), &snapshot),
            JobStatus::Failure
        );
    }
}
