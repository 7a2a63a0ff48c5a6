use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use conveyor_lib::{
    graph::{CommitGraph, CommitSource},
    job::Job,
    repo::RepoState,
    specs::{ConfigSource, TasksCfg},
    task::Task,
    window::Window,
};
use conveyor_pool::{BotInfo, InputUploader, PoolClient, PoolTaskResult};
use conveyor_store::{JobCache, Store, TaskCache};

use crate::{
    blacklist::{Blacklist, Rule},
    candidates::{self, Candidate, CandidateView, FilterContext},
    drain::{self, TriggerOpts, SCHEDULER_TAG},
    jobs, matching,
    process::{self, ScoreParams},
    SchedulerResult,
};

fn default_duration() -> chrono::Duration {
    chrono::Duration::days(4)
}

#[derive(Debug, Clone)]
pub struct SchedulerOpts {
    pub repos: Vec<String>,
    /// Worker pools queried for bots and bulk task status.
    pub pools: Vec<String>,
    pub window_duration: chrono::Duration,
    pub window_commit_count: usize,
    pub time_decay_amt: f64,
    pub score_threshold: f64,
    pub schedule_limit_per_spec: usize,
    pub trigger_dir: PathBuf,
    pub cas_instance: String,
    pub isolate_server: String,
    pub pubsub_topic: String,
}

impl Default for SchedulerOpts {
    fn default() -> Self {
        Self {
            repos: Vec::new(),
            pools: Vec::new(),
            window_duration: default_duration(),
            window_commit_count: 300,
            time_decay_amt: 0.9,
            score_threshold: 0.0,
            schedule_limit_per_spec: 100,
            trigger_dir: PathBuf::from("trigger"),
            cas_instance: String::new(),
            isolate_server: String::new(),
            pubsub_topic: String::new(),
        }
    }
}

/// The scheduler core: owns the caches and the candidate queue and drives
/// one iteration of the main loop per [`tick`](TaskScheduler::tick).
pub struct TaskScheduler {
    opts: SchedulerOpts,
    store: Arc<dyn Store>,
    task_cache: TaskCache,
    job_cache: JobCache,
    pool: Arc<dyn PoolClient>,
    uploader: Arc<dyn InputUploader>,
    commits: Arc<dyn CommitSource>,
    config: Arc<dyn ConfigSource>,
    graphs: StdRwLock<HashMap<String, Arc<CommitGraph>>>,
    window: StdRwLock<Arc<Window>>,
    blacklist: StdRwLock<Blacklist>,
    /// Candidates that were scored but not triggered this iteration.
    /// Status readers take the read half; the loop writes after drain.
    queue: RwLock<Vec<Candidate>>,
    /// Candidates dropped during the last iteration, kept for diagnostics.
    rejected: RwLock<Vec<Candidate>>,
    last_scheduled: RwLock<Option<DateTime<Utc>>>,
    busy: AtomicBool,
}

impl TaskScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        opts: SchedulerOpts,
        store: Arc<dyn Store>,
        pool: Arc<dyn PoolClient>,
        uploader: Arc<dyn InputUploader>,
        commits: Arc<dyn CommitSource>,
        config: Arc<dyn ConfigSource>,
    ) -> Self {
        let window = Window::new(opts.window_duration, opts.window_commit_count);
        Self {
            opts,
            task_cache: TaskCache::new(store.clone()),
            job_cache: JobCache::new(store.clone()),
            store,
            pool,
            uploader,
            commits,
            config,
            graphs: StdRwLock::new(HashMap::new()),
            window: StdRwLock::new(Arc::new(window)),
            blacklist: StdRwLock::new(Blacklist::new()),
            queue: RwLock::new(Vec::new()),
            rejected: RwLock::new(Vec::new()),
            last_scheduled: RwLock::new(None),
            busy: AtomicBool::new(false),
        }
    }

    /// Drive the main loop until cancelled. Re-entrancy is prevented here,
    /// not inside the iteration itself.
    pub async fn run(self: Arc<Self>, period: std::time::Duration, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("scheduler loop shutting down");
                    return;
                }
                _ = interval.tick() => {}
            }
            if self.busy.swap(true, Ordering::SeqCst) {
                tracing::warn!("previous iteration still running, skipping this tick");
                continue;
            }
            let start = Instant::now();
            match self.tick().await {
                Ok(()) => {
                    conveyor_metrics::observe_loop_duration(start.elapsed());
                    conveyor_metrics::set_last_successful_loop(Utc::now().timestamp());
                }
                Err(e) => tracing::error!("main loop iteration failed: {e}"),
            }
            self.busy.store(false, Ordering::SeqCst);
        }
    }

    /// One main loop iteration.
    pub async fn tick(&self) -> SchedulerResult<()> {
        // 1 + 2. Refresh commit graphs and the window, concurrently with
        // polling the worker pool for unfinished task status.
        let (new_commits, polled) = tokio::join!(self.refresh_repos(), self.poll_pool_status());
        let new_commits = new_commits?;
        if let Err(e) = polled {
            tracing::warn!("worker pool status refresh failed: {e}");
        }

        let window = self.window_snapshot();
        let window_start = window.earliest_start();
        self.task_cache.update(window_start).await?;
        self.job_cache.update(window_start).await?;

        // 3. Recompute job statuses from their tasks.
        self.update_job_statuses(window_start).await?;

        // 4. New jobs for new commits; periodic triggers.
        let graphs = self.graphs_snapshot();
        jobs::create_jobs_for_new_commits(&self.store, &self.config, &window, &graphs, &new_commits)
            .await?;
        if let Err(e) =
            jobs::trigger_periodic_jobs(&self.opts.trigger_dir, &self.store, &self.config, &graphs)
                .await
        {
            tracing::warn!("periodic trigger scan failed: {e}");
        }
        self.job_cache.update(window_start).await?;

        // 5 + 6a. Regenerate and score candidates while fetching free bots.
        let (queue_result, bots_result) =
            tokio::join!(self.regenerate_queue(&window, &graphs), self.list_free_bots());
        let (scheduled, rejected) = queue_result?;
        let bots = match bots_result {
            Ok(bots) => bots,
            Err(e) => {
                tracing::warn!("listing free bots failed: {e}");
                Vec::new()
            }
        };
        conveyor_metrics::set_free_bot_count(bots.len());

        // 6b. Match and drain.
        let match_outcome =
            matching::match_bots(&bots, scheduled, self.opts.schedule_limit_per_spec);
        let trigger_opts = TriggerOpts {
            cas_instance: self.opts.cas_instance.clone(),
            isolate_server: self.opts.isolate_server.clone(),
            pubsub_topic: self.opts.pubsub_topic.clone(),
        };
        let snapshot = self.task_cache.snapshot();
        let drained = drain::drain(
            &self.store,
            &self.pool,
            &self.uploader,
            &snapshot,
            &trigger_opts,
            match_outcome.matched,
        )
        .await?;
        if !drained.triggered.is_empty() {
            tracing::info!("triggered {} tasks", drained.triggered.len());
        }

        // Everything that was scored but not triggered stays queued.
        let mut queue = match_outcome.unmatched;
        queue.extend(drained.failed);
        queue.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id().cmp(&b.id()))
        });

        self.task_cache.update(window_start).await?;

        conveyor_metrics::set_queue_length(queue.len());
        {
            let mut q = self.queue.write().await;
            *q = queue;
            *self.rejected.write().await = rejected;
            *self.last_scheduled.write().await = Some(Utc::now());
        }
        Ok(())
    }

    /// Fetch fresh snapshots of every configured repo, apply them to the
    /// commit graphs and recompute the window. Returns newly seen commit
    /// hashes per repo. A repo whose source fails is skipped for this
    /// iteration.
    async fn refresh_repos(&self) -> SchedulerResult<HashMap<String, Vec<String>>> {
        let mut new_commits = HashMap::new();
        for repo in &self.opts.repos {
            let snapshot = match self.commits.fetch(repo).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::warn!("commit source failed for {repo}: {e}");
                    continue;
                }
            };
            let mut graph = self
                .graphs
                .read()
                .expect("graphs lock poisoned")
                .get(repo)
                .map(|g| (**g).clone())
                .unwrap_or_else(|| CommitGraph::new(repo.clone()));
            let added = graph.apply(snapshot);
            self.graphs
                .write()
                .expect("graphs lock poisoned")
                .insert(repo.clone(), Arc::new(graph));
            new_commits.insert(repo.clone(), added);
        }

        let graphs = self.graphs_snapshot();
        let mut window = Window::new(self.opts.window_duration, self.opts.window_commit_count);
        window.update(Utc::now(), &graphs);
        *self.window.write().expect("window lock poisoned") = Arc::new(window);
        Ok(new_commits)
    }

    /// Poll the worker pool for the status of every unfinished task: one
    /// bulk query per pool, plus an individual fallback for stragglers the
    /// bulk queries missed.
    async fn poll_pool_status(&self) -> SchedulerResult<usize> {
        let snapshot = self.task_cache.snapshot();
        let unfinished: Vec<Task> = snapshot.unfinished().into_iter().cloned().collect();
        if unfinished.is_empty() {
            return Ok(0);
        }
        let earliest = unfinished
            .iter()
            .map(|t| t.created)
            .min()
            .expect("unfinished is non-empty")
            - chrono::Duration::minutes(10);
        let now = Utc::now();

        let mut bulk: JoinSet<Vec<PoolTaskResult>> = JoinSet::new();
        for pool_name in &self.opts.pools {
            let pool = self.pool.clone();
            let tags = vec![SCHEDULER_TAG.to_string(), format!("pool:{pool_name}")];
            bulk.spawn(async move {
                match pool.list_tasks(earliest, now, &tags).await {
                    Ok(results) => results,
                    Err(e) => {
                        tracing::warn!("bulk task status query failed: {e}");
                        Vec::new()
                    }
                }
            });
        }
        let mut results: HashMap<String, PoolTaskResult> = HashMap::new();
        while let Some(joined) = bulk.join_next().await {
            if let Ok(batch) = joined {
                for result in batch {
                    results.insert(result.id.clone(), result);
                }
            }
        }

        // Individual fallback for anything the bulk queries missed.
        let mut stragglers: JoinSet<Option<PoolTaskResult>> = JoinSet::new();
        for task in &unfinished {
            if task.worker_task_id.is_empty() || results.contains_key(&task.worker_task_id) {
                continue;
            }
            let pool = self.pool.clone();
            let worker_id = task.worker_task_id.clone();
            stragglers.spawn(async move {
                match pool.get_task_status(&worker_id).await {
                    Ok(result) => Some(result),
                    Err(e) => {
                        tracing::warn!("status query for {worker_id} failed: {e}");
                        None
                    }
                }
            });
        }
        while let Some(joined) = stragglers.join_next().await {
            if let Ok(Some(result)) = joined {
                results.insert(result.id.clone(), result);
            }
        }

        let mut changed = Vec::new();
        for mut task in unfinished {
            if let Some(result) = results.get(&task.worker_task_id) {
                if apply_pool_result(&mut task, result) {
                    changed.push(task);
                }
            }
        }
        let count = changed.len();
        if !changed.is_empty() {
            self.store.put_tasks(&changed).await?;
        }
        Ok(count)
    }

    async fn update_job_statuses(&self, window_start: DateTime<Utc>) -> SchedulerResult<()> {
        let tasks = self.task_cache.snapshot();
        let jobs_snapshot = self.job_cache.snapshot();
        let now = Utc::now();
        let mut cfgs: HashMap<RepoState, Option<Arc<TasksCfg>>> = HashMap::new();
        let mut changed = Vec::new();
        for job in jobs_snapshot.unfinished() {
            // Retry exhaustion depends on the per-spec attempt budget, so
            // resolve the task config at the job's repo state.
            let cfg = match cfgs.get(&job.repo_state) {
                Some(cached) => cached.clone(),
                None => {
                    let resolved = match self.config.tasks_cfg(&job.repo_state).await {
                        Ok(cfg) => Some(cfg),
                        Err(e) => {
                            tracing::warn!(
                                "no task config for job {} at {}@{}: {e}",
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
            let status = jobs::derive_job_status(job, &cfg, &tasks);
            if status != job.status {
                let mut updated = job.clone();
                updated.status = status;
                if status.is_done() {
                    updated.finished = Some(now);
                }
                changed.push(updated);
            }
        }
        if !changed.is_empty() {
            tracing::info!("{} jobs changed status", changed.len());
            self.store.put_jobs(&changed).await?;
            self.job_cache.update(window_start).await?;
        }
        Ok(())
    }

    /// Generate, filter and score candidates. Scoring runs one unit per
    /// `(repo, task name)` group; every unit works on a private view of the
    /// shared snapshot.
    async fn regenerate_queue(
        &self,
        window: &Arc<Window>,
        graphs: &HashMap<String, Arc<CommitGraph>>,
    ) -> SchedulerResult<(Vec<Candidate>, Vec<Candidate>)> {
        let scoring_start = Instant::now();
        let job_snapshot = self.job_cache.snapshot();
        let unfinished: Vec<Job> = job_snapshot.unfinished().into_iter().cloned().collect();
        let generated = candidates::generate(unfinished, window, self.config.as_ref()).await;

        let task_snapshot = self.task_cache.snapshot();
        let blacklist = self.blacklist.read().expect("blacklist lock poisoned").clone();
        let ctx = FilterContext {
            snapshot: &task_snapshot,
            blacklist: &blacklist,
            window: window.as_ref(),
            graphs,
        };
        let mut rejected: Vec<Candidate> = Vec::new();
        let mut groups: HashMap<(String, String), Vec<Candidate>> = HashMap::new();
        for (_, mut candidate) in generated {
            if candidates::filter(&mut candidate, &ctx) {
                groups
                    .entry((candidate.repo().to_string(), candidate.name().to_string()))
                    .or_default()
                    .push(candidate);
            } else {
                rejected.push(candidate);
            }
        }

        let params = ScoreParams {
            now: Utc::now(),
            decay_amt: self.opts.time_decay_amt,
            score_threshold: self.opts.score_threshold,
        };
        let mut units: JoinSet<process::GroupOutcome> = JoinSet::new();
        for ((repo, _), group) in groups {
            let Some(graph) = graphs.get(&repo).cloned() else {
                rejected.extend(group);
                continue;
            };
            let snapshot = task_snapshot.clone();
            let window = window.clone();
            units.spawn(async move { process::score_group(group, snapshot, graph, window, params) });
        }
        let mut scheduled: Vec<Candidate> = Vec::new();
        while let Some(joined) = units.join_next().await {
            match joined {
                Ok(outcome) => {
                    scheduled.extend(outcome.scheduled);
                    rejected.extend(outcome.rejected);
                }
                Err(e) => tracing::error!("scoring unit panicked: {e}"),
            }
        }
        scheduled.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id().cmp(&b.id()))
        });
        conveyor_metrics::observe_scoring_duration(scoring_start.elapsed());
        Ok((scheduled, rejected))
    }

    async fn list_free_bots(&self) -> SchedulerResult<Vec<BotInfo>> {
        let mut units: JoinSet<SchedulerResult<Vec<BotInfo>>> = JoinSet::new();
        for pool_name in &self.opts.pools {
            let pool = self.pool.clone();
            let name = pool_name.clone();
            units.spawn(async move { Ok(pool.list_bots(&name).await?) });
        }
        let mut bots = Vec::new();
        while let Some(joined) = units.join_next().await {
            match joined {
                Ok(Ok(batch)) => bots.extend(batch.into_iter().filter(BotInfo::is_free)),
                Ok(Err(e)) => return Err(e),
                Err(e) => tracing::error!("bot listing unit panicked: {e}"),
            }
        }
        bots.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(bots)
    }

    /// Update a single task from a worker-pool completion notification.
    /// Returns false when the pool task is not one of ours.
    pub async fn update_from_pool(&self, worker_task_id: &str) -> SchedulerResult<bool> {
        let Some(mut task) = self.store.get_task_by_worker_id(worker_task_id).await? else {
            tracing::debug!("notification for unknown pool task {worker_task_id}");
            return Ok(false);
        };
        let result = self.pool.get_task_status(worker_task_id).await?;
        if apply_pool_result(&mut task, &result) {
            self.store.put_tasks(std::slice::from_ref(&task)).await?;
            let window_start = self.window_snapshot().earliest_start();
            self.task_cache.update(window_start).await?;
        }
        Ok(true)
    }

    /// Create a manually requested job. Its tasks are keyed by the job id,
    /// so they run even where regular tasks would deduplicate.
    pub async fn trigger_forced_job(
        &self,
        repo: &str,
        revision: &str,
        job_name: &str,
    ) -> SchedulerResult<Job> {
        let rs = RepoState::new(repo, revision);
        let cfg = self.config.tasks_cfg(&rs).await?;
        let dependencies = cfg.job_dependencies(job_name, &rs)?;
        let id = self.store.assign_id().await?;
        let mut job = Job::new(id, job_name, rs, dependencies, Utc::now());
        job.is_force = true;
        self.store.put_jobs(std::slice::from_ref(&job)).await?;
        let window_start = self.window_snapshot().earliest_start();
        self.job_cache.update(window_start).await?;
        tracing::info!("created forced job {} for {job_name} at {repo}@{revision}", job.id);
        Ok(job)
    }

    pub fn add_blacklist_rule(&self, rule: Rule) -> SchedulerResult<()> {
        self.blacklist
            .write()
            .expect("blacklist lock poisoned")
            .add_rule(rule)
    }

    pub fn remove_blacklist_rule(&self, name: &str) -> bool {
        self.blacklist
            .write()
            .expect("blacklist lock poisoned")
            .remove_rule(name)
    }

    pub fn blacklist_rules(&self) -> Vec<Rule> {
        self.blacklist
            .read()
            .expect("blacklist lock poisoned")
            .rules()
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn queue_view(&self) -> Vec<CandidateView> {
        self.queue.read().await.iter().map(Candidate::view).collect()
    }

    pub async fn rejected_view(&self) -> Vec<CandidateView> {
        self.rejected.read().await.iter().map(Candidate::view).collect()
    }

    pub async fn last_scheduled(&self) -> Option<DateTime<Utc>> {
        *self.last_scheduled.read().await
    }

    pub async fn get_task(&self, id: &str) -> SchedulerResult<Option<Task>> {
        Ok(self.store.get_task(id).await?)
    }

    pub async fn get_job(&self, id: &str) -> SchedulerResult<Option<Job>> {
        Ok(self.store.get_job(id).await?)
    }

    fn window_snapshot(&self) -> Arc<Window> {
        self.window.read().expect("window lock poisoned").clone()
    }

    fn graphs_snapshot(&self) -> HashMap<String, Arc<CommitGraph>> {
        self.graphs.read().expect("graphs lock poisoned").clone()
    }
}

/// Fold a pool-side status report into a task. Returns whether anything
/// changed.
fn apply_pool_result(task: &mut Task, result: &PoolTaskResult) -> bool {
    let mut changed = false;
    let status = result.task_status();
    if task.status != status {
        task.status = status;
        changed = true;
    }
    if result.started.is_some() && task.started != result.started {
        task.started = result.started;
        changed = true;
    }
    if status.is_done() && task.finished != result.completed {
        task.finished = result.completed;
        changed = true;
    }
    if !result.output_digest.is_empty() && task.isolated_output != result.output_digest {
        task.isolated_output = result.output_digest.clone();
        changed = true;
    }
    changed
}
