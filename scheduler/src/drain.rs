use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinSet;

use conveyor_lib::{id::is_candidate_id, repo::RepoState, subst::TaskVars, task::Task};
use conveyor_pool::{
    pool_priority, CasDigest, CasInput, InputRef, InputUploader, IsolatedInput, PoolClient,
    TaskSlice, TriggerRequest,
};
use conveyor_store::{Store, TaskCacheSnapshot};

use crate::{candidates::Candidate, SchedulerResult};

/// Tag attached to every triggered task so bulk status queries can find
/// this scheduler's tasks.
pub(crate) const SCHEDULER_TAG: &str = "conveyor:1";

#[derive(Debug, Clone, Default)]
pub(crate) struct TriggerOpts {
    /// CAS instance for input references; when empty, the legacy isolate
    /// form with `isolate_server` is used instead.
    pub cas_instance: String,
    pub isolate_server: String,
    pub pubsub_topic: String,
}

pub(crate) struct DrainOutcome {
    pub triggered: Vec<Task>,
    pub failed: Vec<Candidate>,
}

/// Drain the matched candidates: isolate inputs per repo state, trigger
/// each task on the worker pool, then persist the new tasks together with
/// the mutated blamelists of every stolen-from predecessor in one batch.
///
/// Isolate failures fail only their repo-state group and trigger failures
/// only their candidate; both are reported in `failed` and stay in the
/// queue. A store failure aborts the whole call before the queue shrinks.
pub(crate) async fn drain(
    store: &Arc<dyn Store>,
    pool: &Arc<dyn PoolClient>,
    uploader: &Arc<dyn InputUploader>,
    snapshot: &TaskCacheSnapshot,
    opts: &TriggerOpts,
    chosen: Vec<Candidate>,
) -> SchedulerResult<DrainOutcome> {
    let mut failed: Vec<Candidate> = Vec::new();

    // 1. Isolate inputs, one unit per repo state.
    let mut groups: HashMap<RepoState, Vec<Candidate>> = HashMap::new();
    for candidate in chosen {
        groups
            .entry(candidate.key.repo_state.clone())
            .or_default()
            .push(candidate);
    }
    let mut uploads: JoinSet<(Vec<Candidate>, Vec<Candidate>)> = JoinSet::new();
    for (rs, group) in groups {
        let uploader = uploader.clone();
        uploads.spawn(async move {
            let mut isolated = Vec::with_capacity(group.len());
            let mut group_failed = Vec::new();
            let mut group_error: Option<String> = None;
            for mut candidate in group {
                if let Some(error) = &group_error {
                    candidate.diagnostics.triggering = Some(error.clone());
                    group_failed.push(candidate);
                    continue;
                }
                match uploader.upload(&rs, &candidate.isolated_hashes).await {
                    Ok(digest) => {
                        candidate.isolated_input = Some(digest);
                        isolated.push(candidate);
                    }
                    Err(e) => {
                        let error = format!("input isolation failed: {e}");
                        tracing::warn!(
                            "isolation for {}@{} failed, skipping the group: {e}",
                            rs.repo,
                            rs.revision
                        );
                        candidate.diagnostics.triggering = Some(error.clone());
                        group_failed.push(candidate);
                        group_error = Some(error);
                    }
                }
            }
            (isolated, group_failed)
        });
    }
    let mut isolated: Vec<Candidate> = Vec::new();
    while let Some(result) = uploads.join_next().await {
        match result {
            Ok((ok, group_failed)) => {
                isolated.extend(ok);
                failed.extend(group_failed);
            }
            Err(e) => tracing::error!("isolation worker panicked: {e}"),
        }
    }
    // Restore the score order the queue established.
    isolated.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id().cmp(&b.id()))
    });

    // 2. Trigger each task, one unit per candidate.
    let mut triggers: JoinSet<(usize, Candidate, String, SchedulerResult<conveyor_pool::TriggerResponse>)> =
        JoinSet::new();
    for (idx, candidate) in isolated.into_iter().enumerate() {
        let task_id = store.assign_id().await?;
        let pool = pool.clone();
        let request = build_trigger_request(&candidate, &task_id, opts);
        triggers.spawn(async move {
            let result = pool.trigger_task(&request).await.map_err(Into::into);
            (idx, candidate, task_id, result)
        });
    }
    let mut triggered_slots: Vec<Option<(Candidate, String, conveyor_pool::TriggerResponse)>> =
        Vec::new();
    while let Some(result) = triggers.join_next().await {
        let (idx, mut candidate, task_id, outcome) = match result {
            Ok(v) => v,
            Err(e) => {
                tracing::error!("trigger worker panicked: {e}");
                continue;
            }
        };
        if triggered_slots.len() <= idx {
            triggered_slots.resize_with(idx + 1, || None);
        }
        match outcome {
            Ok(resp) => {
                conveyor_metrics::inc_tasks_triggered("success");
                triggered_slots[idx] = Some((candidate, task_id, resp));
            }
            Err(e) => {
                conveyor_metrics::inc_tasks_triggered("failure");
                tracing::warn!("failed to trigger {}: {e}", candidate.name());
                candidate.diagnostics.triggering = Some(format!("trigger failed: {e}"));
                failed.push(candidate);
            }
        }
    }

    // 3. Build the task records in score order so steal subtraction within
    // a group happens in the same order the scoring loop established.
    let mut new_tasks: Vec<Task> = Vec::new();
    let mut by_candidate_id: HashMap<String, usize> = HashMap::new();
    let mut stolen_preds: HashMap<String, Task> = HashMap::new();
    for slot in triggered_slots.into_iter().flatten() {
        let (candidate, task_id, resp) = slot;
        let mut task = Task::new(task_id, candidate.key.clone(), *resp.created());
        task.attempt = candidate.attempt;
        task.commits = candidate.commits.clone();
        task.retry_of = candidate.retry_of.clone();
        task.parent_task_ids = candidate.parent_task_ids.clone();
        task.isolated_input = candidate.isolated_input.clone().unwrap_or_default();
        task.worker_task_id = resp.task_id().clone();
        task.jobs = candidate.jobs.iter().map(|j| j.id.clone()).collect();

        if let Some(pred_id) = &candidate.stealing_from_id {
            subtract_stolen_commits(
                pred_id,
                &task,
                &by_candidate_id,
                &mut new_tasks,
                &mut stolen_preds,
                snapshot,
            );
        }

        by_candidate_id.insert(candidate.id(), new_tasks.len());
        new_tasks.push(task);
    }

    // 4. One batch: new tasks plus mutated predecessors.
    let mut batch = new_tasks.clone();
    batch.extend(stolen_preds.into_values());
    if !batch.is_empty() {
        store.put_tasks(&batch).await?;
    }

    Ok(DrainOutcome {
        triggered: new_tasks,
        failed,
    })
}

/// Remove a successor's commits from its predecessor, resolving the
/// predecessor from the just-inserted tasks, the pending batch, or the
/// cache, in that order.
fn subtract_stolen_commits(
    pred_id: &str,
    successor: &Task,
    by_candidate_id: &HashMap<String, usize>,
    new_tasks: &mut [Task],
    stolen_preds: &mut HashMap<String, Task>,
    snapshot: &TaskCacheSnapshot,
) {
    if is_candidate_id(pred_id) {
        // The predecessor was a peer candidate in this drain.
        match by_candidate_id.get(pred_id) {
            Some(&idx) => {
                new_tasks[idx]
                    .commits
                    .retain(|c| !successor.commits.contains(c));
            }
            None => tracing::warn!(
                "task {} steals from candidate {pred_id}, which was not triggered",
                successor.id
            ),
        }
        return;
    }
    if let Some(pred) = stolen_preds.get_mut(pred_id) {
        pred.commits.retain(|c| !successor.commits.contains(c));
        return;
    }
    match snapshot.get(pred_id) {
        Some(pred) => {
            let mut pred = pred.clone();
            pred.commits.retain(|c| !successor.commits.contains(c));
            stolen_preds.insert(pred_id.to_string(), pred);
        }
        None => tracing::warn!(
            "task {} steals from unknown task {pred_id}",
            successor.id
        ),
    }
}

fn build_trigger_request(
    candidate: &Candidate,
    task_id: &str,
    opts: &TriggerOpts,
) -> TriggerRequest {
    let spec = &candidate.spec;
    let vars = TaskVars::new(&candidate.key, task_id, "");

    let input = candidate.isolated_input.as_ref().map(|digest| {
        if opts.cas_instance.is_empty() {
            InputRef::Isolated(IsolatedInput {
                isolated: digest.clone(),
                server: opts.isolate_server.clone(),
                namespace: "default-gzip".to_string(),
            })
        } else {
            // CAS digests come back from the uploader as "hash/size".
            let (hash, size) = digest
                .split_once('/')
                .map(|(h, s)| (h.to_string(), s.parse().unwrap_or(0)))
                .unwrap_or_else(|| (digest.clone(), 0));
            InputRef::Cas(CasInput {
                instance: opts.cas_instance.clone(),
                digest: CasDigest {
                    hash,
                    size_bytes: size,
                },
            })
        }
    });

    let mut tags = vec![
        SCHEDULER_TAG.to_string(),
        format!("conveyor_id:{task_id}"),
        format!("name:{}", candidate.key.name),
        format!("repo:{}", candidate.key.repo_state.repo),
        format!("revision:{}", candidate.key.repo_state.revision),
        format!("attempt:{}", candidate.attempt),
    ];
    // Bulk status queries filter by pool, so mirror the pool dimension.
    if let Some(pool_dim) = spec.dimensions.iter().find(|d| d.starts_with("pool:")) {
        tags.push(pool_dim.clone());
    }
    for (key, value) in &spec.extra_tags {
        tags.push(format!("{key}:{}", vars.expand(value)));
    }

    TriggerRequest {
        name: candidate.key.name.clone(),
        priority: pool_priority(spec.priority),
        expiration_secs: spec.expiration_secs,
        slices: vec![TaskSlice {
            dimensions: spec.dimensions.clone(),
            env: spec.env.clone(),
            env_prefixes: spec.env_prefixes.clone(),
            command: vars.expand_all(&spec.command),
            extra_args: vars.expand_all(&spec.extra_args),
            caches: spec.caches.clone(),
            packages: spec.packages.clone(),
            input,
            idempotent: spec.idempotent,
            outputs: spec.outputs.clone(),
            execution_timeout_secs: spec.execution_timeout_secs,
            io_timeout_secs: spec.io_timeout_secs,
        }],
        tags,
        service_account: spec.service_account.clone(),
        pubsub_topic: opts.pubsub_topic.clone(),
        pubsub_userdata: task_id.to_string(),
    }
}
