use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use conveyor_lib::{graph::CommitGraph, window::Window};
use conveyor_store::TaskCacheSnapshot;

use crate::{
    blamelist,
    candidates::{Candidate, ScoringSnapshot},
    scoring::{
        hours_since, testedness_increase, time_decay_24hr, CANDIDATE_SCORE_FORCE_RUN,
        CANDIDATE_SCORE_TRY_JOB,
    },
    view::GroupView,
    SchedulerError, SchedulerResult,
};

#[derive(Debug, Clone, Copy)]
pub(crate) struct ScoreParams {
    pub now: DateTime<Utc>,
    pub decay_amt: f64,
    pub score_threshold: f64,
}

pub(crate) struct GroupOutcome {
    pub scheduled: Vec<Candidate>,
    pub rejected: Vec<Candidate>,
}

/// Score one `(repo, task name)` group of candidates against a private view
/// of the task cache. Iteratively: score everything, virtually commit the
/// best candidate into the view, rescore the rest. Which commits are still
/// untested depends on which peers are assumed scheduled, so a single pass
/// is not enough.
pub(crate) fn score_group(
    mut group: Vec<Candidate>,
    snapshot: Arc<TaskCacheSnapshot>,
    graph: Arc<CommitGraph>,
    window: Arc<Window>,
    params: ScoreParams,
) -> GroupOutcome {
    let mut scheduled = Vec::new();
    let mut rejected = Vec::new();
    let Some(first) = group.first() else {
        return GroupOutcome {
            scheduled,
            rejected,
        };
    };
    let mut view = GroupView::new(first.repo(), first.name(), snapshot);

    while !group.is_empty() {
        // Score every remaining candidate against the current view,
        // dropping the ones that violate local invariants.
        let mut survivors: Vec<Candidate> = Vec::with_capacity(group.len());
        for mut candidate in group.drain(..) {
            match process_candidate(&mut candidate, &view, &graph, &window, params) {
                Ok(()) => survivors.push(candidate),
                Err(e) => {
                    tracing::warn!(
                        "dropping candidate {} at {}: {e}",
                        candidate.name(),
                        candidate.revision()
                    );
                    candidate.diagnostics.scoring = None;
                    candidate.diagnostics.filtering = Some(e.to_string());
                    conveyor_metrics::inc_candidates_filtered("invariant");
                    rejected.push(candidate);
                }
            }
        }
        if survivors.is_empty() {
            break;
        }

        // Pick the best; ties break on the candidate id for determinism.
        let best_idx = survivors
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                a.score
                    .partial_cmp(&b.score)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| b.id().cmp(&a.id()))
            })
            .map(|(i, _)| i)
            .expect("survivors is non-empty");
        let best = survivors.swap_remove(best_idx);

        if best.score <= params.score_threshold {
            // Nothing left worth scheduling; nothing is committed into the
            // view, so the remaining scores cannot change either.
            let mut below = best;
            below
                .diagnostics
                .filtering
                .get_or_insert_with(|| format!("score {} below threshold", below.score));
            rejected.push(below);
            for mut candidate in survivors {
                candidate
                    .diagnostics
                    .filtering
                    .get_or_insert_with(|| format!("score {} below threshold", candidate.score));
                rejected.push(candidate);
            }
            break;
        }

        view.commit_candidate(&best);
        scheduled.push(best);
        group = survivors;
    }

    GroupOutcome {
        scheduled,
        rejected,
    }
}

/// Compute one candidate's blamelist and score against the given view.
fn process_candidate(
    candidate: &mut Candidate,
    view: &GroupView,
    graph: &CommitGraph,
    window: &Window,
    params: ScoreParams,
) -> SchedulerResult<()> {
    // Try jobs test a patch, not landed commits: no blamelist, priority by
    // job age alone.
    if candidate.is_try_job() {
        candidate.commits.clear();
        candidate.stealing_from_id = None;
        candidate.score = CANDIDATE_SCORE_TRY_JOB + candidate_age_hours(candidate, params.now);
        return Ok(());
    }

    let blamelist = blamelist::compute(view, graph, window, candidate.revision())?;
    candidate.commits = blamelist.commits;
    candidate.stealing_from_id = blamelist.steal_from.as_ref().map(|t| t.id.clone());

    if candidate.is_forced() {
        candidate.score = CANDIDATE_SCORE_FORCE_RUN + candidate_age_hours(candidate, params.now);
        return Ok(());
    }

    let stole_from_length = match (&candidate.retry_of, &blamelist.steal_from) {
        // A retry is scored as if its commits were untested, provided the
        // steal target is the task being retried.
        (Some(retry_of), Some(prior)) if *retry_of == prior.id => 0,
        (Some(retry_of), Some(prior)) => {
            return Err(SchedulerError::Invariant(format!(
                "candidate retries {retry_of} but steals from {}",
                prior.id
            )));
        }
        (Some(_), None) => 0,
        (None, Some(prior)) => prior.commits.len(),
        (None, None) => 0,
    };

    let increase =
        testedness_increase(candidate.commits.len() as i64, stole_from_length as i64);
    let age = revision_age(candidate, graph, params.now);
    let decay = time_decay_24hr(params.decay_amt, age);
    candidate.score = increase * decay;
    candidate.diagnostics.scoring = Some(ScoringSnapshot {
        blamelist_length: candidate.commits.len(),
        stole_from_length,
        testedness_increase: increase,
        decay,
    });
    Ok(())
}

fn candidate_age_hours(candidate: &Candidate, now: DateTime<Utc>) -> f64 {
    candidate
        .earliest_job_created()
        .map(|created| hours_since(now - created))
        .unwrap_or(0.0)
}

fn revision_age(candidate: &Candidate, graph: &CommitGraph, now: DateTime<Utc>) -> chrono::Duration {
    match graph.get(candidate.revision()) {
        Some(commit) => now - commit.timestamp,
        None => chrono::Duration::zero(),
    }
}
