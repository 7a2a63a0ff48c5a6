use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use conveyor_pool::BotInfo;

use crate::candidates::Candidate;

/// Index from "key:value" dimension strings to the ids of free bots
/// providing them. Bot ids are kept ordered so ties resolve
/// deterministically.
struct BotIndex {
    dims: HashMap<String, BTreeSet<String>>,
}

impl BotIndex {
    fn new(bots: &[BotInfo]) -> Self {
        let mut dims: HashMap<String, BTreeSet<String>> = HashMap::new();
        for bot in bots {
            for dim in &bot.dimensions {
                for value in &dim.values {
                    dims.entry(format!("{}:{}", dim.key, value))
                        .or_default()
                        .insert(bot.id.clone());
                }
            }
        }
        Self { dims }
    }

    fn is_empty(&self) -> bool {
        self.dims.is_empty()
    }

    /// The lexicographically smallest bot providing every dimension, if any.
    fn find(&self, dimensions: &[String]) -> Option<String> {
        let mut iter = dimensions.iter();
        let first = iter.next()?;
        let mut matches: BTreeSet<String> = self.dims.get(first)?.clone();
        for dim in iter {
            let set = self.dims.get(dim)?;
            matches.retain(|id| set.contains(id));
            if matches.is_empty() {
                return None;
            }
        }
        matches.into_iter().next()
    }

    /// Remove a consumed bot from every dimension set, dropping dimensions
    /// that become empty.
    fn remove(&mut self, bot_id: &str) {
        self.dims.retain(|_, bots| {
            bots.remove(bot_id);
            !bots.is_empty()
        });
    }
}

pub(crate) struct MatchOutcome {
    pub matched: Vec<Candidate>,
    pub unmatched: Vec<Candidate>,
}

/// Match scored candidates (sorted by descending score) against the free
/// bots. Each candidate takes the smallest bot satisfying all of its
/// dimensions; matching stops when no bots remain. At most
/// `limit_per_spec` candidates of the same task-spec name match per
/// iteration. The matched list is re-sorted by descending score.
pub(crate) fn match_bots(
    bots: &[BotInfo],
    candidates: Vec<Candidate>,
    limit_per_spec: usize,
) -> MatchOutcome {
    let mut index = BotIndex::new(bots);
    let mut per_spec: HashMap<String, usize> = HashMap::new();
    let mut matched = Vec::new();
    let mut unmatched = Vec::new();

    for mut candidate in candidates {
        if index.is_empty() {
            candidate.diagnostics.matching = Some("no free bots remaining".to_string());
            unmatched.push(candidate);
            continue;
        }
        let count = per_spec.entry(candidate.name().to_string()).or_insert(0);
        if *count >= limit_per_spec {
            candidate.diagnostics.matching =
                Some(format!("per-spec limit of {limit_per_spec} reached"));
            unmatched.push(candidate);
            continue;
        }
        match index.find(&candidate.spec.dimensions) {
            Some(bot_id) => {
                index.remove(&bot_id);
                *count += 1;
                candidate.diagnostics.matching = Some(format!("matched bot {bot_id}"));
                matched.push(candidate);
            }
            None => {
                candidate.diagnostics.matching =
                    Some("no free bot satisfies the dimensions".to_string());
                unmatched.push(candidate);
            }
        }
    }

    // Stable, so equal scores keep their relative order.
    matched.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    MatchOutcome { matched, unmatched }
}
