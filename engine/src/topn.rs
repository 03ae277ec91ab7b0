//! Bounded top-N accumulation and cross-partition merge.
//!
//! Each scanned partition feeds its entries through one accumulator holding
//! at most N candidates in a min-heap; the per-partition survivors are then
//! merged, sorted and truncated globally. Ties are broken by identifier so
//! repeated calls over an unchanged store return the same order.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

/// Raw similarity for a candidate vector, bound to a fixed query.
pub type ScoreFn<'a> = &'a (dyn Fn(&[f32]) -> f64 + Sync);

/// Caller-supplied score adjustment per identifier; `None` excludes the
/// candidate outright.
pub type RescoreFn<'a> = &'a (dyn Fn(&str, f64) -> Option<f64> + Sync);

/// Pre-filter over identifiers, e.g. "not already known to this user".
pub type AllowFn<'a> = &'a (dyn Fn(&str) -> bool + Sync);

#[derive(Debug, PartialEq)]
struct ScoredItem {
    score: f64,
    id: String,
}

impl Eq for ScoredItem {}

impl Ord for ScoredItem {
    /// Score ascending; among equal scores the lexicographically larger id
    /// is "smaller" so it is evicted first, which keeps the retained set
    /// deterministic.
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for ScoredItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Keeps the best `how_many` scored candidates seen so far.
pub struct TopNAccumulator<'a> {
    how_many: usize,
    heap: BinaryHeap<Reverse<ScoredItem>>,
    score_fn: ScoreFn<'a>,
    rescore_fn: Option<RescoreFn<'a>>,
    allowed_fn: AllowFn<'a>,
}

impl<'a> TopNAccumulator<'a> {
    pub fn new(
        how_many: usize,
        score_fn: ScoreFn<'a>,
        rescore_fn: Option<RescoreFn<'a>>,
        allowed_fn: AllowFn<'a>,
    ) -> Self {
        Self {
            how_many,
            heap: BinaryHeap::with_capacity(how_many + 1),
            score_fn,
            rescore_fn,
            allowed_fn,
        }
    }

    /// Consider one candidate: pre-filter, score, rescore, then keep it if
    /// it beats the current N-th best.
    pub fn offer(&mut self, id: &str, vector: &[f32]) {
        if !(self.allowed_fn)(id) {
            return;
        }
        let raw = (self.score_fn)(vector);
        let score = match self.rescore_fn {
            Some(rescore) => match rescore(id, raw) {
                Some(adjusted) => adjusted,
                None => return,
            },
            None => raw,
        };

        let candidate = ScoredItem {
            score,
            id: id.to_owned(),
        };
        if self.heap.len() < self.how_many {
            self.heap.push(Reverse(candidate));
        } else if self
            .heap
            .peek()
            .is_some_and(|Reverse(worst)| candidate > *worst)
        {
            self.heap.pop();
            self.heap.push(Reverse(candidate));
        }
    }

    /// Retained candidates, best first.
    pub fn into_sorted_vec(self) -> Vec<(String, f64)> {
        let mut items: Vec<ScoredItem> = self.heap.into_iter().map(|Reverse(item)| item).collect();
        items.sort_by(|a, b| b.cmp(a));
        items.into_iter().map(|item| (item.id, item.score)).collect()
    }
}

/// Merge per-partition top-N lists into the global top `how_many`,
/// descending by score with identifier tiebreak.
pub fn merge_top_n(
    per_partition: Vec<Vec<(String, f64)>>,
    how_many: usize,
) -> Vec<(String, f64)> {
    let mut merged: Vec<(String, f64)> = per_partition.into_iter().flatten().collect();
    merged.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    merged.truncate(how_many);
    merged
}
