// Plane-sweep filter engine.
//
// Reduces raw alignment collections to a high-confidence subset. Stages
// run in a fixed order: chain merge, weak-mapping removal, top-N group
// retention, overlap sparsification, and optional reciprocal-best
// selection. Every stage is a pure function of (records, config): no I/O,
// no hidden state, deterministic for identical input order.

use std::cmp::Ordering;
use std::collections::HashMap;

use rayon::prelude::*;

use crate::config::{FilterConfig, GroupBy};
use crate::record::{flags, AlignmentRecord};
use crate::stream::QueryAlignmentSet;

#[cfg(test)]
#[path = "sweep_test.rs"]
mod sweep_test;

/// Counters reported alongside filtered output.
#[derive(Debug, Default, Clone, Copy)]
pub struct FilterStats {
    pub input: usize,
    /// Structurally invalid records (end before start, out of bounds),
    /// dropped individually rather than aborting the run.
    pub dropped_invalid: usize,
    /// Records absorbed into a merged chain.
    pub merged_away: usize,
    pub dropped_weak: usize,
    pub dropped_by_limit: usize,
    pub dropped_by_overlap: usize,
    pub dropped_not_reciprocal: usize,
    pub kept: usize,
}

impl FilterStats {
    fn absorb(&mut self, other: FilterStats) {
        self.input += other.input;
        self.dropped_invalid += other.dropped_invalid;
        self.merged_away += other.merged_away;
        self.dropped_weak += other.dropped_weak;
        self.dropped_by_limit += other.dropped_by_limit;
        self.dropped_by_overlap += other.dropped_by_overlap;
        self.dropped_not_reciprocal += other.dropped_not_reciprocal;
        self.kept += other.kept;
    }
}

/// Total rank order used by the top-N, overlap, and reciprocal-best
/// stages: score descending, ties broken by larger block length, then
/// lower target start, then lower query start. Deterministic for any
/// input.
fn cmp_rank(a: &AlignmentRecord, b: &AlignmentRecord, config: &FilterConfig) -> Ordering {
    let sa = a.score(config.scoring);
    let sb = b.score(config.scoring);
    sb.partial_cmp(&sa)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.block_len().cmp(&a.block_len()))
        .then_with(|| a.target_start.cmp(&b.target_start))
        .then_with(|| a.query_start.cmp(&b.query_start))
}

/// Stage 1: merge collinear fragments for the same query/target/strand
/// whose gap in both coordinate spaces is within `chain_gap`.
///
/// The merged record spans the combined interval; its block length is the
/// sum of constituent block lengths plus gaps, its identity the
/// length-weighted average, and `merge_count` the number of fragments
/// absorbed.
pub fn merge_chains(
    records: Vec<AlignmentRecord>,
    config: &FilterConfig,
) -> (Vec<AlignmentRecord>, usize) {
    let mut groups: HashMap<(u32, u32, bool), Vec<AlignmentRecord>> = HashMap::new();
    let mut group_order = Vec::new();
    for rec in records {
        let key = (
            rec.query_id,
            rec.target_id,
            rec.strand == crate::record::Strand::Reverse,
        );
        let entry = groups.entry(key).or_default();
        if entry.is_empty() {
            group_order.push(key);
        }
        entry.push(rec);
    }

    let mut merged_away = 0;
    let mut out = Vec::new();
    for key in group_order {
        let mut group = groups.remove(&key).unwrap();
        group.sort_by(|a, b| {
            a.query_start
                .cmp(&b.query_start)
                .then_with(|| a.target_start.cmp(&b.target_start))
        });

        let mut iter = group.into_iter();
        let mut current = iter.next().unwrap();
        for next in iter {
            if chainable(&current, &next, config.chain_gap) {
                absorb(&mut current, &next);
                merged_away += 1;
            } else {
                out.push(current);
                current = next;
            }
        }
        out.push(current);
    }
    (out, merged_away)
}

// Gap between the two fragments in each coordinate space; overlapping
// fragments count as gap zero.
fn chainable(a: &AlignmentRecord, b: &AlignmentRecord, max_gap: u64) -> bool {
    let q_gap = b.query_start.saturating_sub(a.query_end);
    let t_gap = if b.target_start >= a.target_end {
        b.target_start - a.target_end
    } else if a.target_start >= b.target_end {
        a.target_start - b.target_end
    } else {
        0
    };
    q_gap <= max_gap && t_gap <= max_gap
}

fn absorb(current: &mut AlignmentRecord, next: &AlignmentRecord) {
    let gap = next.query_start.saturating_sub(current.query_end);
    let len_a = current.block_len();
    let len_b = next.block_len();
    let merged_block = len_a + gap + len_b;

    // Two zero-span fragments would leave the weighted average with a
    // zero denominator; fall back rather than let NaN into the scores.
    let identity = if len_a + len_b > 0 {
        (current.identity() * len_a as f64 + next.identity() * len_b as f64)
            / (len_a + len_b) as f64
    } else {
        current.identity()
    };

    current.query_start = current.query_start.min(next.query_start);
    current.query_end = current.query_end.max(next.query_end);
    current.target_start = current.target_start.min(next.target_start);
    current.target_end = current.target_end.max(next.target_end);
    current.diffs += next.diffs;
    current.stats.block_len = merged_block;
    current.stats.identity = identity;
    current.stats.merge_count += next.stats.merge_count;
}

/// Stage 3: keep the top `max_per_target` records per query/target pair,
/// then the top `max_per_query` per grouping key. A limit of 0 means
/// unlimited.
pub fn filter_top_n(
    mut records: Vec<AlignmentRecord>,
    config: &FilterConfig,
) -> (Vec<AlignmentRecord>, usize) {
    let before = records.len();

    if config.max_per_target > 0 {
        records = retain_top(records, config, config.max_per_target, |r| {
            (r.query_id as u64) << 32 | r.target_id as u64
        });
    }
    if config.max_per_query > 0 {
        let group_by = config.group_by;
        records = retain_top(records, config, config.max_per_query, move |r| match group_by {
            GroupBy::Query => r.query_id as u64,
            GroupBy::QueryTarget => (r.query_id as u64) << 32 | r.target_id as u64,
        });
    }

    let dropped = before - records.len();
    (records, dropped)
}

fn retain_top(
    records: Vec<AlignmentRecord>,
    config: &FilterConfig,
    limit: usize,
    key: impl Fn(&AlignmentRecord) -> u64,
) -> Vec<AlignmentRecord> {
    let mut groups: HashMap<u64, Vec<AlignmentRecord>> = HashMap::new();
    let mut order = Vec::new();
    for rec in records {
        let k = key(&rec);
        let entry = groups.entry(k).or_default();
        if entry.is_empty() {
            order.push(k);
        }
        entry.push(rec);
    }
    let mut out = Vec::new();
    for k in order {
        let mut group = groups.remove(&k).unwrap();
        group.sort_by(|a, b| cmp_rank(a, b, config));
        group.truncate(limit);
        out.extend(group);
    }
    out
}

/// Stage 4: overlap sparsification as a plane sweep over the query axis.
///
/// Candidates are processed in start-coordinate order while an active set
/// ordered by end coordinate is maintained. A record is suppressed iff
/// its fractional overlap with a higher-ranked active record exceeds
/// `max_overlap`; at exactly `max_overlap` it is retained. Expired
/// actives (end at or before the new start) are evicted as the sweep
/// advances.
pub fn sparsify_overlaps(
    records: Vec<AlignmentRecord>,
    config: &FilterConfig,
) -> (Vec<AlignmentRecord>, usize) {
    let mut candidates = records;
    candidates.sort_by(|a, b| {
        a.query_start
            .cmp(&b.query_start)
            .then_with(|| cmp_rank(a, b, config))
    });

    // Active set: (query_end, index into kept). Kept sorted on insert;
    // the set stays small because expired entries are evicted every step.
    let mut active: Vec<usize> = Vec::new();
    let mut kept: Vec<AlignmentRecord> = Vec::new();
    let mut suppressed = 0;

    for mut rec in candidates {
        active.retain(|&i| kept[i].query_end > rec.query_start);

        let span = rec.query_span().max(1) as f64;
        let dominated = active.iter().any(|&i| {
            let other = &kept[i];
            if cmp_rank(other, &rec, config) == Ordering::Less {
                let overlap_start = other.query_start.max(rec.query_start);
                let overlap_end = other.query_end.min(rec.query_end);
                let overlap = overlap_end.saturating_sub(overlap_start) as f64;
                overlap / span > config.max_overlap
            } else {
                false
            }
        });

        if dominated {
            rec.stats.flags |= flags::OVERLAPPED;
            suppressed += 1;
        } else {
            active.push(kept.len());
            kept.push(rec);
        }
    }

    (kept, suppressed)
}

/// Stage 5: reciprocal-best (one-to-one) selection. A record survives iff
/// it is simultaneously the best-scoring mapping for its query among all
/// targets and for its target among all queries.
pub fn reciprocal_best(
    records: Vec<AlignmentRecord>,
    config: &FilterConfig,
) -> (Vec<AlignmentRecord>, usize) {
    let mut best_for_query: HashMap<u32, usize> = HashMap::new();
    let mut best_for_target: HashMap<u32, usize> = HashMap::new();

    for (i, rec) in records.iter().enumerate() {
        match best_for_query.get(&rec.query_id) {
            Some(&j) if cmp_rank(&records[j], rec, config) != Ordering::Greater => {}
            _ => {
                best_for_query.insert(rec.query_id, i);
            }
        }
        match best_for_target.get(&rec.target_id) {
            Some(&j) if cmp_rank(&records[j], rec, config) != Ordering::Greater => {}
            _ => {
                best_for_target.insert(rec.target_id, i);
            }
        }
    }

    let before = records.len();
    let kept: Vec<AlignmentRecord> = records
        .iter()
        .enumerate()
        .filter(|(i, rec)| {
            best_for_query.get(&rec.query_id) == Some(i)
                && best_for_target.get(&rec.target_id) == Some(i)
        })
        .map(|(_, rec)| rec.clone())
        .collect();
    let dropped = before - kept.len();
    (kept, dropped)
}

// Stages 1-4 for the records of one query. Output is in rank order.
fn filter_query_records(
    records: Vec<AlignmentRecord>,
    config: &FilterConfig,
) -> (Vec<AlignmentRecord>, FilterStats) {
    let mut stats = FilterStats {
        input: records.len(),
        ..FilterStats::default()
    };

    // Structurally invalid records are dropped with a count, not a hard
    // abort.
    let (valid, invalid): (Vec<_>, Vec<_>) = records
        .into_iter()
        .partition(|r| r.is_structurally_valid());
    stats.dropped_invalid = invalid.len();
    for rec in &invalid {
        log::debug!(
            "dropping structurally invalid record: q{} {}..{} t{} {}..{}",
            rec.query_id,
            rec.query_start,
            rec.query_end,
            rec.target_id,
            rec.target_start,
            rec.target_end
        );
    }

    let (merged, merged_away) = merge_chains(valid, config);
    stats.merged_away = merged_away;

    let before_weak = merged.len();
    let strong: Vec<_> = merged
        .into_iter()
        .filter(|r| r.block_len() >= config.min_length && r.identity() >= config.min_identity)
        .collect();
    stats.dropped_weak = before_weak - strong.len();

    let (topped, dropped_by_limit) = filter_top_n(strong, config);
    stats.dropped_by_limit = dropped_by_limit;

    let (mut kept, dropped_by_overlap) = sparsify_overlaps(topped, config);
    stats.dropped_by_overlap = dropped_by_overlap;

    kept.sort_by(|a, b| cmp_rank(a, b, config));
    stats.kept = kept.len();
    (kept, stats)
}

/// Filter one streamed query set in place (stages 1-4; reciprocal-best
/// needs cross-query state, see [`ReciprocalBestPass`]).
pub fn filter_query_set(
    set: &mut QueryAlignmentSet,
    config: &FilterConfig,
) -> FilterStats {
    let records = std::mem::take(&mut set.records);
    let (kept, stats) = filter_query_records(records, config);
    set.records = kept;
    stats
}

/// Filter a bulk record collection: query-local stages run per query (in
/// parallel for large inputs), then the optional reciprocal-best pass
/// runs over the aggregate.
pub fn filter_records(
    records: Vec<AlignmentRecord>,
    config: &FilterConfig,
) -> (Vec<AlignmentRecord>, FilterStats) {
    // Partition by query, preserving first-appearance order so the result
    // is deterministic.
    let mut groups: HashMap<u32, Vec<AlignmentRecord>> = HashMap::new();
    let mut order = Vec::new();
    for rec in records {
        let entry = groups.entry(rec.query_id).or_default();
        if entry.is_empty() {
            order.push(rec.query_id);
        }
        entry.push(rec);
    }

    let mut per_query: Vec<Vec<AlignmentRecord>> = order
        .iter()
        .map(|q| groups.remove(q).unwrap())
        .collect();

    let results: Vec<(Vec<AlignmentRecord>, FilterStats)> = per_query
        .par_drain(..)
        .map(|group| filter_query_records(group, config))
        .collect();

    let mut stats = FilterStats::default();
    let mut out = Vec::new();
    for (kept, s) in results {
        stats.absorb(s);
        out.extend(kept);
    }

    if config.reciprocal_best {
        let (kept, dropped) = reciprocal_best(out, config);
        stats.dropped_not_reciprocal = dropped;
        stats.kept -= dropped;
        out = kept;
    }

    (out, stats)
}

/// Cross-query state for reciprocal-best selection over a stream of
/// per-query results. Query-local filtering happens as sets arrive; this
/// pass buffers the survivors and finalizes once the stream ends, being
/// the only filter requiring state across queries.
#[derive(Debug, Default)]
pub struct ReciprocalBestPass {
    accumulated: Vec<AlignmentRecord>,
}

impl ReciprocalBestPass {
    pub fn new() -> Self {
        ReciprocalBestPass::default()
    }

    /// Add one query's already-filtered records.
    pub fn push_query(&mut self, records: Vec<AlignmentRecord>) {
        self.accumulated.extend(records);
    }

    /// Finish: apply reciprocal-best over everything accumulated.
    pub fn finalize(self, config: &FilterConfig) -> (Vec<AlignmentRecord>, usize) {
        reciprocal_best(self.accumulated, config)
    }
}
