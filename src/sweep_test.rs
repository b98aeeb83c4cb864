use super::*;
use crate::config::ScorePolicy;
use crate::record::{RecordStats, Strand};

fn rec(
    query_id: u32,
    target_id: u32,
    query_start: u64,
    query_end: u64,
    identity: f64,
) -> AlignmentRecord {
    AlignmentRecord {
        query_id,
        query_start,
        query_end,
        target_id,
        target_start: query_start,
        target_end: query_end,
        strand: Strand::Forward,
        diffs: 0,
        query_len: 1_000_000,
        target_len: 1_000_000,
        stats: RecordStats {
            identity,
            block_len: query_end - query_start,
            ..RecordStats::default()
        },
    }
}

fn open_config() -> FilterConfig {
    FilterConfig {
        max_per_query: 0,
        max_per_target: 0,
        ..FilterConfig::default()
    }
}

#[test]
fn merges_nearby_fragments_on_the_same_pair() {
    let config = FilterConfig {
        chain_gap: 500,
        ..open_config()
    };
    let a = rec(0, 0, 0, 1000, 0.90);
    let b = rec(0, 0, 1200, 2200, 0.98);

    let (merged, merged_away) = merge_chains(vec![a, b], &config);
    assert_eq!(merged_away, 1);
    assert_eq!(merged.len(), 1);

    let m = &merged[0];
    assert_eq!(m.query_start, 0);
    assert_eq!(m.query_end, 2200);
    // Both blocks plus the 200 bp gap.
    assert_eq!(m.block_len(), 2200);
    assert_eq!(m.stats.merge_count, 2);
    // Length-weighted average of 0.90 and 0.98 over equal lengths.
    assert!((m.identity() - 0.94).abs() < 1e-9);
}

#[test]
fn zero_length_fragments_merge_without_nan() {
    let config = open_config();
    let a = rec(0, 0, 100, 100, 0.0);
    let b = rec(0, 0, 200, 200, 0.0);

    let (merged, merged_away) = merge_chains(vec![a, b], &config);
    assert_eq!(merged_away, 1);
    assert_eq!(merged.len(), 1);
    assert!(!merged[0].identity().is_nan());
    assert!(merged[0].score(ScorePolicy::IdentityLogLength).is_finite());
}

#[test]
fn distant_fragments_stay_separate() {
    let config = FilterConfig {
        chain_gap: 500,
        ..open_config()
    };
    let a = rec(0, 0, 0, 1000, 0.90);
    let b = rec(0, 0, 5000, 6000, 0.98);
    let (merged, merged_away) = merge_chains(vec![a, b], &config);
    assert_eq!(merged_away, 0);
    assert_eq!(merged.len(), 2);
}

#[test]
fn opposite_strands_never_merge() {
    let config = open_config();
    let a = rec(0, 0, 0, 1000, 0.90);
    let mut b = rec(0, 0, 1100, 2100, 0.98);
    b.strand = Strand::Reverse;
    let (merged, _) = merge_chains(vec![a, b], &config);
    assert_eq!(merged.len(), 2);
}

#[test]
fn top_n_keeps_the_best_by_score() {
    let config = FilterConfig {
        max_per_query: 2,
        max_per_target: 0,
        ..FilterConfig::default()
    };
    let records = vec![
        rec(0, 0, 0, 200, 0.80),
        rec(0, 1, 1000, 2000, 0.95),
        rec(0, 2, 3000, 3500, 0.99),
    ];
    let (kept, dropped) = filter_top_n(records, &config);
    assert_eq!(dropped, 1);
    let targets: Vec<u32> = kept.iter().map(|r| r.target_id).collect();
    assert!(targets.contains(&1) && targets.contains(&2));
}

#[test]
fn top_n_tie_break_is_deterministic() {
    let config = FilterConfig {
        max_per_query: 1,
        max_per_target: 0,
        ..FilterConfig::default()
    };
    // Identical score and block length; lower target start wins.
    let mut a = rec(0, 0, 0, 1000, 0.95);
    a.target_start = 9000;
    a.target_end = 10000;
    let mut b = rec(0, 1, 2000, 3000, 0.95);
    b.target_start = 100;
    b.target_end = 1100;

    let (kept, _) = filter_top_n(vec![a, b], &config);
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].target_start, 100);
}

#[test]
fn per_target_cap_applies_within_each_pair() {
    let config = FilterConfig {
        max_per_query: 0,
        max_per_target: 1,
        ..FilterConfig::default()
    };
    let records = vec![
        rec(0, 0, 0, 1000, 0.99),
        rec(0, 0, 5000, 5500, 0.90),
        rec(0, 1, 9000, 9800, 0.95),
    ];
    let (kept, dropped) = filter_top_n(records, &config);
    assert_eq!(dropped, 1);
    assert_eq!(kept.len(), 2);
}

#[test]
fn overlap_at_exactly_the_limit_is_retained() {
    let config = FilterConfig {
        max_overlap: 0.5,
        ..open_config()
    };
    let a = rec(0, 0, 0, 1000, 0.99);
    // Overlaps a by 250 of its 500 bp span: exactly 0.5, retained.
    let boundary = rec(0, 1, 750, 1250, 0.80);
    // Overlaps a by 400 of its 500 bp span: 0.8, suppressed.
    let dominated = rec(0, 2, 600, 1100, 0.80);

    let (kept, suppressed) = sparsify_overlaps(vec![a, boundary, dominated], &config);
    assert_eq!(suppressed, 1);
    let targets: Vec<u32> = kept.iter().map(|r| r.target_id).collect();
    assert_eq!(targets, vec![0, 1]);
}

#[test]
fn lower_ranked_record_does_not_suppress_a_better_one() {
    let config = FilterConfig {
        max_overlap: 0.25,
        ..open_config()
    };
    // The weaker record starts first; the stronger one overlapping it
    // heavily must still survive.
    let weak = rec(0, 0, 0, 1000, 0.70);
    let strong = rec(0, 1, 100, 1100, 0.99);
    let (kept, _) = sparsify_overlaps(vec![weak, strong], &config);
    assert!(kept.iter().any(|r| r.target_id == 1));
}

#[test]
fn reciprocal_best_requires_arg_max_on_both_sides() {
    let config = FilterConfig {
        reciprocal_best: true,
        ..open_config()
    };
    let records = vec![
        rec(0, 0, 0, 1000, 0.99),    // best for q0 and t0
        rec(0, 1, 2000, 3000, 0.90), // beaten on both sides
        rec(1, 0, 0, 1000, 0.80),    // best for neither
        rec(1, 1, 2000, 3000, 0.95), // best for q1 and t1
    ];
    let (kept, dropped) = reciprocal_best(records, &config);
    assert_eq!(dropped, 2);
    let pairs: Vec<(u32, u32)> = kept.iter().map(|r| (r.query_id, r.target_id)).collect();
    assert_eq!(pairs, vec![(0, 0), (1, 1)]);
}

#[test]
fn invalid_records_are_counted_not_fatal() {
    let config = open_config();
    let mut bad = rec(0, 0, 400, 500, 0.99);
    bad.query_start = 500;
    bad.query_end = 400;
    let good = rec(0, 1, 0, 1000, 0.95);

    let (kept, stats) = filter_records(vec![bad, good], &config);
    assert_eq!(stats.dropped_invalid, 1);
    assert_eq!(kept.len(), 1);
    assert_eq!(stats.kept, 1);
}

#[test]
fn weak_mappings_are_dropped_after_merging() {
    let config = FilterConfig {
        min_identity: 0.9,
        min_length: 300,
        ..open_config()
    };
    let records = vec![
        rec(0, 0, 0, 1000, 0.95),    // passes
        rec(0, 1, 2000, 2200, 0.99), // too short
        rec(0, 2, 4000, 5000, 0.70), // too divergent
    ];
    let (kept, stats) = filter_records(records, &config);
    assert_eq!(kept.len(), 1);
    assert_eq!(stats.dropped_weak, 2);
}

// The worked selection scenario: five candidate mappings for one query,
// cap three, identity x ln(length) scoring.
#[test]
fn ranked_selection_scenario() {
    let lengths = [200u64, 150, 900, 50, 300];
    let identities = [0.99, 0.80, 0.95, 0.99, 0.85];
    let config = FilterConfig {
        max_per_query: 3,
        max_per_target: 0,
        scoring: ScorePolicy::IdentityLogLength,
        ..FilterConfig::default()
    };

    let mut records = Vec::new();
    let mut cursor = 0u64;
    for (i, (&len, &id)) in lengths.iter().zip(&identities).enumerate() {
        records.push(rec(0, i as u32, cursor, cursor + len, id));
        cursor += len + 5000; // far enough apart that nothing merges or overlaps
    }

    let (kept, stats) = filter_records(records, &config);
    assert_eq!(stats.dropped_by_limit, 2);
    let kept_lengths: Vec<u64> = kept.iter().map(|r| r.block_len()).collect();
    assert_eq!(kept_lengths, vec![900, 200, 300]);
}

#[test]
fn filter_query_set_rewrites_records_in_place() {
    let config = FilterConfig {
        max_per_query: 1,
        max_per_target: 0,
        ..FilterConfig::default()
    };
    let mut set = crate::stream::QueryAlignmentSet {
        query_id: 0,
        query_name: "qA".to_string(),
        query_len: 1_000_000,
        records: vec![rec(0, 0, 0, 1000, 0.99), rec(0, 1, 5000, 5400, 0.80)],
    };
    let stats = filter_query_set(&mut set, &config);
    assert_eq!(set.records.len(), 1);
    assert_eq!(stats.kept, 1);
    assert_eq!(stats.dropped_by_limit, 1);
}

#[test]
fn reciprocal_pass_accumulates_across_queries() {
    let config = open_config();
    let mut pass = ReciprocalBestPass::new();
    pass.push_query(vec![rec(0, 0, 0, 1000, 0.99), rec(0, 1, 2000, 3000, 0.90)]);
    pass.push_query(vec![rec(1, 1, 0, 1000, 0.95)]);

    let (kept, dropped) = pass.finalize(&config);
    assert_eq!(dropped, 1);
    let pairs: Vec<(u32, u32)> = kept.iter().map(|r| (r.query_id, r.target_id)).collect();
    assert_eq!(pairs, vec![(0, 0), (1, 1)]);
}
