// Alignment record types shared by the codec, the streaming layer, and the
// filter engine. Records flow through the pipeline as owned values; nothing
// here is mutated across a concurrency boundary.

use crate::config::ScorePolicy;

/// Strand of an alignment. Always explicit, never inferred from
/// coordinate order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strand {
    Forward,
    Reverse,
}

impl Strand {
    pub fn as_char(self) -> char {
        match self {
            Strand::Forward => '+',
            Strand::Reverse => '-',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '+' => Some(Strand::Forward),
            '-' => Some(Strand::Reverse),
            _ => None,
        }
    }
}

/// Flag bits carried in [`RecordStats`].
pub mod flags {
    /// Record was marked for discard by a filter stage.
    pub const DISCARD: u8 = 1 << 0;
    /// Record was suppressed by overlap sparsification.
    pub const OVERLAPPED: u8 = 1 << 1;
}

/// Compact per-record statistics.
///
/// `identity` and `block_len` are populated from the source stream when
/// present; `merge_count` counts how many chain fragments were merged into
/// this record (1 = never merged).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordStats {
    pub identity: f64,
    pub block_len: u64,
    pub merge_count: u32,
    pub complexity: f64,
    pub flags: u8,
}

impl Default for RecordStats {
    fn default() -> Self {
        RecordStats {
            identity: 0.0,
            block_len: 0,
            merge_count: 1,
            complexity: 0.0,
            flags: 0,
        }
    }
}

/// One matched region between a query and a target sequence.
///
/// Coordinates are 0-based half-open and satisfy
/// `0 <= start <= end <= sequence_length` on both axes for any record the
/// pipeline emits. Sequence ids resolve through a `SequenceCatalog`.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentRecord {
    pub query_id: u32,
    pub query_start: u64,
    pub query_end: u64,
    pub target_id: u32,
    pub target_start: u64,
    pub target_end: u64,
    pub strand: Strand,
    /// Number of mismatches/edit differences reported by the aligner.
    pub diffs: u32,
    pub query_len: u64,
    pub target_len: u64,
    pub stats: RecordStats,
}

impl AlignmentRecord {
    /// Length of the aligned span on the query axis.
    pub fn query_span(&self) -> u64 {
        self.query_end - self.query_start
    }

    /// Length of the aligned span on the target axis.
    pub fn target_span(&self) -> u64 {
        self.target_end - self.target_start
    }

    /// Identity fraction. Uses the stored identity when the source stream
    /// carried one, otherwise derives it from the diff count.
    pub fn identity(&self) -> f64 {
        if self.stats.identity > 0.0 {
            return self.stats.identity;
        }
        let block = self.stats.block_len.max(self.query_span());
        if block == 0 {
            return 0.0;
        }
        let matches = block.saturating_sub(self.diffs as u64);
        matches as f64 / block as f64
    }

    /// Block length used for scoring; falls back to the query span when the
    /// source stream did not carry one.
    pub fn block_len(&self) -> u64 {
        if self.stats.block_len > 0 {
            self.stats.block_len
        } else {
            self.query_span()
        }
    }

    /// Score under the configured policy. The default policy is
    /// identity x ln(block length).
    pub fn score(&self, policy: ScorePolicy) -> f64 {
        match policy {
            ScorePolicy::IdentityLogLength => {
                let len = self.block_len().max(1) as f64;
                self.identity() * len.ln()
            }
            ScorePolicy::Identity => self.identity(),
            ScorePolicy::Length => self.block_len() as f64,
            ScorePolicy::Matches => {
                self.block_len().saturating_sub(self.diffs as u64) as f64
            }
        }
    }

    /// Structural validity: non-inverted intervals within sequence bounds.
    /// Invalid records are dropped (and counted) by the filter engine rather
    /// than aborting a whole run.
    pub fn is_structurally_valid(&self) -> bool {
        self.query_start <= self.query_end
            && self.query_end <= self.query_len
            && self.target_start <= self.target_end
            && self.target_end <= self.target_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(start: u64, end: u64, diffs: u32) -> AlignmentRecord {
        AlignmentRecord {
            query_id: 0,
            query_start: start,
            query_end: end,
            target_id: 0,
            target_start: start,
            target_end: end,
            strand: Strand::Forward,
            diffs,
            query_len: 10_000,
            target_len: 10_000,
            stats: RecordStats::default(),
        }
    }

    #[test]
    fn identity_derived_from_diffs() {
        let rec = record(0, 100, 5);
        assert!((rec.identity() - 0.95).abs() < 1e-9);
    }

    #[test]
    fn stored_identity_wins() {
        let mut rec = record(0, 100, 5);
        rec.stats.identity = 0.99;
        assert!((rec.identity() - 0.99).abs() < 1e-9);
    }

    #[test]
    fn score_is_identity_times_log_length() {
        let rec = record(0, 200, 0);
        let expected = 1.0 * (200f64).ln();
        assert!((rec.score(ScorePolicy::IdentityLogLength) - expected).abs() < 1e-9);
    }

    #[test]
    fn inverted_interval_is_invalid() {
        let mut rec = record(10, 100, 0);
        rec.query_start = 200;
        rec.query_end = 100;
        assert!(!rec.is_structurally_valid());
    }

    #[test]
    fn out_of_bounds_end_is_invalid() {
        let mut rec = record(0, 100, 0);
        rec.target_len = 50;
        assert!(!rec.is_structurally_valid());
    }

    #[test]
    fn strand_round_trip() {
        assert_eq!(Strand::from_char('+'), Some(Strand::Forward));
        assert_eq!(Strand::from_char('-'), Some(Strand::Reverse));
        assert_eq!(Strand::from_char('.'), None);
        assert_eq!(Strand::Reverse.as_char(), '-');
    }
}
