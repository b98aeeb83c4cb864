// Configuration for pipeline invocations and the filter engine.
//
// Both config types are immutable once built: every pipeline invocation
// takes an owned or shared reference and never mutates it.

use std::path::PathBuf;
use std::time::Duration;

use crate::defaults;

/// Output format requested from the external aligner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// PAF with extended CIGAR using 'X' for mismatches (default)
    PafWithX,
    /// PAF with CIGAR using 'M' operators
    PafWithM,
    /// PAF with CS string in short form
    PafShort,
    /// PAF with CS string in long form
    PafLong,
    /// PSL format
    Psl,
}

impl OutputFormat {
    /// The flag the external aligner expects for this format.
    pub fn aligner_flag(self) -> &'static str {
        match self {
            OutputFormat::PafWithX => "-pafx",
            OutputFormat::PafWithM => "-pafm",
            OutputFormat::PafShort => "-pafs",
            OutputFormat::PafLong => "-pafS",
            OutputFormat::Psl => "-psl",
        }
    }
}

/// Immutable configuration for one pipeline invocation.
///
/// # Default Values
/// - `min_alignment_length`: 100 bp
/// - `min_identity`: None (no filtering)
/// - `num_threads`: available parallelism
/// - `frequency`: 10 (k-mer frequency threshold)
/// - `timeout`: None (stages run without a deadline)
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Minimum alignment length in base pairs
    pub min_alignment_length: usize,

    /// Minimum identity fraction (0.0-1.0) for alignments
    pub min_identity: Option<f64>,

    /// Number of threads the external aligner may use
    pub num_threads: usize,

    /// K-mer frequency threshold for index construction
    pub frequency: usize,

    /// Adaptive seed count cutoff (-f)
    pub adaptive_seed_cutoff: Option<usize>,

    /// Minimum seed chain coverage in both genomes (-c), as a fraction
    pub min_chain_coverage: Option<f64>,

    /// Threshold for starting a new seed chain (-s)
    pub chain_start_threshold: Option<usize>,

    /// Treat lowercase sequence as masked
    pub soft_masking: bool,

    /// Use symmetric seeding (not recommended)
    pub symmetric_seeding: bool,

    /// Keep intermediate databases/indices after the run
    pub keep_intermediates: bool,

    /// Verbose flag passed through to the external processes
    pub verbose: bool,

    /// Working directory for temp artifacts; None = system temp
    pub temp_dir: Option<PathBuf>,

    /// Aligner log file (-L:)
    pub log_file: Option<PathBuf>,

    /// Output format variant
    pub output_format: OutputFormat,

    /// Per-stage wall-clock limit. On expiry the child process is killed
    /// and the invocation fails with a timeout error naming the stage.
    pub timeout: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            min_alignment_length: defaults::MIN_ALIGNMENT_LENGTH,
            min_identity: None,
            num_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            frequency: defaults::KMER_FREQUENCY,
            adaptive_seed_cutoff: None,
            min_chain_coverage: None,
            chain_start_threshold: None,
            soft_masking: true,
            symmetric_seeding: false,
            keep_intermediates: false,
            verbose: false,
            temp_dir: None,
            log_file: None,
            output_format: OutputFormat::PafWithX,
            timeout: None,
        }
    }
}

impl PipelineConfig {
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    /// High-sensitivity preset for distant homologs.
    pub fn high_sensitivity() -> Self {
        PipelineConfig {
            min_alignment_length: 50,
            min_identity: None,
            chain_start_threshold: Some(100),
            ..Default::default()
        }
    }

    /// Fast preset for closely related genomes.
    pub fn fast() -> Self {
        PipelineConfig {
            min_alignment_length: 200,
            min_identity: Some(0.9),
            chain_start_threshold: Some(250),
            frequency: 20,
            ..Default::default()
        }
    }

    /// Preset for repetitive genomes: ignore common k-mers, chain strictly.
    pub fn repetitive_genomes() -> Self {
        PipelineConfig {
            frequency: 50,
            chain_start_threshold: Some(200),
            min_chain_coverage: Some(0.9),
            ..Default::default()
        }
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug, Default)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    /// Alignments shorter than this are filtered by the aligner itself.
    pub fn min_alignment_length(mut self, length: usize) -> Self {
        self.config.min_alignment_length = length;
        self
    }

    /// Minimum identity fraction, 0.0-1.0.
    pub fn min_identity(mut self, identity: f64) -> Self {
        assert!(
            (0.0..=1.0).contains(&identity),
            "identity must be between 0.0 and 1.0"
        );
        self.config.min_identity = Some(identity);
        self
    }

    pub fn num_threads(mut self, threads: usize) -> Self {
        assert!(threads > 0, "number of threads must be positive");
        self.config.num_threads = threads;
        self
    }

    pub fn frequency(mut self, freq: usize) -> Self {
        self.config.frequency = freq;
        self
    }

    pub fn adaptive_seed_cutoff(mut self, cutoff: usize) -> Self {
        self.config.adaptive_seed_cutoff = Some(cutoff);
        self
    }

    pub fn min_chain_coverage(mut self, coverage: f64) -> Self {
        self.config.min_chain_coverage = Some(coverage);
        self
    }

    pub fn chain_start_threshold(mut self, threshold: usize) -> Self {
        self.config.chain_start_threshold = Some(threshold);
        self
    }

    pub fn soft_masking(mut self, enabled: bool) -> Self {
        self.config.soft_masking = enabled;
        self
    }

    pub fn symmetric_seeding(mut self, symmetric: bool) -> Self {
        self.config.symmetric_seeding = symmetric;
        self
    }

    pub fn keep_intermediates(mut self, keep: bool) -> Self {
        self.config.keep_intermediates = keep;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.config.verbose = verbose;
        self
    }

    pub fn temp_dir(mut self, path: PathBuf) -> Self {
        self.config.temp_dir = Some(path);
        self
    }

    pub fn log_file(mut self, path: PathBuf) -> Self {
        self.config.log_file = Some(path);
        self
    }

    pub fn output_format(mut self, format: OutputFormat) -> Self {
        self.config.output_format = format;
        self
    }

    /// Wall-clock limit applied to every external stage.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> PipelineConfig {
        self.config
    }
}

/// Scoring policy used by the top-N and reciprocal-best filters.
///
/// The source material only pins down "identity x log(length)", so the
/// policy is configurable; `IdentityLogLength` is the documented default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScorePolicy {
    #[default]
    IdentityLogLength,
    Identity,
    Length,
    Matches,
}

/// Grouping key for the top-N filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupBy {
    #[default]
    Query,
    QueryTarget,
}

/// Immutable configuration for the plane-sweep filter engine.
#[derive(Debug, Clone)]
pub struct FilterConfig {
    /// Merge records for the same query/target pair whose gap (in either
    /// coordinate space) is within this distance.
    pub chain_gap: u64,

    /// Maximum alignments to keep per query (0 = unlimited)
    pub max_per_query: usize,

    /// Maximum alignments to keep per query-target pair (0 = unlimited)
    pub max_per_target: usize,

    /// Minimum identity after chain merging
    pub min_identity: f64,

    /// Minimum merged length
    pub min_length: u64,

    /// Fractional overlap above which a lower-ranked record is suppressed.
    /// A record at exactly this overlap is retained.
    pub max_overlap: f64,

    /// Keep only mappings that are best for both their query and target
    pub reciprocal_best: bool,

    /// Grouping key for the top-N filter
    pub group_by: GroupBy,

    /// Score used for ranking
    pub scoring: ScorePolicy,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            chain_gap: defaults::CHAIN_GAP,
            max_per_query: defaults::MAX_PER_QUERY,
            max_per_target: defaults::MAX_PER_TARGET,
            min_identity: 0.0,
            min_length: 0,
            max_overlap: defaults::MAX_OVERLAP,
            reciprocal_best: false,
            group_by: GroupBy::Query,
            scoring: ScorePolicy::IdentityLogLength,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Every knob a preset tunes must be one the driver passes to the
    // external tools; presets must not differ only in dead fields.
    #[test]
    fn presets_tune_mapped_aligner_knobs() {
        let hs = PipelineConfig::high_sensitivity();
        assert_eq!(hs.min_alignment_length, 50);
        assert_eq!(hs.chain_start_threshold, Some(100));

        let fast = PipelineConfig::fast();
        assert_eq!(fast.min_alignment_length, 200);
        assert_eq!(fast.min_identity, Some(0.9));
        assert_eq!(fast.frequency, 20);
        assert_eq!(fast.chain_start_threshold, Some(250));

        let rep = PipelineConfig::repetitive_genomes();
        assert_eq!(rep.frequency, 50);
        assert_eq!(rep.min_chain_coverage, Some(0.9));
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = PipelineConfig::builder()
            .min_alignment_length(150)
            .frequency(30)
            .chain_start_threshold(300)
            .build();
        assert_eq!(config.min_alignment_length, 150);
        assert_eq!(config.frequency, 30);
        assert_eq!(config.chain_start_threshold, Some(300));
        assert!(config.timeout.is_none());
    }
}
