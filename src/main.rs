use clap::{Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use alnsweep::config::{FilterConfig, GroupBy, OutputFormat, PipelineConfig, ScorePolicy};
use alnsweep::paf::{self, PafParser};
use alnsweep::record::AlignmentRecord;
use alnsweep::{AlnReader, AlnWriter, Pipeline, SequenceCatalog};

#[derive(Parser)]
#[command(name = "alnsweep")]
#[command(about = "Genome alignment orchestration and plane-sweep filtering", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Align two genomes with the external FastGA toolchain
    Align {
        /// Query genome (FASTA, optionally gzipped)
        #[arg(value_name = "QUERY.FA")]
        query: PathBuf,

        /// Target genome (FASTA, optionally gzipped)
        #[arg(value_name = "TARGET.FA")]
        target: PathBuf,

        /// Output PAF file (default: stdout)
        #[arg(short = 'o', long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Also write a binary alignment container
        #[arg(long, value_name = "FILE.ALN")]
        aln: Option<PathBuf>,

        /// Number of threads for the aligner (0 = all cores)
        #[arg(short = 'T', long, value_name = "INT", default_value = "0")]
        threads: usize,

        /// Minimum alignment length
        #[arg(short = 'l', long, value_name = "INT", default_value = "100")]
        min_length: usize,

        /// Minimum identity fraction (0.0-1.0)
        #[arg(short = 'i', long, value_name = "FLOAT")]
        min_identity: Option<f64>,

        /// K-mer frequency threshold for index construction
        #[arg(short = 'f', long, value_name = "INT", default_value = "10")]
        frequency: usize,

        /// Output format: pafx, pafm, pafs, pafl, psl
        #[arg(long, value_name = "FMT", default_value = "pafx")]
        format: String,

        /// Wall-clock limit per stage, in seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,

        /// Keep intermediate databases and indices
        #[arg(short = 'k', long)]
        keep_intermediates: bool,

        /// Working directory for temp artifacts
        #[arg(short = 'P', long, value_name = "DIR")]
        temp_dir: Option<PathBuf>,

        /// Verbosity: 1=error, 2=warning, 3=info, 4=debug, 5+=trace
        #[arg(short = 'v', long, value_name = "INT", default_value_t = alnsweep::defaults::VERBOSITY)]
        verbosity: i32,
    },

    /// Filter alignments with the plane-sweep engine
    Filter {
        /// Input alignments: PAF file, binary .aln container, or '-' for stdin
        #[arg(value_name = "INPUT")]
        input: PathBuf,

        /// Output PAF file (default: stdout)
        #[arg(short = 'o', long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Merge fragments for the same pair within this gap
        #[arg(long, value_name = "INT", default_value = "2000")]
        chain_gap: u64,

        /// Keep at most INT mappings per query (0 = unlimited)
        #[arg(short = 'n', long, value_name = "INT", default_value = "100")]
        max_per_query: usize,

        /// Keep at most INT mappings per query-target pair (0 = unlimited)
        #[arg(long, value_name = "INT", default_value = "1")]
        max_per_target: usize,

        /// Drop merged mappings below this identity
        #[arg(short = 'i', long, value_name = "FLOAT", default_value = "0.0")]
        min_identity: f64,

        /// Drop merged mappings shorter than this
        #[arg(short = 'l', long, value_name = "INT", default_value = "0")]
        min_length: u64,

        /// Suppress mappings overlapping a better one by more than this fraction
        #[arg(long, value_name = "FLOAT", default_value = "0.5")]
        max_overlap: f64,

        /// Keep only reciprocal-best (one-to-one) mappings
        #[arg(long)]
        reciprocal: bool,

        /// Group the top-N cap per target as well as per query
        #[arg(long)]
        group_by_target: bool,

        /// Ranking score: identity-log-length, identity, length, matches
        #[arg(long, value_name = "POLICY", default_value = "identity-log-length")]
        scoring: String,

        /// Verbosity: 1=error, 2=warning, 3=info, 4=debug, 5+=trace
        #[arg(short = 'v', long, value_name = "INT", default_value_t = alnsweep::defaults::VERBOSITY)]
        verbosity: i32,
    },
}

fn init_logger(verbosity: i32) {
    let level = match verbosity {
        v if v <= 1 => log::LevelFilter::Error,
        2 => log::LevelFilter::Warn,
        3 => log::LevelFilter::Info,
        4 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .format_timestamp(None)
        .format_target(false)
        .init();
}

fn parse_format(name: &str) -> Result<OutputFormat, String> {
    match name {
        "pafx" => Ok(OutputFormat::PafWithX),
        "pafm" => Ok(OutputFormat::PafWithM),
        "pafs" => Ok(OutputFormat::PafShort),
        "pafl" => Ok(OutputFormat::PafLong),
        "psl" => Ok(OutputFormat::Psl),
        other => Err(format!("unknown output format {other:?}")),
    }
}

fn parse_scoring(name: &str) -> Result<ScorePolicy, String> {
    match name {
        "identity-log-length" => Ok(ScorePolicy::IdentityLogLength),
        "identity" => Ok(ScorePolicy::Identity),
        "length" => Ok(ScorePolicy::Length),
        "matches" => Ok(ScorePolicy::Matches),
        other => Err(format!("unknown scoring policy {other:?}")),
    }
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Align {
            query,
            target,
            output,
            aln,
            threads,
            min_length,
            min_identity,
            frequency,
            format,
            timeout,
            keep_intermediates,
            temp_dir,
            verbosity,
        } => {
            init_logger(verbosity);
            run_align(AlignArgs {
                query,
                target,
                output,
                aln,
                threads,
                min_length,
                min_identity,
                frequency,
                format,
                timeout,
                keep_intermediates,
                temp_dir,
                verbose: verbosity >= 4,
            })
        }
        Commands::Filter {
            input,
            output,
            chain_gap,
            max_per_query,
            max_per_target,
            min_identity,
            min_length,
            max_overlap,
            reciprocal,
            group_by_target,
            scoring,
            verbosity,
        } => {
            init_logger(verbosity);
            run_filter(FilterArgs {
                input,
                output,
                chain_gap,
                max_per_query,
                max_per_target,
                min_identity,
                min_length,
                max_overlap,
                reciprocal,
                group_by_target,
                scoring,
            })
        }
    };

    if let Err(e) = result {
        log::error!("{e:#}");
        std::process::exit(1);
    }
}

struct AlignArgs {
    query: PathBuf,
    target: PathBuf,
    output: Option<PathBuf>,
    aln: Option<PathBuf>,
    threads: usize,
    min_length: usize,
    min_identity: Option<f64>,
    frequency: usize,
    format: String,
    timeout: Option<u64>,
    keep_intermediates: bool,
    temp_dir: Option<PathBuf>,
    verbose: bool,
}

fn run_align(args: AlignArgs) -> anyhow::Result<()> {
    let mut builder = PipelineConfig::builder()
        .min_alignment_length(args.min_length)
        .frequency(args.frequency)
        .keep_intermediates(args.keep_intermediates)
        .verbose(args.verbose)
        .output_format(parse_format(&args.format).map_err(anyhow::Error::msg)?);
    if args.threads > 0 {
        builder = builder.num_threads(args.threads);
    }
    if let Some(identity) = args.min_identity {
        builder = builder.min_identity(identity);
    }
    if let Some(secs) = args.timeout {
        builder = builder.timeout(Duration::from_secs(secs));
    }
    if let Some(dir) = args.temp_dir {
        builder = builder.temp_dir(dir);
    }
    let config = builder.build();

    log::info!(
        "aligning {} vs {}",
        args.query.display(),
        args.target.display()
    );
    let pipeline = Pipeline::new(config)
        .with_progress(|stage, msg| log::info!("[{stage}] {msg}"));
    let out = pipeline.align(&args.query, &args.target)?;
    log::info!(
        "{} alignments across {} queries ({} malformed lines skipped)",
        out.records.len(),
        out.queries.len(),
        out.lines_skipped
    );

    if let Some(ref aln_path) = args.aln {
        let query_db = args.query.display().to_string();
        let target_db = args.target.display().to_string();
        let mut writer = AlnWriter::create(
            aln_path,
            &out.queries,
            &out.targets,
            (&query_db, &target_db),
        )?;
        for rec in &out.records {
            writer.write_record(rec)?;
        }
        let count = writer.close()?;
        log::info!("wrote {count} records to {}", aln_path.display());
    }

    write_paf(&out.records, &out.queries, &out.targets, args.output.as_deref())?;
    Ok(())
}

struct FilterArgs {
    input: PathBuf,
    output: Option<PathBuf>,
    chain_gap: u64,
    max_per_query: usize,
    max_per_target: usize,
    min_identity: f64,
    min_length: u64,
    max_overlap: f64,
    reciprocal: bool,
    group_by_target: bool,
    scoring: String,
}

fn run_filter(args: FilterArgs) -> anyhow::Result<()> {
    let config = FilterConfig {
        chain_gap: args.chain_gap,
        max_per_query: args.max_per_query,
        max_per_target: args.max_per_target,
        min_identity: args.min_identity,
        min_length: args.min_length,
        max_overlap: args.max_overlap,
        reciprocal_best: args.reciprocal,
        group_by: if args.group_by_target {
            GroupBy::QueryTarget
        } else {
            GroupBy::Query
        },
        scoring: parse_scoring(&args.scoring).map_err(anyhow::Error::msg)?,
    };

    let (records, queries, targets, skipped) = load_records(&args.input)?;
    log::info!(
        "loaded {} records from {} ({} malformed lines skipped)",
        records.len(),
        args.input.display(),
        skipped
    );

    let (kept, stats) = alnsweep::sweep::filter_records(records, &config);
    log::info!(
        "kept {} of {} (invalid {}, merged {}, weak {}, over limit {}, overlapped {}, not reciprocal {})",
        stats.kept,
        stats.input,
        stats.dropped_invalid,
        stats.merged_away,
        stats.dropped_weak,
        stats.dropped_by_limit,
        stats.dropped_by_overlap,
        stats.dropped_not_reciprocal
    );

    write_paf(&kept, &queries, &targets, args.output.as_deref())?;
    Ok(())
}

type Loaded = (Vec<AlignmentRecord>, SequenceCatalog, SequenceCatalog, u64);

// PAF from a file or stdin, or a binary container picked by extension.
fn load_records(input: &std::path::Path) -> anyhow::Result<Loaded> {
    if input.extension().is_some_and(|e| e == "aln") {
        let mut reader = AlnReader::open(input)?;
        let mut records = Vec::new();
        while let Some(rec) = reader.read_next()? {
            records.push(rec);
        }
        let queries = reader.query_catalog().clone();
        let targets = reader.target_catalog().clone();
        return Ok((records, queries, targets, 0));
    }

    let mut parser = PafParser::new();
    let mut records = Vec::new();
    let mut parse_all = |lines: &mut dyn Iterator<Item = std::io::Result<String>>| {
        for line in lines {
            match line {
                Ok(l) if l.is_empty() => {}
                Ok(l) => {
                    if let Some(rec) = parser.parse_or_skip(&l) {
                        records.push(rec);
                    }
                }
                Err(e) => {
                    log::warn!("input read failed: {e}");
                    break;
                }
            }
        }
    };

    if input.as_os_str() == "-" {
        let stdin = std::io::stdin();
        parse_all(&mut stdin.lock().lines());
    } else {
        let file = std::fs::File::open(input)?;
        parse_all(&mut std::io::BufReader::new(file).lines());
    }

    let skipped = parser.skipped();
    let (queries, targets) = parser.into_catalogs();
    Ok((records, queries, targets, skipped))
}

fn write_paf(
    records: &[AlignmentRecord],
    queries: &SequenceCatalog,
    targets: &SequenceCatalog,
    output: Option<&std::path::Path>,
) -> anyhow::Result<()> {
    let mut out: Box<dyn Write> = match output {
        Some(path) => Box::new(std::io::BufWriter::new(std::fs::File::create(path)?)),
        None => Box::new(std::io::BufWriter::new(std::io::stdout())),
    };
    for rec in records {
        writeln!(out, "{}", paf::format_line(rec, queries, targets))?;
    }
    out.flush()?;
    Ok(())
}
