// External aligner pipeline driver.
//
// Drives the alignment toolchain (FAtoGDB, GIXmake, FastGA) as child
// processes, one per stage: database preparation for each input, index
// construction, then the alignment itself. The aligner never runs
// in-process; every stage crosses a process boundary so an aligner crash
// cannot take the host down.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use crate::catalog::SequenceCatalog;
use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::paf::PafParser;
use crate::record::AlignmentRecord;
use crate::stream::QueryStream;

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod pipeline_test;

/// Pipeline stages, in execution order. Also the unit of failure
/// attribution: process and timeout errors carry the stage they occurred
/// in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validating,
    PreparingQueryDb,
    PreparingTargetDb,
    Indexing,
    Aligning,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::Validating => "validation",
            Stage::PreparingQueryDb => "query database preparation",
            Stage::PreparingTargetDb => "target database preparation",
            Stage::Indexing => "index construction",
            Stage::Aligning => "alignment",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Progress callback: receives (stage name, message). Purely
/// informational; supplying one changes no behavior.
pub type ProgressFn = dyn Fn(&str, &str) + Send + Sync;

/// Completed run: parsed records plus the catalogs interned while
/// parsing, and the count of malformed lines skipped along the way.
#[derive(Debug)]
pub struct AlignmentOutput {
    pub records: Vec<AlignmentRecord>,
    pub queries: SequenceCatalog,
    pub targets: SequenceCatalog,
    pub lines_skipped: u64,
}

/// Driver for one query-vs-target alignment invocation.
///
/// A `Pipeline` is cheap to construct and holds no OS resources; each
/// `align`/`stream_queries` call creates its own temp workspace and
/// cleans it up when done (or keeps it under `keep_intermediates`).
/// Multiple pipelines may run concurrently from different threads.
pub struct Pipeline {
    config: PipelineConfig,
    progress: Option<Box<ProgressFn>>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Pipeline {
            config,
            progress: None,
        }
    }

    /// Install a progress callback.
    pub fn with_progress(mut self, callback: impl Fn(&str, &str) + Send + Sync + 'static) -> Self {
        self.progress = Some(Box::new(callback));
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run the full pipeline to completion, collecting every alignment.
    pub fn align(&self, query: &Path, target: &Path) -> Result<AlignmentOutput> {
        let work = self.prepare(query, target)?;

        self.report(Stage::Aligning, "running aligner");
        let started = Instant::now();
        let mut child = self
            .aligner_command(&work)?
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::io(&work.query_db, e))?;

        let stdout = child.stdout.take().unwrap();
        let collector = std::thread::spawn(move || {
            let mut buf = Vec::new();
            let mut stdout = stdout;
            let _ = stdout.read_to_end(&mut buf);
            buf
        });
        let stderr = drain_stderr(&mut child);
        let status = self.wait_stage(Stage::Aligning, &mut child)?;
        let raw = collector.join().unwrap();
        check_status(Stage::Aligning, status, stderr)?;
        log::info!(
            "alignment finished in {:.1}s ({} bytes of output)",
            started.elapsed().as_secs_f64(),
            raw.len()
        );

        let mut parser = PafParser::new();
        let mut records = Vec::new();
        for line in String::from_utf8_lossy(&raw).lines() {
            if line.is_empty() {
                continue;
            }
            if let Some(rec) = parser.parse_or_skip(line) {
                records.push(rec);
            }
        }
        let lines_skipped = parser.skipped();
        let (queries, targets) = parser.into_catalogs();

        work.finish(self.config.keep_intermediates);
        self.report(Stage::Aligning, "done");
        Ok(AlignmentOutput {
            records,
            queries,
            targets,
            lines_skipped,
        })
    }

    /// Run the pipeline and stream results one complete query at a time.
    ///
    /// The aligner's output is parsed on a producer thread and delivered
    /// through a bounded channel of depth `buffer_depth`; see
    /// [`QueryStream`] for the backpressure and cancellation contract.
    /// The configured `timeout` applies to the alignment stage here too:
    /// a hung aligner is killed and the stream ends with a timeout error.
    pub fn stream_queries(
        &self,
        query: &Path,
        target: &Path,
        buffer_depth: usize,
    ) -> Result<QueryStream> {
        let work = self.prepare(query, target)?;

        self.report(Stage::Aligning, "running aligner (streaming)");
        let child = self
            .aligner_command(&work)?
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::io(&work.query_db, e))?;

        QueryStream::spawn(
            child,
            buffer_depth,
            self.config.timeout,
            work.into_guard(self.config.keep_intermediates),
        )
    }

    // Validation through indexing; returns the prepared workspace.
    fn prepare(&self, query: &Path, target: &Path) -> Result<Workspace> {
        self.report(Stage::Validating, "checking inputs");
        validate_fasta(query)?;
        validate_fasta(target)?;

        let mut work = Workspace::create(self.config.temp_dir.as_deref())?;

        work.query_db = self.prepare_db(Stage::PreparingQueryDb, query, &work)?;
        work.target_db = if same_file(query, target) {
            // Self-alignment: one database serves both roles.
            work.query_db.clone()
        } else {
            self.prepare_db(Stage::PreparingTargetDb, target, &work)?
        };

        self.report(Stage::Indexing, "building k-mer indices");
        self.build_index(&work.query_db, &work)?;
        if work.target_db != work.query_db {
            self.build_index(&work.target_db, &work)?;
        }

        Ok(work)
    }

    // FAtoGDB stage for one input. The input is copied into the workspace
    // first so the converter's sibling outputs never land next to user
    // files.
    fn prepare_db(&self, stage: Stage, fasta: &Path, work: &Workspace) -> Result<PathBuf> {
        self.report(stage, "converting to sequence database");
        let started = Instant::now();

        let file_name = fasta
            .file_name()
            .ok_or_else(|| Error::Validation(format!("{} has no file name", fasta.display())))?;
        let local = work.dir().join(file_name);
        std::fs::copy(fasta, &local).map_err(|e| Error::io(fasta, e))?;

        let bin = find_binary("FAtoGDB")?;
        let mut child = Command::new(bin)
            .arg(&local)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::io(&local, e))?;
        let stderr = drain_stderr(&mut child);
        let status = self.wait_stage(stage, &mut child)?;
        check_status(stage, status, stderr)?;

        log::info!("{stage} finished in {:.1}s", started.elapsed().as_secs_f64());
        Ok(db_path_for(&local))
    }

    // GIXmake stage for one database.
    fn build_index(&self, db: &Path, work: &Workspace) -> Result<()> {
        let started = Instant::now();
        let bin = find_binary("GIXmake")?;
        let mut cmd = Command::new(bin);
        cmd.arg(format!("-T{}", self.config.num_threads))
            .arg(format!("-P{}", work.dir().display()));
        if self.config.frequency > 0 {
            cmd.arg(format!("-f{}", self.config.frequency));
        }
        let mut child = cmd
            .arg(db)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::io(db, e))?;
        let stderr = drain_stderr(&mut child);
        let status = self.wait_stage(Stage::Indexing, &mut child)?;
        check_status(Stage::Indexing, status, stderr)?;
        log::info!(
            "index for {} built in {:.1}s",
            db.display(),
            started.elapsed().as_secs_f64()
        );
        Ok(())
    }

    // FastGA invocation with every configured flag.
    fn aligner_command(&self, work: &Workspace) -> Result<Command> {
        let bin = find_binary("FastGA")?;
        let mut cmd = Command::new(bin);
        cmd.arg(self.config.output_format.aligner_flag())
            .arg(format!("-T{}", self.config.num_threads));

        if self.config.min_alignment_length > 0 {
            cmd.arg(format!("-l{}", self.config.min_alignment_length));
        }
        if let Some(identity) = self.config.min_identity {
            cmd.arg(format!("-i{identity:.2}"));
        }
        if let Some(cutoff) = self.config.adaptive_seed_cutoff {
            cmd.arg(format!("-f{cutoff}"));
        }
        if let Some(coverage) = self.config.min_chain_coverage {
            // The aligner takes chain coverage as an integer percentage.
            cmd.arg(format!("-c{}", (coverage * 100.0) as i32));
        }
        if let Some(threshold) = self.config.chain_start_threshold {
            cmd.arg(format!("-s{threshold}"));
        }
        if self.config.soft_masking {
            cmd.arg("-M");
        }
        if self.config.symmetric_seeding {
            cmd.arg("-S");
        }
        if self.config.verbose {
            cmd.arg("-v");
        }
        if let Some(ref log_path) = self.config.log_file {
            cmd.arg(format!("-L:{}", log_path.display()));
        }
        cmd.arg(format!("-P{}", work.dir().display()));
        cmd.arg(&work.query_db).arg(&work.target_db);
        Ok(cmd)
    }

    // Wait for a stage's child, enforcing the configured wall-clock
    // deadline. On expiry the child is killed before the timeout error is
    // returned.
    fn wait_stage(&self, stage: Stage, child: &mut Child) -> Result<ExitStatus> {
        match self.config.timeout {
            None => child
                .wait()
                .map_err(|e| Error::io(format!("{stage} child"), e)),
            Some(limit) => {
                let deadline = Instant::now() + limit;
                loop {
                    match child.try_wait() {
                        Ok(Some(status)) => return Ok(status),
                        Ok(None) if Instant::now() >= deadline => {
                            log::warn!("{stage} exceeded {}s deadline, killing", limit.as_secs());
                            let _ = child.kill();
                            let _ = child.wait();
                            return Err(Error::Timeout {
                                stage,
                                seconds: limit.as_secs(),
                            });
                        }
                        Ok(None) => std::thread::sleep(Duration::from_millis(25)),
                        Err(e) => return Err(Error::io(format!("{stage} child"), e)),
                    }
                }
            }
        }
    }

    fn report(&self, stage: Stage, message: &str) {
        log::debug!("[{stage}] {message}");
        if let Some(ref cb) = self.progress {
            cb(stage.name(), message);
        }
    }
}

// Drain the child's stderr on its own thread so a chatty child never
// blocks on a full pipe while we wait on it.
pub(crate) fn drain_stderr(child: &mut Child) -> std::thread::JoinHandle<String> {
    let pipe = child.stderr.take();
    std::thread::spawn(move || {
        let mut text = String::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_string(&mut text);
        }
        text
    })
}

// Non-zero exit becomes a process error carrying the stage, status, and
// whatever the child wrote to stderr.
fn check_status(
    stage: Stage,
    status: ExitStatus,
    stderr: std::thread::JoinHandle<String>,
) -> Result<()> {
    let stderr = stderr.join().unwrap_or_default();
    if status.success() {
        if !stderr.is_empty() {
            log::debug!("{stage} stderr: {}", stderr.trim());
        }
        return Ok(());
    }
    Err(Error::Process {
        stage,
        status,
        stderr: stderr.trim().to_string(),
    })
}

/// Temp workspace for one invocation. Backed by a create-exclusive
/// `tempfile::TempDir`; unique even when many pipelines start in the same
/// instant, which PID-derived names cannot guarantee.
struct Workspace {
    dir: Option<tempfile::TempDir>,
    query_db: PathBuf,
    target_db: PathBuf,
}

impl Workspace {
    fn create(base: Option<&Path>) -> Result<Self> {
        let dir = match base {
            Some(base) => tempfile::Builder::new()
                .prefix("alnsweep-")
                .tempdir_in(base)
                .map_err(|e| Error::io(base, e))?,
            None => tempfile::Builder::new()
                .prefix("alnsweep-")
                .tempdir()
                .map_err(|e| Error::io(std::env::temp_dir(), e))?,
        };
        Ok(Workspace {
            dir: Some(dir),
            query_db: PathBuf::new(),
            target_db: PathBuf::new(),
        })
    }

    fn dir(&self) -> &Path {
        self.dir.as_ref().unwrap().path()
    }

    // Drop the workspace, or persist it when intermediates are kept.
    fn finish(mut self, keep: bool) {
        if keep {
            if let Some(dir) = self.dir.take() {
                let path = dir.keep();
                log::info!("keeping intermediates in {}", path.display());
            }
        }
    }

    fn into_guard(mut self, keep: bool) -> Option<tempfile::TempDir> {
        if keep {
            self.finish(true);
            None
        } else {
            self.dir.take()
        }
    }
}

/// Locate an external aligner binary: `ALNSWEEP_BIN_DIR` first, then
/// `PATH`.
pub fn find_binary(name: &str) -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(crate::defaults::BIN_DIR_ENV) {
        let candidate = Path::new(&dir).join(name);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    if let Some(paths) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths) {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }
    Err(Error::Validation(format!(
        "external binary {name:?} not found (set {} or PATH)",
        crate::defaults::BIN_DIR_ENV
    )))
}

// Database path produced by the converter: input path with the FASTA
// extension(s) replaced by .gdb.
fn db_path_for(fasta: &Path) -> PathBuf {
    let name = fasta.file_name().unwrap_or_default().to_string_lossy();
    let mut stem = name.as_ref();
    for ext in [".gz", ".fasta", ".fa", ".fna"] {
        if let Some(s) = stem.strip_suffix(ext) {
            stem = s;
        }
    }
    fasta.with_file_name(format!("{stem}.gdb"))
}

/// Check that a path exists and holds FASTA data, looking through gzip
/// transparently.
pub fn validate_fasta(path: &Path) -> Result<()> {
    let file = std::fs::File::open(path).map_err(|e| Error::io(path, e))?;
    let meta = file.metadata().map_err(|e| Error::io(path, e))?;
    if !meta.is_file() {
        return Err(Error::Validation(format!(
            "{} is not a regular file",
            path.display()
        )));
    }

    let mut reader = std::io::BufReader::new(file);
    let mut magic = [0u8; 2];
    let n = reader.read(&mut magic).map_err(|e| Error::io(path, e))?;
    if n == 0 {
        return Err(Error::Validation(format!("{} is empty", path.display())));
    }

    let first = if magic == [0x1f, 0x8b] {
        // Gzipped: sniff the decompressed head instead.
        let file = std::fs::File::open(path).map_err(|e| Error::io(path, e))?;
        let mut gz = flate2::read::MultiGzDecoder::new(file);
        let mut head = [0u8; 1];
        match gz.read(&mut head) {
            Ok(1) => head[0],
            _ => {
                return Err(Error::Validation(format!(
                    "{} is gzipped but holds no data",
                    path.display()
                )))
            }
        }
    } else {
        magic[0]
    };

    if first != b'>' {
        return Err(Error::Validation(format!(
            "{} does not look like FASTA (expected '>')",
            path.display()
        )));
    }
    Ok(())
}

fn same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(ca), Ok(cb)) => ca == cb,
        _ => false,
    }
}
