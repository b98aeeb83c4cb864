// Streaming query iterator over the aligner's tabular output.
//
// A producer thread parses the stream and groups records by query; each
// completed group crosses a bounded channel to the consumer. The channel
// bound is the backpressure contract: with a depth of N, at most N sets
// are outstanding at once (N - 1 buffered plus one blocked in the
// handoff), so at depth 1 the producer cannot read past the first record
// of the query after the one the consumer is holding.

use std::io::{BufRead, BufReader, Read};
use std::process::Child;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::error::{Error, Result};
use crate::paf::PafParser;
use crate::pipeline::Stage;
use crate::record::AlignmentRecord;

#[cfg(test)]
#[path = "stream_test.rs"]
mod stream_test;

const WATCHDOG_POLL: Duration = Duration::from_millis(25);

/// All alignments for one query, complete on arrival: once a set is
/// yielded, no further records for that query id will ever follow.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryAlignmentSet {
    pub query_id: u32,
    pub query_name: String,
    pub query_len: u64,
    pub records: Vec<AlignmentRecord>,
}

/// Iterator of complete [`QueryAlignmentSet`]s, each wrapped in a
/// `Result` so mid-stream failures are observable in order.
///
/// Sets arrive in first-appearance order of query ids; records within a
/// set keep their source order. A read failure, a timed-out aligner, or
/// a non-zero aligner exit is delivered as the stream's final `Err` item,
/// so a truncated stream is never mistaken for a clean end. Dropping the
/// stream disconnects the channel; the producer observes the failed
/// send, kills the child process if one is attached, records
/// [`Error::Cancelled`], and exits promptly.
pub struct QueryStream {
    receiver: Receiver<Result<QueryAlignmentSet>>,
    produced: Arc<AtomicU64>,
    skipped: Arc<AtomicU64>,
    terminal: Arc<OnceLock<Error>>,
    handle: Option<JoinHandle<()>>,
    // Keeps the pipeline's temp artifacts alive for the stream's lifetime.
    _workspace: Option<tempfile::TempDir>,
}

impl QueryStream {
    /// Attach to a spawned aligner child whose stdout is piped.
    ///
    /// If `timeout` is set, a watchdog kills the child at the deadline
    /// and the stream ends with [`Error::Timeout`] for the alignment
    /// stage. The child's stderr, when piped, is captured and attached
    /// to any [`Error::Process`] the stream reports.
    pub fn spawn(
        mut child: Child,
        buffer_depth: usize,
        timeout: Option<Duration>,
        workspace: Option<tempfile::TempDir>,
    ) -> Result<QueryStream> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Validation("aligner child has no piped stdout".to_string()))?;
        let stderr = crate::pipeline::drain_stderr(&mut child);

        let child = Arc::new(Mutex::new(child));
        let done = Arc::new(AtomicBool::new(false));
        let timed_out = Arc::new(AtomicBool::new(false));
        if let Some(limit) = timeout {
            spawn_watchdog(
                Arc::clone(&child),
                Arc::clone(&done),
                Arc::clone(&timed_out),
                limit,
            );
        }

        let guard = ChildGuard {
            child,
            done,
            timed_out,
            timeout,
            stderr,
        };
        Ok(Self::start(stdout, Some(guard), buffer_depth, workspace))
    }

    /// Stream from any tabular reader (a file, a pipe, a test fixture).
    pub fn from_reader(reader: impl Read + Send + 'static, buffer_depth: usize) -> QueryStream {
        Self::start(reader, None, buffer_depth, None)
    }

    fn start(
        reader: impl Read + Send + 'static,
        guard: Option<ChildGuard>,
        buffer_depth: usize,
        workspace: Option<tempfile::TempDir>,
    ) -> QueryStream {
        let depth = if buffer_depth == 0 {
            crate::defaults::BUFFER_DEPTH
        } else {
            buffer_depth
        };
        // The set held in a blocked send counts against the depth, so the
        // channel itself buffers one fewer; depth 1 is a pure rendezvous.
        let (sender, receiver) = bounded(depth - 1);
        let produced = Arc::new(AtomicU64::new(0));
        let skipped = Arc::new(AtomicU64::new(0));
        let terminal = Arc::new(OnceLock::new());

        let produced_tx = Arc::clone(&produced);
        let skipped_tx = Arc::clone(&skipped);
        let terminal_tx = Arc::clone(&terminal);
        let handle = std::thread::spawn(move || {
            produce(reader, guard, sender, produced_tx, skipped_tx, terminal_tx);
        });

        QueryStream {
            receiver,
            produced,
            skipped,
            terminal,
            handle: Some(handle),
            _workspace: workspace,
        }
    }

    /// Sets the producer has handed to the consumer side so far. Bounded
    /// by consumed + depth - 1 at all times.
    pub fn sets_produced(&self) -> u64 {
        self.produced.load(Ordering::SeqCst)
    }

    /// Shared handle to the producer's set counter, observable after the
    /// stream itself is gone.
    pub fn produced_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.produced)
    }

    /// Malformed lines skipped by the parser so far.
    pub fn lines_skipped(&self) -> u64 {
        self.skipped.load(Ordering::SeqCst)
    }

    /// Error the producer could not deliver through the channel because
    /// the consumer was already gone ([`Error::Cancelled`] after a
    /// mid-stream drop). Observable after the stream itself is dropped.
    pub fn terminal_error(&self) -> Arc<OnceLock<Error>> {
        Arc::clone(&self.terminal)
    }

    /// Drain the remaining sets and wait for the producer to finish;
    /// returns the total count of malformed lines skipped, or the first
    /// error the stream carried.
    pub fn finish(mut self) -> Result<u64> {
        while let Ok(item) = self.receiver.recv() {
            item?;
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        Ok(self.skipped.load(Ordering::SeqCst))
    }
}

impl Iterator for QueryStream {
    type Item = Result<QueryAlignmentSet>;

    fn next(&mut self) -> Option<Result<QueryAlignmentSet>> {
        self.receiver.recv().ok()
    }
}

// Handle on a child the producer thread is reading from, shared with the
// watchdog thread that enforces the deadline.
struct ChildGuard {
    child: Arc<Mutex<Child>>,
    done: Arc<AtomicBool>,
    timed_out: Arc<AtomicBool>,
    timeout: Option<Duration>,
    stderr: JoinHandle<String>,
}

impl ChildGuard {
    // Kill and reap the child without reporting anything; used when the
    // consumer is gone or the read side already failed.
    fn abort(self) {
        self.done.store(true, Ordering::SeqCst);
        let mut child = lock_child(&self.child);
        let _ = child.kill();
        let _ = child.wait();
        drop(child);
        let _ = self.stderr.join();
    }

    // Reap the child after a clean end of input; non-clean terminations
    // become the stream's final error.
    fn finish(self) -> Option<Error> {
        self.done.store(true, Ordering::SeqCst);
        let status = lock_child(&self.child).wait();
        let stderr = self.stderr.join().unwrap_or_default();
        if self.timed_out.load(Ordering::SeqCst) {
            return Some(Error::Timeout {
                stage: Stage::Aligning,
                seconds: self.timeout.map(|t| t.as_secs()).unwrap_or(0),
            });
        }
        match status {
            Ok(status) if !status.success() => Some(Error::Process {
                stage: Stage::Aligning,
                status,
                stderr: stderr.trim().to_string(),
            }),
            Ok(_) => None,
            Err(e) => Some(Error::io("aligner child", e)),
        }
    }
}

fn lock_child(child: &Arc<Mutex<Child>>) -> MutexGuard<'_, Child> {
    match child.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// Deadline enforcement for the streaming aligner. The producer blocks in
// reads, so a separate thread watches the clock and kills the child when
// the limit passes; the producer then sees end-of-stream and reports the
// timeout instead of the kill-signal exit status.
fn spawn_watchdog(
    child: Arc<Mutex<Child>>,
    done: Arc<AtomicBool>,
    timed_out: Arc<AtomicBool>,
    limit: Duration,
) {
    std::thread::spawn(move || {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if done.load(Ordering::SeqCst) {
                return;
            }
            std::thread::sleep(WATCHDOG_POLL);
        }
        if !done.load(Ordering::SeqCst) {
            timed_out.store(true, Ordering::SeqCst);
            log::warn!(
                "aligner exceeded its {:.0}s deadline, killing",
                limit.as_secs_f64()
            );
            let _ = lock_child(&child).kill();
        }
    });
}

// Producer loop. Runs on its own thread until the input ends, a read
// fails, or the consumer goes away.
fn produce(
    reader: impl Read,
    mut guard: Option<ChildGuard>,
    sender: Sender<Result<QueryAlignmentSet>>,
    produced: Arc<AtomicU64>,
    skipped: Arc<AtomicU64>,
    terminal: Arc<OnceLock<Error>>,
) {
    let mut parser = PafParser::new();
    let mut current: Option<QueryAlignmentSet> = None;
    let reader = BufReader::new(reader);

    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                // A torn pipe must surface as an error, not look like a
                // clean end of stream. The pending set may be truncated
                // mid-query, so it is discarded rather than delivered.
                if let Some(guard) = guard.take() {
                    guard.abort();
                }
                skipped.store(parser.skipped(), Ordering::SeqCst);
                let _ = sender.send(Err(Error::io("alignment stream", e)));
                return;
            }
        };
        if line.is_empty() {
            continue;
        }
        let rec = match parser.parse_or_skip(&line) {
            Some(rec) => rec,
            None => {
                skipped.store(parser.skipped(), Ordering::SeqCst);
                continue;
            }
        };

        // Query boundary: the aligner emits each query's records
        // contiguously, so an id change means the previous set is
        // complete.
        match current {
            Some(ref mut set) if set.query_id == rec.query_id => set.records.push(rec),
            _ => {
                if let Some(set) = current.take() {
                    if !emit(set, &sender, &produced) {
                        cancel(guard.take(), &terminal);
                        return;
                    }
                }
                current = Some(QueryAlignmentSet {
                    query_id: rec.query_id,
                    query_name: parser
                        .query_catalog()
                        .name(rec.query_id)
                        .unwrap_or("*")
                        .to_string(),
                    query_len: rec.query_len,
                    records: vec![rec],
                });
            }
        }
    }

    if let Some(set) = current.take() {
        if !emit(set, &sender, &produced) {
            cancel(guard.take(), &terminal);
            return;
        }
    }
    skipped.store(parser.skipped(), Ordering::SeqCst);

    if let Some(guard) = guard.take() {
        if let Some(err) = guard.finish() {
            let _ = sender.send(Err(err));
        }
    }
}

// Blocking send with backpressure. A failed send means the consumer
// dropped the stream; the caller bails out through `cancel`.
fn emit(
    set: QueryAlignmentSet,
    sender: &Sender<Result<QueryAlignmentSet>>,
    produced: &AtomicU64,
) -> bool {
    if sender.send(Ok(set)).is_err() {
        return false;
    }
    produced.fetch_add(1, Ordering::SeqCst);
    true
}

// Consumer-initiated shutdown: kill the child so it stops writing into a
// dead pipe and record the cancellation where a post-mortem can see it,
// since the channel has no one left to receive an error.
fn cancel(guard: Option<ChildGuard>, terminal: &OnceLock<Error>) {
    if let Some(guard) = guard {
        log::debug!("stream consumer gone, killing aligner child");
        guard.abort();
    }
    let _ = terminal.set(Error::Cancelled);
}
