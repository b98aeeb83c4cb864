use super::*;
use std::io::Cursor;
use std::sync::atomic::Ordering::SeqCst;
use std::time::Duration;

fn paf_line(query: &str, qlen: u64, start: u64, end: u64) -> String {
    let len = end - start;
    format!("{query}\t{qlen}\t{start}\t{end}\t+\ttgt\t5000\t{start}\t{end}\t{len}\t{len}\t60")
}

fn fixture(queries: &[(&str, usize)]) -> String {
    let mut out = String::new();
    for (name, count) in queries {
        for i in 0..*count {
            let start = (i as u64) * 100;
            out.push_str(&paf_line(name, 1000, start, start + 50));
            out.push('\n');
        }
    }
    out
}

#[test]
fn partitions_by_query_in_first_appearance_order() {
    let input = fixture(&[("qA", 3), ("qB", 1), ("qC", 2)]);
    let stream = QueryStream::from_reader(Cursor::new(input), 4);
    let sets: Vec<QueryAlignmentSet> = stream.map(|item| item.unwrap()).collect();

    assert_eq!(sets.len(), 3);
    assert_eq!(sets[0].query_name, "qA");
    assert_eq!(sets[0].records.len(), 3);
    assert_eq!(sets[1].query_name, "qB");
    assert_eq!(sets[1].records.len(), 1);
    assert_eq!(sets[2].query_name, "qC");
    assert_eq!(sets[2].records.len(), 2);
}

#[test]
fn within_set_order_matches_source_order() {
    let input = fixture(&[("qA", 5)]);
    let mut stream = QueryStream::from_reader(Cursor::new(input), 2);
    let set = stream.next().unwrap().unwrap();
    let starts: Vec<u64> = set.records.iter().map(|r| r.query_start).collect();
    assert_eq!(starts, vec![0, 100, 200, 300, 400]);
    assert!(stream.next().is_none());
}

#[test]
fn every_input_record_is_delivered_exactly_once() {
    let input = fixture(&[("qA", 4), ("qB", 7), ("qC", 1)]);
    let stream = QueryStream::from_reader(Cursor::new(input), 1);
    let total: usize = stream.map(|item| item.unwrap().records.len()).sum();
    assert_eq!(total, 12);
}

#[test]
fn malformed_lines_are_counted_not_fatal() {
    let mut input = fixture(&[("qA", 2)]);
    input.push_str("this is not a paf line\n");
    input.push_str(&paf_line("qB", 1000, 0, 50));
    input.push('\n');

    let mut stream = QueryStream::from_reader(Cursor::new(input), 4);
    let mut sets = 0;
    while let Some(item) = stream.next() {
        item.unwrap();
        sets += 1;
    }
    assert_eq!(sets, 2);
    assert_eq!(stream.finish().unwrap(), 1);
}

#[test]
fn read_failure_ends_the_stream_with_an_error() {
    // Two complete lines, then the pipe tears. The first query's set is
    // complete at the second line's boundary; the failure must arrive as
    // an Err item, never as a clean end of stream.
    struct Torn {
        served: usize,
    }
    impl Read for Torn {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let lines = [
                "q0\t1000\t0\t50\t+\ttgt\t5000\t0\t50\t50\t50\t60\n",
                "q1\t1000\t0\t50\t+\ttgt\t5000\t0\t50\t50\t50\t60\n",
            ];
            if self.served < lines.len() {
                let line = lines[self.served].as_bytes();
                buf[..line.len()].copy_from_slice(line);
                self.served += 1;
                Ok(line.len())
            } else {
                Err(std::io::Error::from(std::io::ErrorKind::ConnectionReset))
            }
        }
    }

    let mut stream = QueryStream::from_reader(Torn { served: 0 }, 4);
    let first = stream.next().unwrap().unwrap();
    assert_eq!(first.query_name, "q0");
    match stream.next().unwrap() {
        Err(Error::Io { .. }) => {}
        other => panic!("expected an I/O error item, got {other:?}"),
    }
    assert!(stream.next().is_none());
}

#[test]
fn depth_one_is_lock_step() {
    let input = fixture(&[
        ("q0", 1),
        ("q1", 1),
        ("q2", 1),
        ("q3", 1),
        ("q4", 1),
        ("q5", 1),
        ("q6", 1),
        ("q7", 1),
    ]);
    let mut stream = QueryStream::from_reader(Cursor::new(input), 1);

    let mut consumed = 0u64;
    while let Some(item) = stream.next() {
        item.unwrap();
        consumed += 1;
        // Slow consumer: give the producer every chance to race ahead.
        std::thread::sleep(Duration::from_millis(5));
        assert!(
            stream.sets_produced() <= consumed,
            "producer ran ahead: produced {} with {} consumed",
            stream.sets_produced(),
            consumed
        );
    }
    assert_eq!(consumed, 8);
}

#[test]
fn depth_one_reads_no_further_than_the_next_boundary() {
    // Serves one full line per read call so the producer's progress
    // through the input is observable line by line.
    struct Metered {
        lines: Vec<Vec<u8>>,
        next: usize,
        served: Arc<AtomicU64>,
    }
    impl Read for Metered {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.next == self.lines.len() {
                return Ok(0);
            }
            let line = &self.lines[self.next];
            buf[..line.len()].copy_from_slice(line);
            self.next += 1;
            self.served.fetch_add(1, SeqCst);
            Ok(line.len())
        }
    }

    let served = Arc::new(AtomicU64::new(0));
    let lines: Vec<Vec<u8>> = (0..10)
        .map(|i| paf_line(&format!("q{i}"), 1000, 0, 50).into_bytes())
        .map(|mut l| {
            l.push(b'\n');
            l
        })
        .collect();
    let metered = Metered {
        lines,
        next: 0,
        served: Arc::clone(&served),
    };

    let mut stream = QueryStream::from_reader(metered, 1);
    let first = stream.next().unwrap().unwrap();
    assert_eq!(first.query_name, "q0");
    std::thread::sleep(Duration::from_millis(50));

    // Accepting q0's set frees the producer to read q2's first record
    // (the boundary that completes q1) and no further: three lines.
    let lines_read = served.load(SeqCst);
    assert!(lines_read <= 3, "producer read {lines_read} lines ahead");
}

#[test]
fn dropping_the_stream_stops_the_producer() {
    // Endless input: the producer can only stop via the broken channel.
    struct Endless {
        line: Vec<u8>,
        pos: usize,
        query: u64,
    }
    impl Read for Endless {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos == self.line.len() {
                self.query += 1;
                self.line = format!("q{}\t1000\t0\t50\t+\ttgt\t5000\t0\t50\t50\t50\t60\n", self.query)
                    .into_bytes();
                self.pos = 0;
            }
            let n = buf.len().min(self.line.len() - self.pos);
            buf[..n].copy_from_slice(&self.line[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    let endless = Endless {
        line: Vec::new(),
        pos: 0,
        query: 0,
    };
    let mut stream = QueryStream::from_reader(endless, 1);
    let produced = stream.produced_counter();
    let terminal = stream.terminal_error();

    stream.next().unwrap().unwrap();
    stream.next().unwrap().unwrap();
    drop(stream);

    // The producer's pending send fails once the receiver is gone; after
    // that the counter must stop moving and the cancellation must be on
    // record.
    std::thread::sleep(Duration::from_millis(50));
    let settled = produced.load(SeqCst);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(produced.load(SeqCst), settled);
    assert!(matches!(terminal.get(), Some(Error::Cancelled)));
}

#[cfg(unix)]
#[test]
fn aligner_failure_after_output_is_surfaced() {
    let child = std::process::Command::new("sh")
        .arg("-c")
        .arg(r"printf 'q0\t1000\t0\t50\t+\ttgt\t5000\t0\t50\t50\t50\t60\n'; echo 'index corrupt' >&2; exit 3")
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .unwrap();

    let mut stream = QueryStream::spawn(child, 1, None, None).unwrap();
    let first = stream.next().unwrap().unwrap();
    assert_eq!(first.query_name, "q0");
    match stream.next().unwrap() {
        Err(Error::Process { status, stderr, .. }) => {
            assert_eq!(status.code(), Some(3));
            assert!(stderr.contains("index corrupt"));
        }
        other => panic!("expected a process error item, got {other:?}"),
    }
    assert!(stream.next().is_none());
}

#[cfg(unix)]
#[test]
fn hung_aligner_is_killed_at_the_deadline() {
    let child = std::process::Command::new("sh")
        .arg("-c")
        .arg("sleep 30")
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .unwrap();

    let started = std::time::Instant::now();
    let mut stream =
        QueryStream::spawn(child, 1, Some(Duration::from_millis(200)), None).unwrap();
    match stream.next().unwrap() {
        Err(Error::Timeout { .. }) => {}
        other => panic!("expected a timeout item, got {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(stream.next().is_none());
}
