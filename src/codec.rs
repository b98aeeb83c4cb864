// Binary alignment container reader/writer.
//
// The container is a schema-declared sequence of typed records:
//
//   magic "ALN1" | format version (u16) | record count (u64, patched on
//   close) | typed records, each `tag u8 | payload_len u32 | payload`.
//
// Record types: 'S' schema descriptor, 'P' provenance, 'D' database
// reference, 'N' per-sequence name, 'A' alignment, 'X' auxiliary
// (trace/edit data), 'E' end marker. All integers little-endian. Readers
// skip record types they do not recognize; the length prefix makes that
// possible without understanding the payload.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::catalog::SequenceCatalog;
use crate::error::{Error, Result};
use crate::record::{AlignmentRecord, RecordStats, Strand};
use crate::schema_guard;

const MAGIC: &[u8; 4] = b"ALN1";
const VERSION: u16 = 2;
const COUNT_UNFINALIZED: u64 = u64::MAX;

// Fixed offset of the record-count slot, right after magic + version.
const COUNT_OFFSET: u64 = 6;

const TAG_SCHEMA: u8 = b'S';
const TAG_PROVENANCE: u8 = b'P';
const TAG_DB_REF: u8 = b'D';
const TAG_NAME: u8 = b'N';
const TAG_ALIGNMENT: u8 = b'A';
const TAG_AUX: u8 = b'X';
const TAG_END: u8 = b'E';

const ROLE_QUERY: u8 = 0;
const ROLE_TARGET: u8 = 1;

// 'A' payload: ids (2 x u32), six u64 coordinates/lengths, strand u8,
// diffs u32, identity f64, block_len u64, merge_count u32, complexity f64,
// flags u8.
const ALIGNMENT_PAYLOAD_LEN: u32 = 90;

/// Canonical schema descriptor embedded in every container. The reader
/// refuses files whose descriptor does not match this layout.
pub const SCHEMA_TEXT: &str = "\
A alignment qid:u32 tid:u32 qs:u64 qe:u64 ts:u64 te:u64 ql:u64 tl:u64 strand:u8 diffs:u32 ident:f64 block:u64 merges:u32 cplx:f64 flags:u8\n\
N name role:u8 id:u32 len:u64 name:str\n\
D dbref role:u8 path:str\n\
P provenance text:str\n\
X aux bytes\n";

/// Construct the schema descriptor for a new container.
///
/// Descriptor compilation shares one process-keyed temporary resource, so
/// every construction is serialized through the schema guard. Mandatory
/// for correctness, not an optimization.
fn build_schema() -> Result<String> {
    schema_guard::with_exclusive_schema_access(|| {
        // Compilation validates the descriptor line by line before the
        // writer is allowed to exist.
        for line in SCHEMA_TEXT.lines() {
            let mut parts = line.split_whitespace();
            let (tag, name) = (parts.next(), parts.next());
            if tag.map_or(true, |t| t.len() != 1) || name.is_none() {
                return Err(Error::Format(format!("bad schema line: {line:?}")));
            }
        }
        Ok(SCHEMA_TEXT.to_string())
    })
}

#[cfg(test)]
#[path = "codec_test.rs"]
mod codec_test;

/// Forward-only reader for binary alignment containers.
#[derive(Debug)]
pub struct AlnReader {
    input: BufReader<File>,
    path: PathBuf,
    record_count: u64,
    records_read: u64,
    queries: SequenceCatalog,
    targets: SequenceCatalog,
    provenance: String,
    db_paths: [String; 2],
    // First alignment record, encountered while scanning the header.
    pending: Option<AlignmentRecord>,
}

impl AlnReader {
    /// Open a container for reading.
    ///
    /// Fails with a format error if the magic, version, or embedded schema
    /// descriptor does not match the expected record layout, or if the
    /// file was never finalized by `close`. The embedded name records are
    /// consumed here so sequence-name lookup never re-reads the original
    /// FASTA inputs.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        let mut input = BufReader::new(file);

        let mut magic = [0u8; 4];
        read_exact(&mut input, path, &mut magic)?;
        if &magic != MAGIC {
            return Err(Error::Format(format!(
                "{}: not an alignment container (bad magic)",
                path.display()
            )));
        }

        let version = read_u16(&mut input, path)?;
        if version != VERSION {
            return Err(Error::Format(format!(
                "{}: unsupported container version {version} (expected {VERSION})",
                path.display()
            )));
        }

        let record_count = read_u64(&mut input, path)?;
        if record_count == COUNT_UNFINALIZED {
            return Err(Error::Format(format!(
                "{}: container was not finalized",
                path.display()
            )));
        }

        let mut reader = AlnReader {
            input,
            path: path.to_path_buf(),
            record_count,
            records_read: 0,
            queries: SequenceCatalog::new(),
            targets: SequenceCatalog::new(),
            provenance: String::new(),
            db_paths: [String::new(), String::new()],
            pending: None,
        };
        reader.read_header()?;
        Ok(reader)
    }

    // Consume header records (schema, provenance, db refs, names) up to
    // the first alignment or end record.
    fn read_header(&mut self) -> Result<()> {
        let mut saw_schema = false;
        loop {
            let Some((tag, payload)) = self.next_raw()? else {
                break;
            };
            match tag {
                TAG_SCHEMA => {
                    let text = String::from_utf8(payload).map_err(|_| {
                        Error::Format(format!("{}: schema is not UTF-8", self.path.display()))
                    })?;
                    if text != SCHEMA_TEXT {
                        return Err(Error::Format(format!(
                            "{}: schema descriptor does not match expected record layout",
                            self.path.display()
                        )));
                    }
                    saw_schema = true;
                }
                TAG_PROVENANCE => {
                    self.provenance = String::from_utf8_lossy(&payload).into_owned();
                }
                TAG_DB_REF => {
                    if payload.is_empty() {
                        return Err(self.truncated("database reference"));
                    }
                    let role = payload[0];
                    let p = String::from_utf8_lossy(&payload[1..]).into_owned();
                    if (role as usize) < 2 {
                        self.db_paths[role as usize] = p;
                    }
                }
                TAG_NAME => {
                    self.read_name_record(&payload)?;
                }
                TAG_ALIGNMENT => {
                    // Header is over. The cursor cannot rewind, so parse
                    // this record now and hand it out on the first
                    // read_next call.
                    let rec = parse_alignment(&payload, &self.path)?;
                    self.pending = Some(rec);
                    break;
                }
                TAG_END => break,
                _ => {} // unknown record type: skipped by construction
            }
        }
        if !saw_schema {
            return Err(Error::Format(format!(
                "{}: missing schema descriptor",
                self.path.display()
            )));
        }
        Ok(())
    }

    fn read_name_record(&mut self, payload: &[u8]) -> Result<()> {
        // role u8 | id u32 | len u64 | name bytes
        if payload.len() < 13 {
            return Err(self.truncated("name record"));
        }
        let role = payload[0];
        let id = u32::from_le_bytes(payload[1..5].try_into().unwrap());
        let len = u64::from_le_bytes(payload[5..13].try_into().unwrap());
        let name = String::from_utf8_lossy(&payload[13..]).into_owned();
        let catalog = match role {
            ROLE_QUERY => &mut self.queries,
            ROLE_TARGET => &mut self.targets,
            _ => return Ok(()), // future role: ignore
        };
        let assigned = catalog.push(name, len);
        if assigned != id {
            return Err(Error::Format(format!(
                "{}: name records out of order (got id {id}, expected {assigned})",
                self.path.display()
            )));
        }
        Ok(())
    }

    /// Total number of alignment records in the container.
    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Alignment records handed out so far.
    pub fn records_read(&self) -> u64 {
        self.records_read
    }

    /// Catalog for the query-side database, extracted from embedded name
    /// records.
    pub fn query_catalog(&self) -> &SequenceCatalog {
        &self.queries
    }

    /// Catalog for the target-side database.
    pub fn target_catalog(&self) -> &SequenceCatalog {
        &self.targets
    }

    /// Provenance string written when the container was created.
    pub fn provenance(&self) -> &str {
        &self.provenance
    }

    /// Paths of the (query, target) source databases.
    pub fn db_paths(&self) -> (&str, &str) {
        (&self.db_paths[0], &self.db_paths[1])
    }

    /// Read the next alignment record in file order.
    ///
    /// Forward-only: a record, once returned, is never re-read. Returns
    /// `Ok(None)` at end-of-stream. Auxiliary and unrecognized record
    /// types are skipped.
    pub fn read_next(&mut self) -> Result<Option<AlignmentRecord>> {
        if let Some(rec) = self.pending.take() {
            self.records_read += 1;
            return Ok(Some(rec));
        }
        loop {
            let Some((tag, payload)) = self.next_raw()? else {
                return Ok(None);
            };
            match tag {
                TAG_ALIGNMENT => {
                    let rec = parse_alignment(&payload, &self.path)?;
                    self.records_read += 1;
                    return Ok(Some(rec));
                }
                TAG_END => return Ok(None),
                _ => {} // aux or unknown: skip
            }
        }
    }

    // One raw record, or None at EOF.
    fn next_raw(&mut self) -> Result<Option<(u8, Vec<u8>)>> {
        let mut tag = [0u8; 1];
        match self.input.read_exact(&mut tag) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(Error::io(&self.path, e)),
        }
        let len = read_u32(&mut self.input, &self.path)?;
        let mut payload = vec![0u8; len as usize];
        read_exact(&mut self.input, &self.path, &mut payload)?;
        Ok(Some((tag[0], payload)))
    }

    fn truncated(&self, what: &str) -> Error {
        Error::Format(format!("{}: truncated {what}", self.path.display()))
    }
}

/// Writer for binary alignment containers.
///
/// Metadata (provenance, database references, name tables) is written at
/// creation time; the file is not valid for reading until [`AlnWriter::close`]
/// patches the record count.
pub struct AlnWriter {
    output: BufWriter<File>,
    path: PathBuf,
    records_written: u64,
    closed: bool,
}

impl AlnWriter {
    /// Create a new container, writing schema, provenance, and database
    /// reference metadata immediately.
    pub fn create(
        path: &Path,
        queries: &SequenceCatalog,
        targets: &SequenceCatalog,
        db_paths: (&str, &str),
    ) -> Result<Self> {
        let schema = build_schema()?;

        let file = File::create(path).map_err(|e| Error::io(path, e))?;
        let mut output = BufWriter::new(file);

        output.write_all(MAGIC).map_err(|e| Error::io(path, e))?;
        write_u16(&mut output, path, VERSION)?;
        write_u64(&mut output, path, COUNT_UNFINALIZED)?;

        let mut writer = AlnWriter {
            output,
            path: path.to_path_buf(),
            records_written: 0,
            closed: false,
        };

        writer.write_raw(TAG_SCHEMA, schema.as_bytes())?;

        let provenance = format!(
            "{}\t{}\t{}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            std::env::args().collect::<Vec<_>>().join(" "),
        );
        writer.write_raw(TAG_PROVENANCE, provenance.as_bytes())?;

        for (role, db_path) in [(ROLE_QUERY, db_paths.0), (ROLE_TARGET, db_paths.1)] {
            let mut payload = vec![role];
            payload.extend_from_slice(db_path.as_bytes());
            writer.write_raw(TAG_DB_REF, &payload)?;
        }

        for (role, catalog) in [(ROLE_QUERY, queries), (ROLE_TARGET, targets)] {
            for (id, name) in catalog.all_names() {
                let len = catalog.length(id).unwrap_or(0);
                let mut payload = Vec::with_capacity(13 + name.len());
                payload.push(role);
                payload.extend_from_slice(&id.to_le_bytes());
                payload.extend_from_slice(&len.to_le_bytes());
                payload.extend_from_slice(name.as_bytes());
                writer.write_raw(TAG_NAME, &payload)?;
            }
        }

        Ok(writer)
    }

    /// Append one alignment record, preserving insertion order. No
    /// cross-record validation happens here; that is the filter engine's
    /// job.
    pub fn write_record(&mut self, rec: &AlignmentRecord) -> Result<()> {
        let mut payload = Vec::with_capacity(ALIGNMENT_PAYLOAD_LEN as usize);
        payload.extend_from_slice(&rec.query_id.to_le_bytes());
        payload.extend_from_slice(&rec.target_id.to_le_bytes());
        payload.extend_from_slice(&rec.query_start.to_le_bytes());
        payload.extend_from_slice(&rec.query_end.to_le_bytes());
        payload.extend_from_slice(&rec.target_start.to_le_bytes());
        payload.extend_from_slice(&rec.target_end.to_le_bytes());
        payload.extend_from_slice(&rec.query_len.to_le_bytes());
        payload.extend_from_slice(&rec.target_len.to_le_bytes());
        payload.push(match rec.strand {
            Strand::Forward => 0,
            Strand::Reverse => 1,
        });
        payload.extend_from_slice(&rec.diffs.to_le_bytes());
        payload.extend_from_slice(&rec.stats.identity.to_le_bytes());
        payload.extend_from_slice(&rec.stats.block_len.to_le_bytes());
        payload.extend_from_slice(&rec.stats.merge_count.to_le_bytes());
        payload.extend_from_slice(&rec.stats.complexity.to_le_bytes());
        payload.push(rec.stats.flags);
        debug_assert_eq!(payload.len() as u32, ALIGNMENT_PAYLOAD_LEN);

        self.write_raw(TAG_ALIGNMENT, &payload)?;
        self.records_written += 1;
        Ok(())
    }

    /// Attach auxiliary trace/edit bytes for the most recently written
    /// record. Readers that don't understand them skip them.
    pub fn write_aux(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_raw(TAG_AUX, bytes)
    }

    /// Finalize: write the end marker, patch the record count, and flush.
    /// The container is not valid for reading until this completes.
    pub fn close(mut self) -> Result<u64> {
        let count = self.records_written.to_le_bytes();
        self.write_raw(TAG_END, &count)?;
        self.output.flush().map_err(|e| Error::io(&self.path, e))?;

        let file = self.output.get_mut();
        file.seek(SeekFrom::Start(COUNT_OFFSET))
            .map_err(|e| Error::io(&self.path, e))?;
        file.write_all(&self.records_written.to_le_bytes())
            .map_err(|e| Error::io(&self.path, e))?;
        file.flush().map_err(|e| Error::io(&self.path, e))?;

        self.closed = true;
        Ok(self.records_written)
    }

    fn write_raw(&mut self, tag: u8, payload: &[u8]) -> Result<()> {
        self.output
            .write_all(&[tag])
            .and_then(|_| self.output.write_all(&(payload.len() as u32).to_le_bytes()))
            .and_then(|_| self.output.write_all(payload))
            .map_err(|e| Error::io(&self.path, e))
    }
}

impl Drop for AlnWriter {
    fn drop(&mut self) {
        if !self.closed {
            log::warn!(
                "alignment container {} dropped without close(); file is not readable",
                self.path.display()
            );
        }
    }
}

fn parse_alignment(payload: &[u8], path: &Path) -> Result<AlignmentRecord> {
    if payload.len() != ALIGNMENT_PAYLOAD_LEN as usize {
        return Err(Error::Format(format!(
            "{}: alignment record has {} bytes, expected {}",
            path.display(),
            payload.len(),
            ALIGNMENT_PAYLOAD_LEN
        )));
    }
    let u32_at = |o: usize| u32::from_le_bytes(payload[o..o + 4].try_into().unwrap());
    let u64_at = |o: usize| u64::from_le_bytes(payload[o..o + 8].try_into().unwrap());
    let f64_at = |o: usize| f64::from_le_bytes(payload[o..o + 8].try_into().unwrap());

    let strand = match payload[56] {
        0 => Strand::Forward,
        1 => Strand::Reverse,
        other => {
            return Err(Error::Format(format!(
                "{}: bad strand byte {other}",
                path.display()
            )))
        }
    };

    Ok(AlignmentRecord {
        query_id: u32_at(0),
        target_id: u32_at(4),
        query_start: u64_at(8),
        query_end: u64_at(16),
        target_start: u64_at(24),
        target_end: u64_at(32),
        query_len: u64_at(40),
        target_len: u64_at(48),
        strand,
        diffs: u32_at(57),
        stats: RecordStats {
            identity: f64_at(61),
            block_len: u64_at(69),
            merge_count: u32_at(77),
            complexity: f64_at(81),
            flags: payload[89],
        },
    })
}

fn read_exact(r: &mut impl Read, path: &Path, buf: &mut [u8]) -> Result<()> {
    r.read_exact(buf).map_err(|e| Error::io(path, e))
}

fn read_u16(r: &mut impl Read, path: &Path) -> Result<u16> {
    let mut buf = [0u8; 2];
    read_exact(r, path, &mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32(r: &mut impl Read, path: &Path) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_exact(r, path, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read, path: &Path) -> Result<u64> {
    let mut buf = [0u8; 8];
    read_exact(r, path, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn write_u16(w: &mut impl Write, path: &Path, v: u16) -> Result<()> {
    w.write_all(&v.to_le_bytes()).map_err(|e| Error::io(path, e))
}

fn write_u64(w: &mut impl Write, path: &Path, v: u64) -> Result<()> {
    w.write_all(&v.to_le_bytes()).map_err(|e| Error::io(path, e))
}
