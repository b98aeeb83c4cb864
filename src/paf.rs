// Tabular (PAF) alignment format support.
//
// The external aligner emits one record per line, tab-separated: query
// name, query length, query start, query end, strand, target name, target
// length, target start, target end, match count, block length, mapping
// quality, then optional typed tags. Unknown tags are ignored; missing
// optional tags fall back to documented defaults.

use std::fmt::Write as _;

use crate::catalog::SequenceCatalog;
use crate::defaults::PAF_MANDATORY_FIELDS;
use crate::error::{Error, Result};
use crate::record::{AlignmentRecord, RecordStats, Strand};

/// Incremental tabular parser.
///
/// Interns sequence names into a pair of growing catalogs so downstream
/// consumers work with integer ids; the catalogs are frozen (shared
/// read-only) once the stream ends.
#[derive(Debug, Default)]
pub struct PafParser {
    queries: SequenceCatalog,
    targets: SequenceCatalog,
    lines_seen: u64,
    lines_skipped: u64,
}

impl PafParser {
    pub fn new() -> Self {
        PafParser::default()
    }

    /// Parse one line into a record.
    ///
    /// Returns `Err(Format)` for malformed lines; callers recover by
    /// skipping the line (see [`PafParser::parse_or_skip`]) so a single bad
    /// line never aborts a multi-million-record stream.
    pub fn parse_line(&mut self, line: &str) -> Result<AlignmentRecord> {
        self.lines_seen += 1;
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < PAF_MANDATORY_FIELDS {
            return Err(Error::Format(format!(
                "line {}: {} fields, expected at least {}",
                self.lines_seen,
                fields.len(),
                PAF_MANDATORY_FIELDS
            )));
        }

        let query_name = fields[0];
        let query_len = parse_num(fields[1], self.lines_seen, "query length")?;
        let query_start = parse_num(fields[2], self.lines_seen, "query start")?;
        let query_end = parse_num(fields[3], self.lines_seen, "query end")?;
        let strand = fields[4]
            .chars()
            .next()
            .and_then(Strand::from_char)
            .ok_or_else(|| {
                Error::Format(format!("line {}: bad strand {:?}", self.lines_seen, fields[4]))
            })?;
        let target_name = fields[5];
        let target_len = parse_num(fields[6], self.lines_seen, "target length")?;
        let target_start = parse_num(fields[7], self.lines_seen, "target start")?;
        let target_end = parse_num(fields[8], self.lines_seen, "target end")?;
        let matches: u64 = parse_num(fields[9], self.lines_seen, "match count")?;
        let block_len: u64 = parse_num(fields[10], self.lines_seen, "block length")?;
        // Field 11 is mapping quality; we validate it but carry no use for it.
        let _mapq: u64 = parse_num(fields[11], self.lines_seen, "mapping quality")?;

        let query_id = self.intern_query(query_name, query_len);
        let target_id = self.intern_target(target_name, target_len);

        let mut stats = RecordStats {
            block_len,
            ..RecordStats::default()
        };
        let mut diffs = block_len.saturating_sub(matches) as u32;

        for tag in &fields[PAF_MANDATORY_FIELDS..] {
            if let Some(value) = tag.strip_prefix("NM:i:") {
                if let Ok(nm) = value.parse::<u32>() {
                    diffs = nm;
                }
            } else if let Some(value) = tag.strip_prefix("dv:f:") {
                if let Ok(dv) = value.parse::<f64>() {
                    stats.identity = 1.0 - dv;
                }
            } else if let Some(value) = tag.strip_prefix("id:f:") {
                if let Ok(id) = value.parse::<f64>() {
                    stats.identity = id;
                }
            }
            // cg:Z (CIGAR), tp:A and anything else: ignored here.
        }

        // Documented default: identity = matches / block_len when no tag
        // carried it.
        if stats.identity == 0.0 && block_len > 0 {
            stats.identity = matches as f64 / block_len as f64;
        }

        Ok(AlignmentRecord {
            query_id,
            query_start,
            query_end,
            target_id,
            target_start,
            target_end,
            strand,
            diffs,
            query_len,
            target_len,
            stats,
        })
    }

    /// Parse a line, logging and counting malformed ones instead of
    /// propagating the error.
    pub fn parse_or_skip(&mut self, line: &str) -> Option<AlignmentRecord> {
        match self.parse_line(line) {
            Ok(rec) => Some(rec),
            Err(e) => {
                self.lines_skipped += 1;
                log::warn!("skipping malformed tabular line: {e}");
                None
            }
        }
    }

    /// Number of malformed lines skipped so far.
    pub fn skipped(&self) -> u64 {
        self.lines_skipped
    }

    pub fn query_catalog(&self) -> &SequenceCatalog {
        &self.queries
    }

    pub fn target_catalog(&self) -> &SequenceCatalog {
        &self.targets
    }

    /// Consume the parser, yielding the frozen catalogs.
    pub fn into_catalogs(self) -> (SequenceCatalog, SequenceCatalog) {
        (self.queries, self.targets)
    }

    fn intern_query(&mut self, name: &str, len: u64) -> u32 {
        match self.queries.id(name) {
            Some(id) => id,
            None => self.queries.push(name.to_string(), len),
        }
    }

    fn intern_target(&mut self, name: &str, len: u64) -> u32 {
        match self.targets.id(name) {
            Some(id) => id,
            None => self.targets.push(name.to_string(), len),
        }
    }
}

fn parse_num<T: std::str::FromStr>(field: &str, line: u64, what: &str) -> Result<T> {
    field
        .parse()
        .map_err(|_| Error::Format(format!("line {line}: invalid {what} {field:?}")))
}

/// Format a record as a PAF line using the given catalogs for names.
pub fn format_line(
    rec: &AlignmentRecord,
    queries: &SequenceCatalog,
    targets: &SequenceCatalog,
) -> String {
    let qname = queries.name(rec.query_id).unwrap_or("*");
    let tname = targets.name(rec.target_id).unwrap_or("*");
    let block = rec.block_len();
    let matches = block.saturating_sub(rec.diffs as u64);
    let mut line = format!(
        "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
        qname,
        rec.query_len,
        rec.query_start,
        rec.query_end,
        rec.strand.as_char(),
        tname,
        rec.target_len,
        rec.target_start,
        rec.target_end,
        matches,
        block,
        crate::defaults::DEFAULT_MAPPING_QUALITY,
    );
    let _ = write!(line, "\tNM:i:{}\tid:f:{:.6}", rec.diffs, rec.identity());
    if rec.stats.merge_count > 1 {
        let _ = write!(line, "\tmc:i:{}", rec.stats.merge_count);
    }
    line
}
