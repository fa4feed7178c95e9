//! Bulk CSV ingestion.
//!
//! One change per line, `IP,CHANGE`:
//!
//! ```text
//! 192.168.1.1,100      # absolute set to 100
//! 192.168.1.2,+50      # relative add of 50
//! 10.0.0.1,-25         # absolute set to -25
//! 10.0.0.2,+-10        # relative subtract of 10
//! ```
//!
//! Only a leading `+` marks a relative update; a bare `-N` is an absolute
//! set to a negative value, and `+-N` is the relative subtract. Blank lines
//! and `#` comments (whole-line or trailing) are skipped by the lexer;
//! whitespace around tokens is tolerated. A malformed line is counted and
//! skipped, never fatal, so one bad row cannot abort a large feed.

use crate::constants::BULK_READ_BUFFER;
use crate::errors::Error;
use crate::helpers::parse_ipv4_bytes;
use crate::types::ScoreEngine;
use log::{debug, info};
use metrics::counter;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::{Duration, Instant};

/// Per-load statistics.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BulkResult {
    /// Lines handed to the parser (everything except blank and comment
    /// lines), successful or not.
    pub lines_processed: u64,
    /// Lines the parser rejected.
    pub lines_skipped: u64,
    /// Absolute sets applied.
    pub sets: u64,
    /// Relative updates applied.
    pub updates: u64,
    /// Same population as `lines_skipped`, kept as a separate tally for
    /// embedders that report the two independently.
    pub parse_errors: u64,
    /// Wall time from first input byte to last.
    pub elapsed: Duration,
    /// Derived throughput over `lines_processed`.
    pub lines_per_second: f64,
}

/// One parsed line: a key plus either an absolute or a relative change.
enum Change {
    Set(i16),
    Update(i16),
}

/// Parse a single line of the mini-grammar. Returns `None` on any
/// malformed input; magnitudes saturate at +32767 during digit
/// accumulation.
fn parse_line(line: &[u8]) -> Option<(u32, Change)> {
    let mut pos = 0;
    let len = line.len();

    while pos < len && (line[pos] == b' ' || line[pos] == b'\t') {
        pos += 1;
    }

    // IP runs until the comma, with whitespace tolerated before it.
    let ip_start = pos;
    while pos < len && line[pos] != b',' && line[pos] != b' ' && line[pos] != b'\t' {
        pos += 1;
    }
    let ip = parse_ipv4_bytes(&line[ip_start..pos])?;

    while pos < len && (line[pos] == b' ' || line[pos] == b'\t') {
        pos += 1;
    }
    if pos >= len || line[pos] != b',' {
        return None;
    }
    pos += 1;
    while pos < len && (line[pos] == b' ' || line[pos] == b'\t') {
        pos += 1;
    }

    // Sign grammar: '+' = relative, '+-' = relative subtract,
    // '-' = absolute negative.
    let mut relative = false;
    let mut negative = false;
    if pos < len && line[pos] == b'+' {
        relative = true;
        pos += 1;
        if pos < len && line[pos] == b'-' {
            negative = true;
            pos += 1;
        }
    } else if pos < len && line[pos] == b'-' {
        negative = true;
        pos += 1;
    }

    if pos >= len || !line[pos].is_ascii_digit() {
        return None;
    }
    let mut value: i32 = 0;
    while pos < len && line[pos].is_ascii_digit() {
        value = value * 10 + (line[pos] - b'0') as i32;
        if value > 32767 {
            value = 32767;
        }
        pos += 1;
    }
    if negative {
        value = -value;
    }

    while pos < len
        && (line[pos] == b' ' || line[pos] == b'\t' || line[pos] == b'\r' || line[pos] == b'\n')
    {
        pos += 1;
    }
    // Anything left must be a trailing comment.
    if pos < len && line[pos] != b'#' {
        return None;
    }

    let value = value as i16;
    Some((ip, if relative { Change::Update(value) } else { Change::Set(value) }))
}

/// True when the lexer should drop the line without handing it to the
/// parser: blank, or a whole-line comment.
fn lexer_skips(line: &[u8]) -> bool {
    let trimmed: &[u8] = match line {
        [rest @ .., b'\n'] => match rest {
            [r @ .., b'\r'] => r,
            r => r,
        },
        l => l,
    };
    trimmed.is_empty() || trimmed[0] == b'#'
}

impl ScoreEngine {
    fn apply_line(&self, line: &[u8], stats: &mut BulkResult) {
        if lexer_skips(line) {
            return;
        }
        stats.lines_processed += 1;

        match parse_line(line) {
            Some((ip, Change::Set(value))) => {
                self.set(ip, value);
                stats.sets += 1;
            }
            Some((ip, Change::Update(delta))) => {
                self.increment(ip, delta);
                stats.updates += 1;
            }
            None => {
                stats.parse_errors += 1;
                stats.lines_skipped += 1;
            }
        }
    }

    fn finish(stats: &mut BulkResult, started: Instant) {
        stats.elapsed = started.elapsed();
        let secs = stats.elapsed.as_secs_f64();
        stats.lines_per_second = if secs > 0.0 {
            stats.lines_processed as f64 / secs
        } else {
            0.0
        };
        counter!("ipscore_bulk_lines_total").increment(stats.lines_processed);
        counter!("ipscore_bulk_parse_errors_total").increment(stats.parse_errors);
    }

    /// Load score changes from a CSV file.
    ///
    /// An unopenable file fails with no partial effect; malformed lines are
    /// tallied and skipped. Safe to run concurrently with any other
    /// operation — only the per-line write takes locks.
    pub fn bulk_load<P: AsRef<Path>>(&self, path: P) -> Result<BulkResult, Error> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let mut reader = BufReader::with_capacity(BULK_READ_BUFFER, file);

        let mut stats = BulkResult::default();
        let started = Instant::now();
        let mut line = Vec::with_capacity(64);
        loop {
            line.clear();
            let n = reader.read_until(b'\n', &mut line)?;
            if n == 0 {
                break;
            }
            self.apply_line(&line, &mut stats);
        }
        Self::finish(&mut stats, started);

        info!(
            "bulk load {}: {} lines, {} sets, {} updates, {} errors ({:.0} lines/s)",
            path.display(),
            stats.lines_processed,
            stats.sets,
            stats.updates,
            stats.parse_errors,
            stats.lines_per_second,
        );
        Ok(stats)
    }

    /// Load score changes from an in-memory buffer; line semantics are
    /// identical to [`bulk_load`](Self::bulk_load).
    pub fn bulk_load_buffer(&self, data: &[u8]) -> BulkResult {
        let mut stats = BulkResult::default();
        let started = Instant::now();
        for line in data.split(|&b| b == b'\n') {
            // split() yields one empty trailing chunk for newline-terminated
            // input; the lexer drops it like any blank line.
            self.apply_line(line, &mut stats);
        }
        Self::finish(&mut stats, started);
        debug!(
            "bulk buffer: {} lines, {} sets, {} updates, {} errors",
            stats.lines_processed, stats.sets, stats.updates, stats.parse_errors,
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(line: &str) -> Option<(u32, i16, bool)> {
        parse_line(line.as_bytes()).map(|(ip, change)| match change {
            Change::Set(v) => (ip, v, false),
            Change::Update(v) => (ip, v, true),
        })
    }

    #[test]
    fn grammar_forms() {
        assert_eq!(parsed("192.168.1.1,100"), Some((0xC0A80101, 100, false)));
        assert_eq!(parsed("192.168.1.2,+50"), Some((0xC0A80102, 50, true)));
        assert_eq!(parsed("10.0.0.1,-25"), Some((0x0A000001, -25, false)));
        assert_eq!(parsed("10.0.0.2,+-10"), Some((0x0A000002, -10, true)));
    }

    #[test]
    fn whitespace_and_comments_tolerated() {
        assert_eq!(parsed("  1.2.3.4 , +5 \r\n"), Some((0x01020304, 5, true)));
        assert_eq!(parsed("1.2.3.4,7 # trailing"), Some((0x01020304, 7, false)));
    }

    #[test]
    fn magnitude_saturates_during_parse() {
        assert_eq!(parsed("1.2.3.4,99999"), Some((0x01020304, 32767, false)));
        assert_eq!(parsed("1.2.3.4,-99999"), Some((0x01020304, -32767, false)));
    }

    #[test]
    fn malformed_lines_rejected() {
        for bad in [
            "1.2.3.4",         // no change
            "1.2.3.4,",        // empty change
            "1.2.3.4,+",       // sign without digits
            "1.2.3.4,+-",      // signs without digits
            "1.2.3.4,12x",     // junk after digits
            "1.2.3,5",         // short IP
            "1.2.3.400,5",     // octet out of range
            "1.2.3.4;5",       // wrong separator
        ] {
            assert!(parsed(bad).is_none(), "accepted {bad:?}");
        }
    }

    #[test]
    fn lexer_skips_blank_and_comment_lines() {
        assert!(lexer_skips(b""));
        assert!(lexer_skips(b"\n"));
        assert!(lexer_skips(b"\r\n"));
        assert!(lexer_skips(b"# comment\n"));
        assert!(!lexer_skips(b"1.2.3.4,5\n"));
    }
}
