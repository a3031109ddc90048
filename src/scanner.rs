//! The byte-oriented cell scanner: spec.md §4.1's state machine.
//!
//! This is a generalization of `lazycsv`'s `Csv` iterator, which scanned a
//! fixed `,`/`"` pair and only recognized `\n` as a terminator. Here the
//! delimiter is caller-settable,
//! `CR`, `LF`, and `CRLF` are all one terminator (tracked across buffer
//! refills via `pending_crlf_check`), quote handling can be switched off, and
//! a fixed-width mode bypasses the quote logic entirely.
//!
//! Cells are never copied or rewritten in place while scanning: a quoted
//! cell's span includes the surrounding quotes and any doubled `""` pairs
//! exactly as they appear in the source, matching the teacher's
//! `Cell { buf: &'a [u8] }`. [`unescape`] performs the forward-overwrite
//! collapse of `""` into `"` on demand, once a cell is actually read.

use memchr::{memchr, memchr2};

use crate::error::ParseStats;

/// A borrowed view over one field's bytes in the row currently being parsed.
///
/// Valid only until the next `parse_more`/`next_row` call refills the
/// buffer. Callers who need a cell's bytes to outlive that must copy them
/// (e.g. via [`unescape`] into an owned `Vec<u8>`, or `.buf.to_vec()`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cell<'a> {
    /// The raw bytes of this cell, including surrounding quotes and any
    /// doubled `""` escapes if `quoted` is set.
    pub buf: &'a [u8],
    /// Set when the source used quotes (or escaping) for this cell, so
    /// writers must re-quote/re-escape it on output to round-trip safely.
    pub quoted: bool,
    /// Set when this cell's bytes were substituted from the overwrite
    /// store rather than the live input buffer (see `props.rs`).
    pub overwritten: bool,
}

impl<'a> Cell<'a> {
    /// An empty, unquoted, non-overwritten cell — what `get_cell(i)` returns
    /// for `i >= cell_count()`.
    pub const EMPTY: Cell<'static> = Cell { buf: &[], quoted: false, overwritten: false };

    /// Collapse a quoted cell's surrounding quotes and doubled `""` escapes.
    ///
    /// Unquoted cells are returned borrowed, at no cost. Quoted cells
    /// without any doubled-quote pairs are also returned borrowed (just the
    /// inner slice, quotes trimmed). Only a cell containing `""` pairs
    /// triggers an allocation, in which case the doubling is collapsed by
    /// overwriting forward into a fresh buffer — the technique spec.md's
    /// `unescape` helper describes.
    pub fn unescape(&self) -> std::borrow::Cow<'a, [u8]> {
        use std::borrow::Cow;
        if !self.quoted || self.buf.len() < 2 {
            return Cow::Borrowed(self.buf);
        }
        let inner = &self.buf[1..self.buf.len() - 1];
        match memchr(b'"', inner) {
            None => Cow::Borrowed(inner),
            Some(_) => {
                let mut out = Vec::with_capacity(inner.len());
                let mut i = 0;
                while i < inner.len() {
                    if inner[i] == b'"' && i + 1 < inner.len() && inner[i + 1] == b'"' {
                        out.push(b'"');
                        i += 2;
                    } else {
                        out.push(inner[i]);
                        i += 1;
                    }
                }
                Cow::Owned(out)
            }
        }
    }

    /// Convenience: [`Cell::unescape`] interpreted as UTF-8.
    pub fn try_as_str(&self) -> Result<std::borrow::Cow<'a, str>, std::str::Utf8Error> {
        match self.unescape() {
            std::borrow::Cow::Borrowed(b) => std::str::from_utf8(b).map(std::borrow::Cow::Borrowed),
            std::borrow::Cow::Owned(v) => {
                let s = String::from_utf8(v).map_err(|e| e.utf8_error())?;
                Ok(std::borrow::Cow::Owned(s))
            }
        }
    }
}

/// Whether a stray quote in an unexpected position is tolerated or fatal.
///
/// See SPEC_FULL.md §9 — this was an open question in the source; tolerant
/// matches the original's behavior and is the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrictMode {
    /// A quote not followed by quote/delimiter/EOL is kept literally and
    /// counted on `ParseStats::quote_misuse`. Matches the source.
    #[default]
    Tolerant,
    /// The same condition aborts the current row with `ParseError::QuoteMisuse`.
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    FieldStart,
    InUnquoted,
    InQuoted,
    QuoteSeen,
}

/// Half-open byte span of one cell within the buffer being scanned, plus
/// whether it was quoted. Converted to a [`Cell`] by borrowing the same
/// buffer slice once the row assembler has a stable buffer reference.
#[derive(Debug, Clone, Copy)]
pub struct CellSpan {
    pub start: usize,
    pub end: usize,
    pub quoted: bool,
}

/// Result of scanning as far as possible from a given position.
#[derive(Debug)]
pub enum RowOutcome {
    /// A full row was scanned; cells were appended to the caller's buffer.
    /// `next_pos` is where the next row (or EOF) begins.
    Complete { next_pos: usize },
    /// The buffer was exhausted mid-row. The scanner's internal state was
    /// updated so a later call with more data continues correctly.
    NeedMoreData,
    /// The in-progress row exceeded `max_row_size`. The scanner has
    /// re-synchronized to the byte just after the next terminator found (or
    /// requests more data if none was found yet).
    RowTooLarge { next_pos: Option<usize> },
    /// `strict_mode` is `Strict` and a quote appeared where spec.md's state
    /// table treats it as tolerable garbage. `pos` is the offending offset.
    QuoteMisuse { pos: usize },
}

/// Configuration the scanner needs per call; owned by `ParseOptions` in
/// `parser.rs` and borrowed here.
#[derive(Debug, Clone, Copy)]
pub struct ScanConfig<'o> {
    pub delimiter: u8,
    pub quote_enabled: bool,
    pub strict_mode: StrictMode,
    pub max_row_size: usize,
    pub max_columns: usize,
    /// When set, the scanner ignores `delimiter`/`quote_enabled` entirely
    /// and instead carves each row at these end-offsets (fixed-width mode,
    /// spec.md §4.1).
    pub fixed_offsets: Option<&'o [usize]>,
}

/// The stateful byte scanner. Holds only what must survive a buffer refill:
/// the state-machine state, the current cell's start offset, the current
/// row's start offset (for `max_row_size` enforcement), and whether a CR
/// was just seen with its paired LF not yet confirmed.
#[derive(Debug)]
pub struct Scanner {
    state: State,
    cell_start: usize,
    row_start: usize,
    /// Byte offset to resume scanning from on the next `scan_row` call when
    /// a row is left mid-flight (`RowOutcome::NeedMoreData`). The caller's
    /// own `pos` argument is only trustworthy at a fresh row boundary
    /// (`at_row_start`); mid-row it may be stale (e.g. still pointing at the
    /// row's start), so the scanner tracks its own cursor across refills.
    resume_pos: usize,
    pending_crlf_check: bool,
    /// True exactly when the scanner sits at a row boundary outside any
    /// quoted field — the "chunk-safe boundary" predicate from spec.md §4.4.
    at_row_start: bool,
    /// Set once a row's overflow has already been counted, so re-entering
    /// `scan_row` while still hunting for the re-sync terminator doesn't
    /// count the same overflow twice.
    overflowed: bool,
}

impl Scanner {
    pub fn new() -> Self {
        Scanner {
            state: State::FieldStart,
            cell_start: 0,
            row_start: 0,
            resume_pos: 0,
            pending_crlf_check: false,
            at_row_start: true,
            overflowed: false,
        }
    }

    /// `RowStart ∧ ¬inside_quoted_field`, per spec.md's chunk-safe-boundary
    /// definition.
    pub fn at_safe_boundary(&self) -> bool {
        self.at_row_start && matches!(self.state, State::FieldStart)
    }

    /// Byte offset of the row currently (or most recently) in progress.
    /// Everything before this offset belongs to a row already delivered to
    /// the caller and can be safely dropped from the buffer.
    pub fn row_start(&self) -> usize {
        self.row_start
    }

    pub fn inside_quoted_field(&self) -> bool {
        matches!(self.state, State::InQuoted | State::QuoteSeen)
    }

    /// Shift all internally-held absolute offsets down by `shift`, used by
    /// the parser after compacting the ring buffer.
    pub fn rebase(&mut self, shift: usize) {
        self.cell_start = self.cell_start.saturating_sub(shift);
        self.row_start = self.row_start.saturating_sub(shift);
        self.resume_pos = self.resume_pos.saturating_sub(shift);
    }

    /// Scan forward from `pos` in `buf` (valid data ends at `buf.len()`),
    /// appending cell spans to `cells` until a row completes, the buffer is
    /// exhausted, or an error condition is hit.
    pub fn scan_row(
        &mut self,
        buf: &[u8],
        pos: usize,
        cfg: &ScanConfig,
        cells: &mut Vec<CellSpan>,
        stats: &mut ParseStats,
    ) -> RowOutcome {
        if let Some(offsets) = cfg.fixed_offsets {
            return self.scan_row_fixed(buf, pos, offsets, cfg, cells, stats);
        }
        self.scan_row_delimited(buf, pos, cfg, cells, stats)
    }

    fn scan_row_delimited(
        &mut self,
        buf: &[u8],
        pos: usize,
        cfg: &ScanConfig,
        cells: &mut Vec<CellSpan>,
        stats: &mut ParseStats,
    ) -> RowOutcome {
        // Only a fresh row boundary can trust the caller's `pos`; resuming
        // mid-row must continue from where this scanner itself left off,
        // since `cell_start`/`state` have already advanced past `pos`.
        let mut pos = if self.at_row_start { pos } else { self.resume_pos };
        if self.at_row_start {
            self.row_start = pos;
            self.cell_start = pos;
            self.at_row_start = false;
        }

        if self.pending_crlf_check {
            self.pending_crlf_check = false;
            if pos < buf.len() && buf[pos] == b'\n' {
                pos += 1;
                self.row_start = pos;
                self.cell_start = pos;
            }
        }

        loop {
            if !self.overflowed && cfg.max_row_size > 0 && pos.saturating_sub(self.row_start) > cfg.max_row_size {
                self.overflowed = true;
                stats.note_row_too_large();
            }
            if self.overflowed {
                return self.resync_after_overflow(buf, pos);
            }

            match self.state {
                State::InQuoted => match memchr(b'"', &buf[pos..]) {
                    None => {
                        pos = buf.len();
                        self.resume_pos = pos;
                        return RowOutcome::NeedMoreData;
                    }
                    Some(rel) => {
                        pos += rel + 1;
                        self.state = State::QuoteSeen;
                    }
                },
                State::QuoteSeen => {
                    if pos >= buf.len() {
                        self.resume_pos = pos;
                        return RowOutcome::NeedMoreData;
                    }
                    let c = buf[pos];
                    if c == b'"' {
                        // Doubled quote: stays part of the quoted cell.
                        pos += 1;
                        self.state = State::InQuoted;
                    } else if c == cfg.delimiter {
                        self.push_cell(cells, pos, true);
                        pos += 1;
                        self.state = State::FieldStart;
                        self.cell_start = pos;
                    } else if c == b'\r' || c == b'\n' {
                        self.push_cell(cells, pos, true);
                        let next_pos = self.consume_terminator(buf, pos, c);
                        return self.finish_row(next_pos, cells, stats);
                    } else {
                        stats.note_quote_misuse();
                        if cfg.strict_mode == StrictMode::Strict {
                            return RowOutcome::QuoteMisuse { pos };
                        }
                        // Tolerant: the stray quote is kept literally, but a
                        // quote that's already closed (followed by neither
                        // another quote, delimiter, nor EOL) means the rest
                        // of the cell is trailing unquoted garbage, not more
                        // quoted payload — resuming in `InQuoted` would hunt
                        // forever for a closing quote that will never come.
                        // Resume as `InUnquoted` instead, past the byte just
                        // examined, so the next delimiter/terminator is still
                        // found. The cell is pushed unquoted: its raw bytes
                        // (including the literal `"`) are preserved verbatim
                        // and the writer re-quotes on output since they
                        // contain a quote byte.
                        pos += 1;
                        self.state = State::InUnquoted;
                    }
                }
                State::FieldStart | State::InUnquoted => {
                    // A quote only opens a quoted field when it's the very
                    // first byte of the cell (RFC 4180: quotes must appear
                    // at the beginning of a cell). Anywhere else, a quote is
                    // ordinary field data.
                    if self.state == State::FieldStart {
                        if pos >= buf.len() {
                            self.resume_pos = pos;
                            return RowOutcome::NeedMoreData;
                        }
                        if cfg.quote_enabled && buf[pos] == b'"' {
                            pos += 1;
                            self.state = State::InQuoted;
                            continue;
                        }
                        self.state = State::InUnquoted;
                    }

                    let rest = &buf[pos..];
                    let delim_rel = memchr(cfg.delimiter, rest);
                    let eol_rel = memchr2(b'\r', b'\n', rest);

                    let best = [
                        delim_rel.map(|r| (r, cfg.delimiter)),
                        eol_rel.map(|r| (r, rest[eol_rel.unwrap()])),
                    ]
                    .into_iter()
                    .flatten()
                    .min_by_key(|(r, _)| *r);

                    match best {
                        None => {
                            pos = buf.len();
                            self.resume_pos = pos;
                            return RowOutcome::NeedMoreData;
                        }
                        Some((rel, byte)) => {
                            let idx = pos + rel;
                            if byte == cfg.delimiter {
                                self.push_cell(cells, idx, false);
                                pos = idx + 1;
                                self.state = State::FieldStart;
                                self.cell_start = pos;
                            } else {
                                // CR or LF.
                                self.push_cell(cells, idx, false);
                                let next_pos = self.consume_terminator(buf, idx, byte);
                                return self.finish_row(next_pos, cells, stats);
                            }
                        }
                    }
                }
            }
        }
    }

    fn push_cell(&mut self, cells: &mut Vec<CellSpan>, end: usize, quoted: bool) {
        cells.push(CellSpan { start: self.cell_start, end, quoted });
    }

    /// Fixed-width row scan: quotes are not interpreted at all, so a row is
    /// just "bytes up to the next terminator", then carved at `offsets`.
    fn scan_row_fixed(
        &mut self,
        buf: &[u8],
        mut pos: usize,
        offsets: &[usize],
        cfg: &ScanConfig,
        cells: &mut Vec<CellSpan>,
        stats: &mut ParseStats,
    ) -> RowOutcome {
        if self.at_row_start {
            self.row_start = pos;
            self.at_row_start = false;
        }
        if self.pending_crlf_check {
            self.pending_crlf_check = false;
            if pos < buf.len() && buf[pos] == b'\n' {
                pos += 1;
                self.row_start = pos;
            }
        }
        if !self.overflowed && cfg.max_row_size > 0 && pos.saturating_sub(self.row_start) > cfg.max_row_size {
            self.overflowed = true;
            stats.note_row_too_large();
        }
        if self.overflowed {
            return self.resync_after_overflow(buf, pos);
        }
        match memchr2(b'\r', b'\n', &buf[pos..]) {
            None => RowOutcome::NeedMoreData,
            Some(rel) => {
                let idx = pos + rel;
                let row_start = self.row_start;
                match self.consume_terminator(buf, idx, buf[idx]) {
                    None => RowOutcome::NeedMoreData,
                    Some(next) => {
                        split_fixed_row(buf, row_start, idx, offsets, cells);
                        stats.rows_parsed += 1;
                        self.state = State::FieldStart;
                        self.row_start = next;
                        self.cell_start = next;
                        self.at_row_start = true;
                        RowOutcome::Complete { next_pos: next }
                    }
                }
            }
        }
    }

    /// Returns the byte offset right after the terminator, setting
    /// `pending_crlf_check` if a CR was consumed at the very end of the
    /// available buffer (so the paired LF might arrive on the next refill).
    fn consume_terminator(&mut self, buf: &[u8], idx: usize, byte: u8) -> Option<usize> {
        if byte == b'\r' {
            if idx + 1 < buf.len() {
                if buf[idx + 1] == b'\n' {
                    Some(idx + 2)
                } else {
                    Some(idx + 1)
                }
            } else {
                self.pending_crlf_check = true;
                Some(idx + 1)
            }
        } else {
            Some(idx + 1)
        }
    }

    fn finish_row(&mut self, next_pos: Option<usize>, cells: &mut Vec<CellSpan>, stats: &mut ParseStats) -> RowOutcome {
        match next_pos {
            None => RowOutcome::NeedMoreData,
            Some(next) => {
                stats.rows_parsed += 1;
                self.state = State::FieldStart;
                self.row_start = next;
                self.cell_start = next;
                self.at_row_start = true;
                let _ = cells;
                RowOutcome::Complete { next_pos: next }
            }
        }
    }

    fn resync_after_overflow(&mut self, buf: &[u8], pos: usize) -> RowOutcome {
        match memchr2(b'\r', b'\n', &buf[pos..]) {
            None => {
                self.resume_pos = buf.len();
                RowOutcome::RowTooLarge { next_pos: None }
            }
            Some(rel) => {
                let idx = pos + rel;
                let next = self.consume_terminator(buf, idx, buf[idx]).unwrap();
                self.state = State::FieldStart;
                self.row_start = next;
                self.cell_start = next;
                self.at_row_start = true;
                self.overflowed = false;
                RowOutcome::RowTooLarge { next_pos: Some(next) }
            }
        }
    }
}

impl Default for Scanner {
    fn default() -> Self {
        Self::new()
    }
}

/// Enforce the `max_columns` cap on a completed row's cell spans: returns
/// the spans truncated to the cap and whether any were dropped.
pub fn enforce_max_columns(spans: &mut Vec<CellSpan>, max_columns: usize, stats: &mut ParseStats) {
    if spans.len() > max_columns {
        spans.truncate(max_columns);
        stats.note_cell_overflow();
    }
}

/// Carve `buf[row_start..row_end]` into cells at each end-offset in
/// `offsets` (relative to `row_start`), trimming trailing spaces/tabs from
/// each cell. The remainder after the last offset forms the final cell.
pub fn split_fixed_row(buf: &[u8], row_start: usize, row_end: usize, offsets: &[usize], cells: &mut Vec<CellSpan>) {
    let mut start = row_start;
    for &off in offsets {
        let end = (row_start + off).min(row_end).max(start);
        cells.push(trim_trailing_span(buf, start, end));
        start = end;
    }
    cells.push(trim_trailing_span(buf, start, row_end));
}

fn trim_trailing_span(buf: &[u8], start: usize, mut end: usize) -> CellSpan {
    while end > start && matches!(buf[end - 1], b' ' | b'\t') {
        end -= 1;
    }
    CellSpan { start, end, quoted: false }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_all(input: &[u8], cfg: &ScanConfig) -> Vec<Vec<(String, bool)>> {
        let mut scanner = Scanner::new();
        let mut stats = ParseStats::default();
        let mut rows = Vec::new();
        let mut pos = 0;
        loop {
            let mut cells = Vec::new();
            match scanner.scan_row(input, pos, cfg, &mut cells, &mut stats) {
                RowOutcome::Complete { next_pos } => {
                    if cells.is_empty() && next_pos > input.len() {
                        break;
                    }
                    rows.push(
                        cells
                            .iter()
                            .map(|s| {
                                let c = Cell { buf: &input[s.start..s.end], quoted: s.quoted, overwritten: false };
                                (c.try_as_str().unwrap().to_string(), s.quoted)
                            })
                            .collect(),
                    );
                    pos = next_pos;
                    if pos >= input.len() {
                        break;
                    }
                }
                RowOutcome::NeedMoreData => break,
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
        rows
    }

    fn default_cfg() -> ScanConfig<'static> {
        ScanConfig {
            delimiter: b',',
            quote_enabled: true,
            strict_mode: StrictMode::Tolerant,
            max_row_size: 64 * 1024,
            max_columns: 1024,
            fixed_offsets: None,
        }
    }

    #[test]
    fn fixed_width_splits_at_offsets_and_trims_trailing_space() {
        let input = b"alice     30        Paris     \nbob       41        Rome      \n";
        let offsets = [10usize, 20];
        let cfg = ScanConfig { fixed_offsets: Some(&offsets), ..default_cfg() };
        let rows = scan_all(input, &cfg);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].iter().map(|(s, _)| s.as_str()).collect::<Vec<_>>(), vec!["alice", "30", "Paris"]);
        assert_eq!(rows[1].iter().map(|(s, _)| s.as_str()).collect::<Vec<_>>(), vec!["bob", "41", "Rome"]);
    }

    #[test]
    fn basic_quoting() {
        let input = b"a,b,c\n\"1\",\"x,y\",3\n4,\"he said \"\"hi\"\"\",5\n";
        let rows = scan_all(input, &default_cfg());
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].iter().map(|(s, _)| s.as_str()).collect::<Vec<_>>(), vec!["1", "x,y", "3"]);
        assert_eq!(rows[2][1].0, "he said \"hi\"");
        assert!(rows[1][0].1);
    }

    #[test]
    fn crlf_and_lf_equivalent() {
        let a = scan_all(b"a,b\r\n1,2\r\n", &default_cfg());
        let b = scan_all(b"a,b\n1,2\n", &default_cfg());
        assert_eq!(a.len(), b.len());
        for (ra, rb) in a.iter().zip(b.iter()) {
            assert_eq!(ra.iter().map(|(s, _)| s.clone()).collect::<Vec<_>>(), rb.iter().map(|(s, _)| s.clone()).collect::<Vec<_>>());
        }
    }

    #[test]
    fn embedded_newline_in_quotes() {
        let input = b"a,b\n1,\"line1\nline2\"\n";
        let rows = scan_all(input, &default_cfg());
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][1].0, "line1\nline2");
    }

    #[test]
    fn tolerant_stray_quote() {
        let input = b"a,\"b\"c,d\n";
        let rows = scan_all(input, &default_cfg());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].len(), 3);
        assert_eq!(rows[0][0].0, "a");
        assert_eq!(rows[0][1].0, "\"b\"c");
        assert_eq!(rows[0][2].0, "d");
    }

    #[test]
    fn tolerant_stray_quote_does_not_stall_on_following_rows() {
        let input = b"a,\"b\"c,d\ne,f,g\n";
        let rows = scan_all(input, &default_cfg());
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].iter().map(|(s, _)| s.as_str()).collect::<Vec<_>>(), vec!["e", "f", "g"]);
    }

    #[test]
    fn cell_count_equals_delimiter_count_plus_one() {
        let input = b"a,b,c,d,e\n";
        let rows = scan_all(input, &default_cfg());
        assert_eq!(rows[0].len(), 5);
    }

    #[test]
    fn max_columns_cap_drops_extra_cells() {
        let mut cells = Vec::new();
        for i in 0..5 {
            cells.push(CellSpan { start: i, end: i + 1, quoted: false });
        }
        let mut stats = ParseStats::default();
        enforce_max_columns(&mut cells, 3, &mut stats);
        assert_eq!(cells.len(), 3);
        assert_eq!(stats.cell_overflow, 1);
    }
}
