//! Row assembly: turns the scanner's cell stream into data rows, absorbing
//! `skip-head` and multi-row headers along the way.
//!
//! The scanner (`scanner.rs`) only knows about cells and row boundaries; it
//! has no notion of "this row is a header". That's layered on top here,
//! matching spec.md §4.2's description: a configurable number of leading
//! rows are discarded outright (`skip_head`), then a configurable number of
//! rows (`header_row_span`) are folded into one logical header by joining
//! each column's values with `;`, and any entirely-blank row encountered
//! while still absorbing header rows is skipped without counting against
//! the span. Everything after that is a data row, numbered from zero.

use crate::scanner::Cell;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Skipping,
    Header,
    Data,
}

/// What `HeaderAssembler::feed` did with one scanned row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowKind {
    /// Consumed by `skip_head`; never seen by the caller again.
    Skipped,
    /// A blank row encountered while still absorbing header rows; doesn't
    /// count against `header_row_span`.
    BlankHeaderSkipped,
    /// Folded into the header; `header()` reflects the update.
    HeaderPart,
    /// A data row, with its zero-based data row index. The row's cells were
    /// appended to the caller's `out` buffer.
    Data(u64),
}

/// Absorbs `skip_head` + `header_row_span` rows, then passes the rest
/// through as numbered data rows.
#[derive(Debug)]
pub struct HeaderAssembler {
    header_row_span: usize,
    skip_head: usize,
    keep_blank_header_rows: bool,
    skipped: usize,
    header_rows_absorbed: usize,
    header_cols: Vec<String>,
    phase: Phase,
    next_data_row: u64,
}

impl HeaderAssembler {
    pub fn new(skip_head: usize, header_row_span: usize, keep_blank_header_rows: bool) -> Self {
        let phase = if skip_head > 0 {
            Phase::Skipping
        } else if header_row_span > 0 {
            Phase::Header
        } else {
            Phase::Data
        };
        HeaderAssembler {
            header_row_span,
            skip_head,
            keep_blank_header_rows,
            skipped: 0,
            header_rows_absorbed: 0,
            header_cols: Vec::new(),
            phase,
            next_data_row: 0,
        }
    }

    /// The header columns assembled so far (stable once `feed` stops
    /// returning `HeaderPart`).
    pub fn header(&self) -> &[String] {
        &self.header_cols
    }

    /// Whether `feed` has finished absorbing `skip_head`/`header_row_span`
    /// rows and will classify the next row as `Data`.
    pub fn is_in_data_phase(&self) -> bool {
        self.phase == Phase::Data
    }

    /// Feed one scanned row's cells. Data rows are appended to `out`;
    /// skipped/header rows leave `out` untouched.
    pub fn feed<'a>(&mut self, cells: &[Cell<'a>], out: &mut Vec<Cell<'a>>) -> RowKind {
        match self.phase {
            Phase::Skipping => {
                self.skipped += 1;
                if self.skipped >= self.skip_head {
                    self.phase = if self.header_row_span > 0 { Phase::Header } else { Phase::Data };
                }
                RowKind::Skipped
            }
            Phase::Header => {
                if !self.keep_blank_header_rows && cells.iter().all(|c| c.buf.is_empty()) {
                    return RowKind::BlankHeaderSkipped;
                }
                self.absorb_header_row(cells);
                self.header_rows_absorbed += 1;
                if self.header_rows_absorbed >= self.header_row_span {
                    self.phase = Phase::Data;
                }
                RowKind::HeaderPart
            }
            Phase::Data => {
                out.extend_from_slice(cells);
                let idx = self.next_data_row;
                self.next_data_row += 1;
                RowKind::Data(idx)
            }
        }
    }

    fn absorb_header_row(&mut self, cells: &[Cell<'_>]) {
        for (i, cell) in cells.iter().enumerate() {
            let text = cell_text(cell);
            if text.is_empty() {
                continue;
            }
            match self.header_cols.get_mut(i) {
                None => self.header_cols.push(text),
                Some(existing) if existing.is_empty() => *existing = text,
                Some(existing) => {
                    existing.push(';');
                    existing.push_str(&text);
                }
            }
        }
        // A later header row naming fewer columns than an earlier one must
        // not shrink `header_cols`; pad with empty strings so column
        // indices stay aligned with the widest header row seen.
        while self.header_cols.len() < cells.len() {
            self.header_cols.push(String::new());
        }
    }
}

fn cell_text(cell: &Cell<'_>) -> String {
    match cell.try_as_str() {
        Ok(s) => s.into_owned(),
        Err(_) => String::from_utf8_lossy(&cell.unescape()).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(s: &str) -> Cell<'_> {
        Cell { buf: s.as_bytes(), quoted: false, overwritten: false }
    }

    #[test]
    fn skip_head_then_single_row_header() {
        let mut a = HeaderAssembler::new(1, 1, false);
        let mut out = Vec::new();
        assert_eq!(a.feed(&[cell("junk")], &mut out), RowKind::Skipped);
        assert_eq!(a.feed(&[cell("a"), cell("b")], &mut out), RowKind::HeaderPart);
        assert_eq!(a.header(), &["a".to_string(), "b".to_string()]);
        assert_eq!(a.feed(&[cell("1"), cell("2")], &mut out), RowKind::Data(0));
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn multi_row_header_joins_with_semicolon() {
        let mut a = HeaderAssembler::new(0, 2, false);
        let mut out = Vec::new();
        a.feed(&[cell("group"), cell("")], &mut out);
        a.feed(&[cell("name"), cell("age")], &mut out);
        assert_eq!(a.header(), &["group;name".to_string(), "age".to_string()]);
        assert_eq!(a.feed(&[cell("x"), cell("1")], &mut out), RowKind::Data(0));
    }

    #[test]
    fn blank_row_during_header_does_not_count_against_span() {
        let mut a = HeaderAssembler::new(0, 1, false);
        let mut out = Vec::new();
        assert_eq!(a.feed(&[cell(""), cell("")], &mut out), RowKind::BlankHeaderSkipped);
        assert_eq!(a.feed(&[cell("a"), cell("b")], &mut out), RowKind::HeaderPart);
        assert_eq!(a.feed(&[cell("1"), cell("2")], &mut out), RowKind::Data(0));
    }

    #[test]
    fn keep_blank_header_rows_absorbs_a_blank_row_into_the_span() {
        let mut a = HeaderAssembler::new(0, 2, true);
        let mut out = Vec::new();
        assert_eq!(a.feed(&[cell(""), cell("")], &mut out), RowKind::HeaderPart);
        assert_eq!(a.feed(&[cell("a"), cell("b")], &mut out), RowKind::HeaderPart);
        assert_eq!(a.header(), &["a".to_string(), "b".to_string()]);
        assert_eq!(a.feed(&[cell("1"), cell("2")], &mut out), RowKind::Data(0));
    }

    #[test]
    fn zero_header_rows_means_first_row_is_data() {
        let mut a = HeaderAssembler::new(0, 0, false);
        let mut out = Vec::new();
        assert_eq!(a.feed(&[cell("1"), cell("2")], &mut out), RowKind::Data(0));
        assert!(a.header().is_empty());
    }

    #[test]
    fn data_row_index_increments() {
        let mut a = HeaderAssembler::new(0, 0, false);
        let mut out = Vec::new();
        assert_eq!(a.feed(&[cell("a")], &mut out), RowKind::Data(0));
        assert_eq!(a.feed(&[cell("b")], &mut out), RowKind::Data(1));
        assert_eq!(a.feed(&[cell("c")], &mut out), RowKind::Data(2));
    }
}
