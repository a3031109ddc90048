//! Error kinds, parse statistics, and the push-API status enum.
//!
//! Recoverable data errors (row too large, too many cells, malformed UTF-8,
//! a stray quote in tolerant mode) never become a [`ParseError`]. They are
//! counted on [`ParseStats`] and parsing continues, per the disposition
//! table this crate implements.

use thiserror::Error;

/// Fatal errors that abort a `parse_more`/`next_row` call.
#[derive(Error, Debug)]
pub enum ParseError {
    /// A CLI flag or option value was invalid.
    #[error("invalid argument: {0}")]
    ArgInvalid(String),

    /// Failed to open, read, or write the input/output stream.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A single row exceeded `max_row_size` and strict re-sync is not possible
    /// (e.g. no terminator found before end of stream).
    #[error("row exceeds max_row_size ({0} bytes)")]
    RowTooLarge(usize),

    /// A quote appeared in an unexpected position while `strict_mode` is
    /// [`crate::parser::StrictMode::Strict`].
    #[error("quote in unexpected position at byte offset {0}")]
    QuoteMisuse(usize),

    /// Allocation failure. The parser is unusable after this is returned.
    #[error("out of memory")]
    Memory,

    /// Any other error.
    #[error("{0}")]
    Other(String),
}

/// Return status of the push API ([`crate::parser::ParserHandle::parse_more`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// A block was parsed; the caller may call `parse_more` again.
    Ok,
    /// Clean EOF; no more rows will be produced.
    NoMoreInput,
    /// `abort()` or SIGINT stopped parsing after the current row.
    Cancelled,
    /// Allocation failure; the parser is unusable.
    Memory,
    /// Any other fatal error.
    Error,
}

/// Running counters for recoverable parse anomalies, rows, and bytes.
///
/// Each `*_first` flag is consumed by the one-warning-per-kind policy in
/// `parser.rs`: the first time a counter is incremented, the caller logs a
/// single `log::warn!` and never repeats it for that parser handle.
#[derive(Debug, Default, Clone, Copy)]
pub struct ParseStats {
    /// Rows skipped to the next terminator for exceeding `max_row_size`.
    pub row_too_large: u64,
    /// Cells dropped for exceeding `max_columns` on a single row.
    pub cell_overflow: u64,
    /// Bytes replaced (or counted) as malformed UTF-8.
    pub malformed_utf8: u64,
    /// Quotes tolerated in an unexpected position (tolerant mode only).
    pub quote_misuse: u64,
    /// Rows successfully delivered (including the header row(s)).
    pub rows_parsed: u64,
    /// Cumulative bytes scanned from the input stream.
    pub bytes_scanned: u64,

    pub(crate) row_too_large_warned: bool,
    pub(crate) cell_overflow_warned: bool,
    pub(crate) malformed_utf8_warned: bool,
    pub(crate) quote_misuse_warned: bool,
}

impl ParseStats {
    pub(crate) fn note_row_too_large(&mut self) {
        self.row_too_large += 1;
        if !self.row_too_large_warned {
            self.row_too_large_warned = true;
            log::warn!("row exceeded max_row_size; skipping to next terminator");
        }
    }

    pub(crate) fn note_cell_overflow(&mut self) {
        self.cell_overflow += 1;
        if !self.cell_overflow_warned {
            self.cell_overflow_warned = true;
            log::warn!("row exceeded max_columns; extra cells dropped");
        }
    }

    pub(crate) fn note_malformed_utf8(&mut self) {
        self.malformed_utf8 += 1;
        if !self.malformed_utf8_warned {
            self.malformed_utf8_warned = true;
            log::warn!("malformed UTF-8 encountered; replacing");
        }
    }

    pub(crate) fn note_quote_misuse(&mut self) {
        self.quote_misuse += 1;
        if !self.quote_misuse_warned {
            self.quote_misuse_warned = true;
            log::warn!("quote in unexpected position; tolerating");
        }
    }
}
