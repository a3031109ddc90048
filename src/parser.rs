//! Parser façade: `ParseOptions`, `ParserHandle`, and the push (`parse_more`)
//! / pull (`next_row`) dual API described in spec.md §4.2.
//!
//! The pull API is a thin loop over the push API (spec.md §9's design
//! note): `next_row` drives `parse_more` until exactly one row has landed
//! in `current_cells`, suppressing the row/cell handlers for that span of
//! calls. Cells are never stored as borrowed `Cell<'a>` values on the
//! handle itself — that would make `ParserHandle` self-referential. Instead
//! each delivered row is a `Vec<CellEntry>`, either a `Span` borrowed from
//! `buffer` (the common, zero-copy case) or `Owned` bytes (the synthesized
//! header row, and any cell substituted by the overwrite store). `get_cell`
//! builds a `Cell<'_>` view on demand, borrowing `&self` rather than the
//! buffer directly.

use std::io::Read;

use crate::error::{ParseError, ParseStats, Status};
use crate::props::OverwriteCursor;
use crate::row::{HeaderAssembler, RowKind};
use crate::scanner::{enforce_max_columns, Cell, CellSpan, RowOutcome, ScanConfig, Scanner, StrictMode};

#[derive(Debug, Clone)]
enum CellEntry {
    Span(CellSpan),
    Owned(Vec<u8>, bool),
}

/// Options controlling a `ParserHandle`. See spec.md §4.2 for the full
/// option vocabulary.
#[derive(Clone)]
pub struct ParseOptions {
    pub delimiter: u8,
    pub quote_enabled: bool,
    pub strict_mode: StrictMode,
    /// Must be >= 8.
    pub max_columns: usize,
    /// Must be >= 32 KiB.
    pub max_row_size: usize,
    /// Must be >= `max_row_size`.
    pub buffer_size: usize,
    /// Number of rows folded into one logical header; 0 means no header.
    pub header_span: usize,
    pub skip_head: usize,
    pub keep_blank_header_rows: bool,
    /// A synthetic CSV row prepended before the real stream, e.g. to
    /// supply a header the file itself lacks.
    pub insert_header_row: Option<Vec<u8>>,
    /// Disabled (`None`), or the single byte used to replace an invalid
    /// UTF-8 start byte.
    pub malformed_utf8_replace: Option<u8>,
    pub verbose: bool,
    /// `Some(offsets)` switches to fixed-width mode (spec.md §4.1); quote
    /// handling is then ignored entirely.
    pub fixed_offsets: Option<Vec<usize>>,
    /// Size of the prefix `select --fixed-auto` reads to infer offsets.
    /// Open question in spec.md §9; 256 KiB matches the original.
    pub fixed_auto_detect_bytes: usize,
    /// Invoke the progress callback after roughly this many bytes scanned.
    pub progress_every_bytes: Option<u64>,
}

impl Default for ParseOptions {
    fn default() -> Self {
        ParseOptions {
            delimiter: b',',
            quote_enabled: true,
            strict_mode: StrictMode::default(),
            max_columns: 1024,
            max_row_size: 64 * 1024,
            buffer_size: 64 * 1024,
            header_span: 1,
            skip_head: 0,
            keep_blank_header_rows: false,
            insert_header_row: None,
            malformed_utf8_replace: None,
            verbose: false,
            fixed_offsets: None,
            fixed_auto_detect_bytes: 256 * 1024,
            progress_every_bytes: None,
        }
    }
}

impl ParseOptions {
    /// Validate option bounds per spec.md §4.2's `new(options)` contract.
    pub fn validate(&self) -> Result<(), ParseError> {
        if self.max_columns < 8 {
            return Err(ParseError::ArgInvalid("max_columns must be >= 8".into()));
        }
        if self.max_row_size < 32 * 1024 {
            return Err(ParseError::ArgInvalid("max_row_size must be >= 32 KiB".into()));
        }
        if self.buffer_size < self.max_row_size {
            return Err(ParseError::ArgInvalid("buffer_size must be >= max_row_size".into()));
        }
        if self.fixed_offsets.is_some() && self.quote_enabled {
            return Err(ParseError::ArgInvalid("fixed-width mode disallows quote handling".into()));
        }
        Ok(())
    }
}

/// The parser handle: owns the input stream, the refillable buffer, the
/// scanner/header-assembler state, and the caller's push-mode callbacks.
///
/// Not `Send`/`Sync`: per spec.md §5, each chunk worker owns a private
/// handle, never shared across threads.
pub struct ParserHandle {
    opts: ParseOptions,
    stream: Box<dyn Read>,
    buffer: Vec<u8>,
    scan_pos: usize,
    eof: bool,
    bom_checked: bool,
    scanner: Scanner,
    header: HeaderAssembler,
    header_row_delivered: bool,
    stats: ParseStats,
    cancelled: bool,
    finished: bool,
    suppress_handlers: bool,
    current_cells: Vec<CellEntry>,
    next_data_row: u64,
    last_error: Option<ParseError>,
    row_handler: Option<Box<dyn FnMut(&ParserHandle)>>,
    cell_handler: Option<Box<dyn FnMut(&ParserHandle, usize)>>,
    progress: Option<Box<dyn FnMut(u64)>>,
    scan_filter: Option<Box<dyn FnMut(&[u8])>>,
    overwrites: Option<OverwriteCursor>,
    bytes_since_progress: u64,
}

impl ParserHandle {
    /// Allocate a new parser over `stream`, validating `opts`. The
    /// `insert_header_row` bytes, if any, are preloaded as the first bytes
    /// scanned, ahead of anything read from `stream`.
    pub fn new(opts: ParseOptions, stream: Box<dyn Read>) -> Result<Self, ParseError> {
        opts.validate()?;
        let mut buffer = Vec::new();
        if let Some(insert) = &opts.insert_header_row {
            buffer.extend_from_slice(insert);
            if !buffer.ends_with(b"\n") {
                buffer.push(b'\n');
            }
        }
        Ok(ParserHandle {
            header: HeaderAssembler::new(opts.skip_head, opts.header_span, opts.keep_blank_header_rows),
            opts,
            stream,
            buffer,
            scan_pos: 0,
            eof: false,
            bom_checked: false,
            scanner: Scanner::new(),
            header_row_delivered: false,
            stats: ParseStats::default(),
            cancelled: false,
            finished: false,
            suppress_handlers: false,
            current_cells: Vec::new(),
            next_data_row: 0,
            last_error: None,
            row_handler: None,
            cell_handler: None,
            progress: None,
            scan_filter: None,
            overwrites: None,
            bytes_since_progress: 0,
        })
    }

    pub fn set_row_handler(&mut self, handler: Box<dyn FnMut(&ParserHandle)>) {
        self.row_handler = Some(handler);
    }

    pub fn set_cell_handler(&mut self, handler: Box<dyn FnMut(&ParserHandle, usize)>) {
        self.cell_handler = Some(handler);
    }

    pub fn set_progress(&mut self, callback: Box<dyn FnMut(u64)>) {
        self.progress = Some(callback);
    }

    /// Tee each refilled chunk to `filter` before it is scanned, e.g. to
    /// write a copy of the input during a first pass.
    pub fn set_scan_filter(&mut self, filter: Box<dyn FnMut(&[u8])>) {
        self.scan_filter = Some(filter);
    }

    pub fn set_overwrites(&mut self, cursor: OverwriteCursor) {
        self.overwrites = Some(cursor);
    }

    /// Switch to fixed-width mode; disallows quote handling.
    pub fn set_fixed_offsets(&mut self, offsets: Vec<usize>) {
        self.opts.quote_enabled = false;
        self.opts.fixed_offsets = Some(offsets);
    }

    pub fn stats(&self) -> &ParseStats {
        &self.stats
    }

    pub fn options(&self) -> &ParseOptions {
        &self.opts
    }

    /// The error behind the most recent `Status::Error`/`Status::Memory`.
    pub fn take_last_error(&mut self) -> Option<ParseError> {
        self.last_error.take()
    }

    /// Monotonically increasing count of bytes read from the stream, used
    /// by the chunker's `end_offset_limit` early-stop.
    pub fn cumulative_scanned_bytes(&self) -> u64 {
        self.stats.bytes_scanned
    }

    /// Ask the parser to stop after the row currently being delivered. Safe
    /// to call from within the row handler.
    pub fn abort(&mut self) {
        self.cancelled = true;
    }

    pub fn cell_count(&self) -> usize {
        self.current_cells.len()
    }

    /// Cell at `i`, or the empty cell when `i >= cell_count()`. Valid only
    /// until the next `parse_more`/`next_row` call.
    pub fn get_cell(&self, i: usize) -> Cell<'_> {
        match self.current_cells.get(i) {
            Some(CellEntry::Span(span)) => Cell { buf: &self.buffer[span.start..span.end], quoted: span.quoted, overwritten: false },
            Some(CellEntry::Owned(bytes, quoted)) => Cell { buf: bytes, quoted: *quoted, overwritten: true },
            None => Cell::EMPTY,
        }
    }

    pub fn header(&self) -> &[String] {
        self.header.header()
    }

    /// Push mode: read and scan one block, invoking the row/cell handler
    /// for every row completed within it.
    pub fn parse_more(&mut self) -> Status {
        if self.cancelled {
            return Status::Cancelled;
        }
        if let Err(status) = self.refill() {
            return status;
        }
        loop {
            if self.scan_pos > self.buffer.len() {
                self.scan_pos = self.buffer.len();
            }
            let cfg = self.scan_config();
            let mut spans = Vec::new();
            let outcome = self.scanner.scan_row(&self.buffer, self.scan_pos, &cfg, &mut spans, &mut self.stats);
            match outcome {
                RowOutcome::Complete { next_pos } => {
                    self.scan_pos = next_pos;
                    enforce_max_columns(&mut spans, self.opts.max_columns, &mut self.stats);
                    self.deliver(spans);
                    if self.cancelled {
                        return Status::Cancelled;
                    }
                }
                RowOutcome::NeedMoreData => {
                    return if self.eof { Status::NoMoreInput } else { Status::Ok };
                }
                RowOutcome::RowTooLarge { next_pos } => match next_pos {
                    Some(p) => {
                        self.scan_pos = p;
                        continue;
                    }
                    None => return if self.eof { Status::Error } else { Status::Ok },
                },
                RowOutcome::QuoteMisuse { pos } => {
                    self.last_error = Some(ParseError::QuoteMisuse(pos));
                    return Status::Error;
                }
            }
        }
    }

    /// Pull mode: drive `parse_more` until one row has been assembled, then
    /// return it without invoking the row/cell handler.
    pub fn next_row(&mut self) -> Result<Option<()>, ParseError> {
        self.suppress_handlers = true;
        let before_data = self.next_data_row;
        let before_header = self.header_row_delivered;
        let result = loop {
            match self.parse_more() {
                Status::Ok => {
                    if self.next_data_row != before_data || self.header_row_delivered != before_header {
                        break Ok(Some(()));
                    }
                }
                Status::NoMoreInput | Status::Cancelled => break Ok(None),
                Status::Memory => break Err(ParseError::Memory),
                Status::Error => break Err(self.last_error.take().unwrap_or(ParseError::Other("parse error".into()))),
            }
        };
        self.suppress_handlers = false;
        result
    }

    /// Flush: if the stream ended without a trailing terminator, emit the
    /// final (unterminated) row.
    pub fn finish(&mut self) -> Status {
        if self.finished {
            return Status::NoMoreInput;
        }
        self.finished = true;
        if self.eof && self.scan_pos < self.buffer.len() {
            self.buffer.push(b'\n');
            let cfg = self.scan_config();
            let mut spans = Vec::new();
            if let RowOutcome::Complete { next_pos } =
                self.scanner.scan_row(&self.buffer, self.scan_pos, &cfg, &mut spans, &mut self.stats)
            {
                self.scan_pos = next_pos;
                enforce_max_columns(&mut spans, self.opts.max_columns, &mut self.stats);
                self.deliver(spans);
            }
        }
        Status::NoMoreInput
    }

    fn scan_config(&self) -> ScanConfig<'_> {
        ScanConfig {
            delimiter: self.opts.delimiter,
            quote_enabled: self.opts.quote_enabled,
            strict_mode: self.opts.strict_mode,
            max_row_size: self.opts.max_row_size,
            max_columns: usize::MAX, // enforced post-scan, uniformly for both modes
            fixed_offsets: self.opts.fixed_offsets.as_deref(),
        }
    }

    fn deliver(&mut self, spans: Vec<CellSpan>) {
        let cells: Vec<Cell<'_>> =
            spans.iter().map(|s| Cell { buf: &self.buffer[s.start..s.end], quoted: s.quoted, overwritten: false }).collect();
        let mut out = Vec::new();
        let was_header_phase = !self.header.is_in_data_phase();
        let kind = self.header.feed(&cells, &mut out);
        match kind {
            RowKind::Skipped | RowKind::BlankHeaderSkipped => {}
            RowKind::HeaderPart => {
                if was_header_phase && self.header.is_in_data_phase() && !self.header_row_delivered {
                    self.deliver_header_row();
                }
            }
            RowKind::Data(idx) => {
                self.next_data_row = idx + 1;
                self.current_cells = self.apply_overwrites(idx + 1, spans);
                self.invoke_handlers();
            }
        }
    }

    fn deliver_header_row(&mut self) {
        self.header_row_delivered = true;
        self.current_cells = self.header.header().iter().map(|s| CellEntry::Owned(s.clone().into_bytes(), false)).collect();
        self.invoke_handlers();
    }

    /// Row 0 is the header row in the overwrite store's numbering
    /// (spec.md §6); data rows are numbered 1, 2, ... from there.
    fn apply_overwrites(&mut self, row_index: u64, spans: Vec<CellSpan>) -> Vec<CellEntry> {
        let Some(cursor) = self.overwrites.as_mut() else {
            return spans.into_iter().map(CellEntry::Span).collect();
        };
        let mut entries: Vec<CellEntry> = spans.into_iter().map(CellEntry::Span).collect();
        while let Some(rec) = cursor.peek() {
            if rec.row < row_index {
                cursor.advance();
                continue;
            }
            if rec.row > row_index {
                break;
            }
            if let Some(slot) = entries.get_mut(rec.col as usize) {
                *slot = CellEntry::Owned(rec.value.clone().into_bytes(), false);
            }
            cursor.advance();
        }
        entries
    }

    fn invoke_handlers(&mut self) {
        if self.suppress_handlers {
            return;
        }
        if let Some(mut handler) = self.cell_handler.take() {
            for i in 0..self.cell_count() {
                handler(self, i);
            }
            self.cell_handler = Some(handler);
        }
        if let Some(mut handler) = self.row_handler.take() {
            handler(self);
            self.row_handler = Some(handler);
        }
    }

    /// Drain already-delivered prefix, read one more block, apply BOM strip
    /// and malformed-UTF-8 replacement to the freshly read bytes.
    fn refill(&mut self) -> Result<(), Status> {
        if self.eof {
            return Ok(());
        }
        let drain_to = self.scanner.row_start().min(self.buffer.len());
        if drain_to > 0 {
            self.buffer.drain(0..drain_to);
            self.scanner.rebase(drain_to);
            self.scan_pos = self.scan_pos.saturating_sub(drain_to);
        }

        let old_len = self.buffer.len();
        self.buffer.resize(old_len + self.opts.buffer_size, 0);
        let read = match self.stream.read(&mut self.buffer[old_len..]) {
            Ok(n) => n,
            Err(e) => {
                self.buffer.truncate(old_len);
                self.last_error = Some(ParseError::Io(e));
                return Err(Status::Error);
            }
        };
        self.buffer.truncate(old_len + read);
        if read == 0 {
            self.eof = true;
        } else {
            self.stats.bytes_scanned += read as u64;
            self.bytes_since_progress += read as u64;
            if let Some(every) = self.opts.progress_every_bytes {
                if self.bytes_since_progress >= every {
                    self.bytes_since_progress = 0;
                    if let Some(mut cb) = self.progress.take() {
                        cb(self.stats.bytes_scanned);
                        self.progress = Some(cb);
                    }
                }
            }
            if let Some(mut filter) = self.scan_filter.take() {
                filter(&self.buffer[old_len..old_len + read]);
                self.scan_filter = Some(filter);
            }
            if let Some(replacement) = self.opts.malformed_utf8_replace {
                replace_malformed_utf8(&mut self.buffer[old_len..old_len + read], replacement, &mut self.stats);
            }
        }

        if !self.bom_checked {
            self.bom_checked = true;
            if self.buffer.starts_with(&[0xEF, 0xBB, 0xBF]) {
                self.buffer.drain(0..3);
                self.scanner.rebase(3);
            }
        }
        Ok(())
    }
}

/// Replace each byte that starts an invalid UTF-8 sequence with
/// `replacement`, scanning only the freshly-read slice (spec.md §4.1: "a
/// replacement byte... bytes that start an invalid sequence are replaced
/// in-place").
fn replace_malformed_utf8(bytes: &mut [u8], replacement: u8, stats: &mut ParseStats) {
    let mut i = 0;
    while i < bytes.len() {
        match std::str::from_utf8(&bytes[i..]) {
            Ok(_) => break,
            Err(e) => {
                let good = e.valid_up_to();
                i += good;
                if i >= bytes.len() {
                    break;
                }
                let bad_len = e.error_len().unwrap_or(bytes.len() - i);
                for b in &mut bytes[i..i + bad_len] {
                    *b = replacement;
                }
                stats.note_malformed_utf8();
                i += bad_len;
            }
        }
    }
}
