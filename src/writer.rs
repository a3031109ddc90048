//! Buffered CSV output writer, per spec.md §4.5.
//!
//! Grounded in `original_source/app/select.c`'s output-writing calls (one
//! `write_cell`-shaped call per emitted field, a trailing newline per row)
//! and `other_examples/22bfc7c5_BurntSushi-rust-csv__src-writer.rs.rs` for
//! the idiomatic shape of a buffered `Write`-wrapper in Rust: own a
//! `BufWriter`, decide quoting per cell, write delimiters between cells and
//! a terminator at row end.

use std::io::{self, Write};

/// Line ending the writer appends after each row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEnding {
    Lf,
    CrLf,
}

impl LineEnding {
    fn bytes(self) -> &'static [u8] {
        match self {
            LineEnding::Lf => b"\n",
            LineEnding::CrLf => b"\r\n",
        }
    }
}

#[derive(Debug, Clone)]
pub struct WriterOptions {
    pub delimiter: u8,
    pub line_ending: LineEnding,
    /// Quote every cell, regardless of content.
    pub always_quote: bool,
    /// Write a UTF-8 BOM before the first byte.
    pub write_bom: bool,
}

impl Default for WriterOptions {
    fn default() -> Self {
        WriterOptions { delimiter: b',', line_ending: LineEnding::Lf, always_quote: false, write_bom: false }
    }
}

/// A buffered CSV emitter wrapping any `Write`.
pub struct CsvWriter<W: Write> {
    inner: io::BufWriter<W>,
    opts: WriterOptions,
    at_row_start: bool,
    bom_written: bool,
    prepend: Option<String>,
}

impl<W: Write> CsvWriter<W> {
    pub fn new(inner: W, opts: WriterOptions) -> Self {
        CsvWriter { inner: io::BufWriter::new(inner), opts, at_row_start: true, bom_written: false, prepend: None }
    }

    /// A string prepended to the very next cell only (then cleared).
    pub fn cell_prepend(&mut self, s: impl Into<String>) {
        self.prepend = Some(s.into());
    }

    fn write_bom_if_needed(&mut self) -> io::Result<()> {
        if self.opts.write_bom && !self.bom_written {
            self.bom_written = true;
            self.inner.write_all(&[0xEF, 0xBB, 0xBF])?;
        }
        Ok(())
    }

    fn write_separator(&mut self, new_row: bool) -> io::Result<()> {
        self.write_bom_if_needed()?;
        if new_row {
            if !self.at_row_start {
                self.inner.write_all(self.opts.line_ending.bytes())?;
            }
            self.at_row_start = false;
        } else {
            self.inner.write_all(&[self.opts.delimiter])?;
        }
        Ok(())
    }

    fn needs_quoting(&self, bytes: &[u8], forced: bool) -> bool {
        forced
            || self.opts.always_quote
            || bytes.iter().any(|&b| b == self.opts.delimiter || b == b'"' || b == b'\r' || b == b'\n')
    }

    /// Write one cell. `new_row` starts a fresh row (emitting the line
    /// ending first, unless this is the very first row); `quoted` forces
    /// quoting even if the bytes don't strictly require it.
    pub fn write_cell(&mut self, new_row: bool, bytes: &[u8], quoted: bool) -> io::Result<()> {
        self.write_separator(new_row)?;
        if let Some(prefix) = self.prepend.take() {
            self.inner.write_all(prefix.as_bytes())?;
        }
        if self.needs_quoting(bytes, quoted) {
            self.inner.write_all(b"\"")?;
            let mut start = 0;
            for (i, &b) in bytes.iter().enumerate() {
                if b == b'"' {
                    self.inner.write_all(&bytes[start..=i])?;
                    self.inner.write_all(b"\"")?;
                    start = i + 1;
                }
            }
            self.inner.write_all(&bytes[start..])?;
            self.inner.write_all(b"\"")?;
        } else {
            self.inner.write_all(bytes)?;
        }
        Ok(())
    }

    pub fn write_cell_blank(&mut self, new_row: bool) -> io::Result<()> {
        self.write_cell(new_row, b"", false)
    }

    pub fn write_cell_numeric(&mut self, new_row: bool, value: u64) -> io::Result<()> {
        self.write_cell(new_row, value.to_string().as_bytes(), false)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }

    /// Unwrap the underlying writer, flushing first.
    pub fn into_inner(mut self) -> io::Result<W> {
        self.flush()?;
        self.inner.into_inner().map_err(|e| e.into_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(f: impl FnOnce(&mut CsvWriter<Vec<u8>>)) -> String {
        let mut w = CsvWriter::new(Vec::new(), WriterOptions::default());
        f(&mut w);
        w.flush().unwrap();
        String::from_utf8(w.inner.into_inner().unwrap()).unwrap()
    }

    #[test]
    fn quotes_only_when_needed() {
        let out = render(|w| {
            w.write_cell(true, b"a", false).unwrap();
            w.write_cell(false, b"b,c", false).unwrap();
            w.write_cell(true, b"plain", false).unwrap();
        });
        assert_eq!(out, "a,\"b,c\"\nplain");
    }

    #[test]
    fn embedded_quote_is_doubled() {
        let out = render(|w| {
            w.write_cell(true, b"he said \"hi\"", false).unwrap();
        });
        assert_eq!(out, "\"he said \"\"hi\"\"\"");
    }

    #[test]
    fn always_quote_forces_quoting_of_plain_cells() {
        let mut w = CsvWriter::new(Vec::new(), WriterOptions { always_quote: true, ..WriterOptions::default() });
        w.write_cell(true, b"plain", false).unwrap();
        w.flush().unwrap();
        assert_eq!(String::from_utf8(w.inner.into_inner().unwrap()).unwrap(), "\"plain\"");
    }

    #[test]
    fn cell_prepend_affects_only_next_cell() {
        let out = render(|w| {
            w.cell_prepend("#");
            w.write_cell(true, b"1", false).unwrap();
            w.write_cell(false, b"2", false).unwrap();
        });
        assert_eq!(out, "#1,2");
    }
}
