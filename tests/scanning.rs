//! Crate-level scanning/parsing scenarios, driven through the public
//! `ParserHandle` façade rather than `scanner`'s internals (those have
//! their own unit tests in `src/scanner.rs`). Covers spec.md §8's
//! "Testable Properties" end-to-end scenarios: basic quoting, embedded
//! newlines, CRLF/LF equivalence, header span, and the two malformed-input
//! recovery paths (oversized row, malformed UTF-8).

use std::cell::RefCell;
use std::io::{Cursor, Read};
use std::rc::Rc;

use zsv::error::Status;
use zsv::parser::{ParseOptions, ParserHandle};

/// A `Read` that yields at most `chunk` bytes per call, regardless of the
/// caller's buffer size — unlike `Cursor`, which always satisfies a read in
/// one call. Used to force a real mid-row refill spanning more than one
/// `Read::read()`, exercising the scanner's cross-call resume position
/// rather than the caller's (possibly stale) row-start offset.
struct Trickle<'a> {
    data: &'a [u8],
    pos: usize,
    chunk: usize,
}

impl<'a> Read for Trickle<'a> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = (self.data.len() - self.pos).min(self.chunk).min(buf.len());
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

fn collect_rows(input: &'static [u8], opts: ParseOptions) -> Vec<Vec<String>> {
    let rows = Rc::new(RefCell::new(Vec::new()));
    let rows2 = rows.clone();
    let mut parser = ParserHandle::new(opts, Box::new(Cursor::new(input))).unwrap();
    parser.set_row_handler(Box::new(move |p| {
        let row: Vec<String> = (0..p.cell_count()).map(|i| p.get_cell(i).try_as_str().unwrap().to_string()).collect();
        rows2.borrow_mut().push(row);
    }));
    loop {
        match parser.parse_more() {
            Status::Ok => {}
            Status::NoMoreInput => break,
            other => panic!("unexpected status: {other:?}"),
        }
    }
    parser.finish();
    Rc::try_unwrap(rows).unwrap().into_inner()
}

#[test]
fn basic_quoting_end_to_end() {
    let input = b"name,note\nalice,\"hello, world\"\nbob,\"she said \"\"hi\"\"\"\n";
    let rows = collect_rows(input, ParseOptions::default());
    assert_eq!(rows[0], vec!["name", "note"]);
    assert_eq!(rows[1], vec!["alice", "hello, world"]);
    assert_eq!(rows[2], vec!["bob", "she said \"hi\""]);
}

#[test]
fn embedded_newline_survives_a_refill_boundary() {
    // buffer_size is forced small so the embedded newline straddles two
    // refills, exercising the scanner's cross-refill InQuoted state.
    let input = b"a,b\n1,\"line one\nline two\nline three\"\n";
    let opts = ParseOptions { buffer_size: 32 * 1024, max_row_size: 32 * 1024, ..ParseOptions::default() };
    let rows = collect_rows(input, opts);
    assert_eq!(rows[1][1], "line one\nline two\nline three");
}

#[test]
fn a_cell_boundary_straddling_a_real_multi_read_refill_parses_correctly() {
    // Each `read()` returns a single byte, so a row with several cells is
    // guaranteed to span many `parse_more` refills, with cell boundaries
    // (not just row boundaries) landing mid-buffer-fill.
    let input = b"a,bb,ccc,dddd\n1,22,333,4444\n";
    let opts = ParseOptions { buffer_size: 32 * 1024, max_row_size: 32 * 1024, ..ParseOptions::default() };
    let mut parser = ParserHandle::new(opts, Box::new(Trickle { data: input, pos: 0, chunk: 1 })).unwrap();
    let rows = Rc::new(RefCell::new(Vec::new()));
    let rows2 = rows.clone();
    parser.set_row_handler(Box::new(move |p| {
        let row: Vec<String> = (0..p.cell_count()).map(|i| p.get_cell(i).try_as_str().unwrap().to_string()).collect();
        rows2.borrow_mut().push(row);
    }));
    loop {
        match parser.parse_more() {
            Status::Ok => {}
            Status::NoMoreInput => break,
            other => panic!("unexpected status: {other:?}"),
        }
    }
    parser.finish();
    let rows = rows.borrow();
    assert_eq!(rows[0], vec!["a", "bb", "ccc", "dddd"]);
    assert_eq!(rows[1], vec!["1", "22", "333", "4444"]);
}

#[test]
fn crlf_and_lf_produce_identical_rows() {
    let crlf = collect_rows(b"a,b\r\n1,2\r\n3,4\r\n", ParseOptions::default());
    let lf = collect_rows(b"a,b\n1,2\n3,4\n", ParseOptions::default());
    assert_eq!(crlf, lf);
}

#[test]
fn multi_row_header_span_is_joined_and_data_starts_after() {
    let input = b"Sales,Sales\nQ1,Q2\n100,200\n";
    let opts = ParseOptions { header_span: 2, ..ParseOptions::default() };
    let rows = collect_rows(input, opts);
    assert_eq!(rows[0], vec!["Sales;Q1", "Sales;Q2"]);
    assert_eq!(rows[1], vec!["100", "200"]);
}

#[test]
fn fixed_width_columns_split_at_configured_offsets() {
    let input = b"alice     30   \nbob       41   \n";
    let opts = ParseOptions { quote_enabled: false, fixed_offsets: Some(vec![10]), header_span: 0, ..ParseOptions::default() };
    let rows = collect_rows(input, opts);
    assert_eq!(rows[0], vec!["alice", "30"]);
    assert_eq!(rows[1], vec!["bob", "41"]);
}

#[test]
fn oversized_row_is_skipped_and_counted_then_parsing_resumes() {
    // max_row_size's floor is 32 KiB (ParseOptions::validate); the bad row
    // overshoots it so the scanner's re-sync path actually triggers.
    let mut input = Vec::new();
    input.extend_from_slice(b"a,b\n");
    input.extend_from_slice(&vec![b'x'; 40_000]);
    input.push(b'\n');
    input.extend_from_slice(b"ok,row\n");
    let leaked: &'static [u8] = Box::leak(input.into_boxed_slice());

    let opts = ParseOptions { max_row_size: 32 * 1024, buffer_size: 64 * 1024, ..ParseOptions::default() };
    let rows = Rc::new(RefCell::new(Vec::new()));
    let rows2 = rows.clone();
    let mut parser = ParserHandle::new(opts, Box::new(Cursor::new(leaked))).unwrap();
    parser.set_row_handler(Box::new(move |p| {
        let row: Vec<String> = (0..p.cell_count()).map(|i| p.get_cell(i).try_as_str().unwrap().to_string()).collect();
        rows2.borrow_mut().push(row);
    }));
    loop {
        match parser.parse_more() {
            Status::Ok => {}
            Status::NoMoreInput => break,
            Status::Error => break,
            other => panic!("unexpected status: {other:?}"),
        }
    }
    parser.finish();
    assert!(parser.stats().row_too_large >= 1);
    let rows = rows.borrow();
    assert_eq!(rows[0], vec!["a", "b"]);
    assert_eq!(rows.last().unwrap(), &vec!["ok".to_string(), "row".to_string()]);
}

#[test]
fn malformed_utf8_is_replaced_with_configured_byte() {
    let mut input = b"a,b\n".to_vec();
    input.push(b'x');
    input.push(0xFF); // invalid UTF-8 start byte
    input.push(b'y');
    input.push(b'\n');
    let leaked: &'static [u8] = Box::leak(input.into_boxed_slice());

    let opts = ParseOptions { malformed_utf8_replace: Some(b'?'), ..ParseOptions::default() };
    let rows = collect_rows(leaked, opts);
    assert_eq!(rows[1][0], "x?y");
}
