//! Single-threaded scan throughput: this crate's `Scanner`/`ParserHandle`
//! against the `csv` crate, over the same input slice.
//!
//! Continues `lazycsv`'s original `single_thread` bench (same
//! `INPUT`-env-var/`memmap2`-slice harness, same `Parsers` benchmark group
//! against `csv`), pointed at this crate's own scanner instead of
//! `lazycsv`'s bare `Csv` iterator, since `lazycsv` itself isn't part of
//! this crate's scope (see DESIGN.md's "Final trim").

use std::fs::File;
use std::hint::black_box;
use std::io::Cursor;

use criterion::{criterion_group, criterion_main, Bencher, BenchmarkId, Criterion};
use memchr::memchr_iter;
use memmap2::Mmap;

use zsv::error::ParseStats;
use zsv::parser::{ParseOptions, ParserHandle};
use zsv::scanner::{RowOutcome, ScanConfig, Scanner};

fn prepare(rows: usize) -> Vec<u8> {
    let f = File::open(std::env::var("INPUT").unwrap()).unwrap();
    let mmap = unsafe { Mmap::map(&f).unwrap() };
    let mut lf_iter = memchr_iter(b'\n', &mmap);
    let second_lf = lf_iter.nth(1).unwrap();
    let ending_lf = lf_iter.nth(rows).unwrap();
    let range = (second_lf + 1)..ending_lf;
    let mut vec = Vec::with_capacity(range.len());
    vec.extend_from_slice(&mmap[range]);
    vec
}

/// The scanner alone, with no parser/header/refill bookkeeping on top —
/// the closest equivalent to `lazycsv`'s bare `Csv` iterator benchmark.
pub fn zsv_scanner_raw(b: &mut Bencher, slice: &[u8]) {
    let cfg = ScanConfig {
        delimiter: b',',
        quote_enabled: true,
        strict_mode: Default::default(),
        max_row_size: usize::MAX,
        max_columns: usize::MAX,
        fixed_offsets: None,
    };
    b.iter(|| {
        let mut scanner = Scanner::new();
        let mut stats = ParseStats::default();
        let mut pos = 0;
        loop {
            let mut cells = Vec::new();
            match scanner.scan_row(slice, pos, &cfg, &mut cells, &mut stats) {
                RowOutcome::Complete { next_pos } => {
                    for span in &cells {
                        black_box(&slice[span.start..span.end]);
                    }
                    pos = next_pos;
                    if pos >= slice.len() {
                        break;
                    }
                }
                _ => break,
            }
        }
    })
}

/// The full push-mode `ParserHandle`, including refill and header handling.
pub fn zsv_parser(b: &mut Bencher, slice: &[u8]) {
    b.iter(|| {
        let mut parser =
            ParserHandle::new(ParseOptions { header_span: 0, ..ParseOptions::default() }, Box::new(Cursor::new(slice))).unwrap();
        parser.set_row_handler(Box::new(|p| {
            for i in 0..p.cell_count() {
                black_box(p.get_cell(i).try_as_str().unwrap());
            }
        }));
        loop {
            match parser.parse_more() {
                zsv::error::Status::Ok => {}
                _ => break,
            }
        }
        parser.finish();
    })
}

pub fn csv(b: &mut Bencher, slice: &[u8]) {
    b.iter(|| {
        let cursor = Cursor::new(slice);
        for row in csv::ReaderBuilder::new().has_headers(false).from_reader(cursor).into_records() {
            for cell in row.unwrap().into_iter() {
                black_box(cell);
            }
        }
    })
}

fn bench_parsers(c: &mut Criterion) {
    let mut group = c.benchmark_group("Parsers");
    for i in [1_000, 10_000, 50_000, 100_000] {
        group.bench_with_input(BenchmarkId::new("zsv_scanner (raw)", i), &i, |b, i| zsv_scanner_raw(b, &prepare(*i)));
        group.bench_with_input(BenchmarkId::new("zsv_parser", i), &i, |b, i| zsv_parser(b, &prepare(*i)));
        group.bench_with_input(BenchmarkId::new("csv", i), &i, |b, i| csv(b, &prepare(*i)));
    }
    group.finish();
}

criterion_group!(benches, bench_parsers);
criterion_main!(benches);
