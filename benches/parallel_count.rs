//! Serial vs. `--jobs`-chunked row counting, over the same file.
//!
//! Grounded in `original_source/app/count.c`'s serial-vs-parallel code
//! paths (`count_pull`/`count_chunk`): this bench drives the crate's own
//! `chunker`/`parser` directly (rather than the `count` CLI subcommand, a
//! thin wrapper over the same pieces) so both arms share exactly the same
//! `ParseOptions`.

use std::cell::Cell as StdCell;
use std::fs::File;
use std::hint::black_box;
use std::path::PathBuf;
use std::rc::Rc;

use criterion::{criterion_group, criterion_main, Bencher, BenchmarkId, Criterion};

use zsv::chunker::{calculate_file_chunks, run_chunks, FileChunk};
use zsv::error::Status;
use zsv::parser::{ParseOptions, ParserHandle};

fn input_path() -> PathBuf {
    PathBuf::from(std::env::var("INPUT").expect("set INPUT to a CSV file path"))
}

fn count_serial(path: &PathBuf, opts: &ParseOptions) -> u64 {
    let stream = Box::new(File::open(path).unwrap());
    let mut parser = ParserHandle::new(opts.clone(), stream).unwrap();
    let rows = Rc::new(StdCell::new(0u64));
    let rows2 = rows.clone();
    parser.set_row_handler(Box::new(move |_| rows2.set(rows2.get() + 1)));
    loop {
        match parser.parse_more() {
            Status::Ok => {}
            _ => break,
        }
    }
    parser.finish();
    black_box(rows.get())
}

fn count_chunk(path: &PathBuf, opts: &ParseOptions, chunk: FileChunk, is_first: bool) -> u64 {
    use std::io::{Read, Seek, SeekFrom};

    struct Limited {
        inner: File,
        remaining: u64,
    }
    impl Read for Limited {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.remaining == 0 {
                return Ok(0);
            }
            let cap = (self.remaining as usize).min(buf.len());
            let n = self.inner.read(&mut buf[..cap])?;
            self.remaining -= n as u64;
            Ok(n)
        }
    }

    let mut file = File::open(path).unwrap();
    file.seek(SeekFrom::Start(chunk.start)).unwrap();
    let limited = Limited { inner: file, remaining: chunk.end - chunk.start };

    let mut chunk_opts = opts.clone();
    if !is_first {
        chunk_opts.header_span = 0;
    }
    let mut parser = ParserHandle::new(chunk_opts, Box::new(limited)).unwrap();
    let rows = Rc::new(StdCell::new(0u64));
    let rows2 = rows.clone();
    parser.set_row_handler(Box::new(move |_| rows2.set(rows2.get() + 1)));
    loop {
        match parser.parse_more() {
            Status::Ok => {}
            _ => break,
        }
    }
    parser.finish();
    rows.get()
}

fn count_parallel(path: &PathBuf, opts: &ParseOptions, jobs: usize) -> u64 {
    let chunks = calculate_file_chunks(path, jobs, 0).unwrap();
    let counts = run_chunks(&chunks, |i, chunk| count_chunk(path, opts, chunk, i == 0));
    black_box(counts.into_iter().sum())
}

pub fn serial(b: &mut Bencher, path: &PathBuf) {
    let opts = ParseOptions::default();
    b.iter(|| count_serial(path, &opts))
}

pub fn parallel(b: &mut Bencher, path: &PathBuf, jobs: usize) {
    let opts = ParseOptions::default();
    b.iter(|| count_parallel(path, &opts, jobs))
}

fn bench_count(c: &mut Criterion) {
    let path = input_path();
    let mut group = c.benchmark_group("Count");
    group.bench_with_input(BenchmarkId::new("serial", 1), &path, |b, p| serial(b, p));
    for jobs in [2usize, 4, 8] {
        group.bench_with_input(BenchmarkId::new("parallel", jobs), &path, |b, p| parallel(b, p, jobs));
    }
    group.finish();
}

criterion_group!(benches, bench_count);
criterion_main!(benches);
