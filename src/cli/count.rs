//! `count`: print the number of data rows. Serial and `--jobs`/`--parallel`
//! paths, grounded in `original_source/app/count.c` and `app/count-pull.c`.

use std::cell::Cell;
use std::path::PathBuf;
use std::rc::Rc;

use crate::chunker::{self, calculate_file_chunks, FileChunk, DEFAULT_MIN_CHUNK_THRESHOLD};
use crate::cli::{self, parse_common_args, EXIT_ERR, EXIT_OK};
use crate::error::Status;
use crate::parser::{ParseOptions, ParserHandle};

pub struct CountArgs {
    pub jobs: usize,
}

fn parse_count_args(rest: &[String]) -> Result<CountArgs, String> {
    let mut jobs = 1usize;
    let mut i = 0;
    while i < rest.len() {
        match rest[i].as_str() {
            "-j" | "--jobs" => {
                i += 1;
                let v = rest.get(i).ok_or("-j/--jobs requires a number > 0")?;
                jobs = v.parse::<usize>().map_err(|_| "-j/--jobs requires a number > 0".to_string())?;
                if jobs < 1 {
                    return Err("-j/--jobs requires a number > 0".to_string());
                }
            }
            "--parallel" => {
                jobs = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
            }
            "-h" | "--help" => {
                println!("Usage: count [options] [file]\n\nOptions:\n  -j,--jobs <n>  use n concurrent jobs (default: 1)\n  --parallel     use number of cores as job count");
                std::process::exit(EXIT_OK);
            }
            other => return Err(format!("Unrecognized option: {other}")),
        }
        i += 1;
    }
    Ok(CountArgs { jobs })
}

/// Run `count` over `args` (everything after the subcommand name). Returns
/// the process exit code.
pub fn run(args: &[String]) -> i32 {
    let common = match parse_common_args(args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            return EXIT_ERR;
        }
    };
    let count_args = match parse_count_args(&common.rest) {
        Ok(a) => a,
        Err(e) => {
            eprintln!("{e}");
            return EXIT_ERR;
        }
    };
    let (opts, opts_used) = cli::normalize(&common);
    if common.verbose && !opts_used.is_empty() {
        log::debug!("effective options: {opts_used}");
    }

    let total = if count_args.jobs > 1 {
        match &common.input_path {
            Some(path) => match count_parallel(path, &opts, count_args.jobs) {
                Ok(n) => n,
                Err(e) => {
                    eprintln!("{e}");
                    return EXIT_ERR;
                }
            },
            None => {
                eprintln!("--jobs > 1 requires -i/--input (stdin can't be seeked)");
                return EXIT_ERR;
            }
        }
    } else {
        match count_serial(&common.input_path, &opts) {
            Ok(n) => n,
            Err(e) => {
                eprintln!("{e}");
                return EXIT_ERR;
            }
        }
    };

    println!("{total}");
    EXIT_OK
}

fn count_serial(input_path: &Option<PathBuf>, opts: &ParseOptions) -> Result<u64, String> {
    let stream = cli::open_input(input_path.as_deref()).map_err(|e| e.to_string())?;
    let mut parser = ParserHandle::new(opts.clone(), stream).map_err(|e| e.to_string())?;
    let rows = Rc::new(Cell::new(0u64));
    let rows2 = rows.clone();
    parser.set_row_handler(Box::new(move |_| {
        rows2.set(rows2.get() + 1);
    }));
    run_to_completion(&mut parser)?;
    // Subtract the header row, matching `count.c`'s `total_rows - 1` — but
    // only when a header row was actually delivered (`header_span == 0`
    // means every row handler invocation is already a data row).
    let total = rows.get();
    Ok(if opts.header_span > 0 { total.saturating_sub(1) } else { total })
}

fn count_chunk(path: &PathBuf, opts: &ParseOptions, chunk: FileChunk, is_first: bool) -> u64 {
    use std::fs::File;
    use std::io::{Seek, SeekFrom};

    let Ok(mut file) = File::open(path) else { return 0 };
    if file.seek(SeekFrom::Start(chunk.start)).is_err() {
        return 0;
    }
    let limited = LimitedReader { inner: file, remaining: chunk.end - chunk.start };

    let mut chunk_opts = opts.clone();
    if !is_first {
        chunk_opts.header_span = 0;
        chunk_opts.skip_head = 0;
    }
    let Ok(mut parser) = ParserHandle::new(chunk_opts, Box::new(limited)) else { return 0 };
    let rows = Rc::new(Cell::new(0u64));
    let rows2 = rows.clone();
    parser.set_row_handler(Box::new(move |_| {
        rows2.set(rows2.get() + 1);
    }));
    loop {
        if chunker::is_cancelled() {
            break;
        }
        match parser.parse_more() {
            Status::Ok => {}
            _ => break,
        }
    }
    parser.finish();
    rows.get()
}

/// A `Read` that reports EOF once `remaining` bytes have been consumed,
/// giving each chunk worker its own `end - start` stopping point
/// (`count.c`'s `end_offset_limit`).
struct LimitedReader {
    inner: std::fs::File,
    remaining: u64,
}

impl std::io::Read for LimitedReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let cap = (self.remaining as usize).min(buf.len());
        let n = std::io::Read::read(&mut self.inner, &mut buf[..cap])?;
        self.remaining -= n as u64;
        Ok(n)
    }
}

fn count_parallel(path: &PathBuf, opts: &ParseOptions, jobs: usize) -> Result<u64, String> {
    chunker::reset_cancelled();
    let chunks = calculate_file_chunks(path, jobs, DEFAULT_MIN_CHUNK_THRESHOLD).map_err(|e| e.to_string())?;
    let path = path.clone();
    let opts = opts.clone();
    let counts = chunker::run_chunks(&chunks, |i, chunk| count_chunk(&path, &opts, chunk, i == 0));
    let total: u64 = counts.into_iter().sum();
    Ok(if opts.header_span > 0 { total.saturating_sub(1) } else { total })
}

fn run_to_completion(parser: &mut ParserHandle) -> Result<(), String> {
    loop {
        if chunker::is_cancelled() {
            parser.abort();
        }
        match parser.parse_more() {
            Status::Ok => {}
            Status::NoMoreInput => break,
            Status::Cancelled => break,
            Status::Memory | Status::Error => {
                return Err(parser.take_last_error().map(|e| e.to_string()).unwrap_or_else(|| "parse error".to_string()));
            }
        }
    }
    parser.finish();
    Ok(())
}
