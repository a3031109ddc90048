//! Boundary-safe parallel chunker, per spec.md §4.4.
//!
//! Grounded in `original_source/app/utils/zsv_chunk.h`
//! (`zsv_calculate_file_chunks`) and `app/count.c`'s parallel path: one
//! thread per chunk, each with its own `File` handle seeked to `start`,
//! stopping once it has scanned `end - start` bytes; the main thread
//! handles chunk 0; outputs concatenate in chunk order. Translated to
//! `std::thread::scope` instead of raw `pthread_create`/`pthread_join` —
//! same one-thread-per-chunk, join-barrier shape, no `unsafe`.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use memchr::memchr;

/// A half-open byte range assigned to one worker. `start` is always the
/// byte immediately after a record terminator (or 0); `end` is the start
/// of the next chunk, or EOF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileChunk {
    pub start: u64,
    pub end: u64,
}

/// Default minimum file size below which chunking is skipped entirely.
pub const DEFAULT_MIN_CHUNK_THRESHOLD: u64 = 10 * 1024 * 1024;

/// Window size to search forward from a naive chunk start for a candidate
/// terminator, and backward for the quote-parity check.
const FORWARD_WINDOW: u64 = 1024 * 1024;
const BACKWARD_WINDOW: u64 = 64 * 1024;

/// Compute up to `n` boundary-safe chunks over `path`. Returns a single
/// chunk covering the whole file when the file is smaller than
/// `min_threshold` or `n <= 1`. Never fails outright: if a safe boundary
/// can't be found for some `start_i`, that chunk is dropped and its bytes
/// fold into the chunk before it (serial fallback for that piece), logged
/// at the call site.
pub fn calculate_file_chunks(path: &Path, n: usize, min_threshold: u64) -> std::io::Result<Vec<FileChunk>> {
    let total_bytes = std::fs::metadata(path)?.len();
    if n <= 1 || total_bytes < min_threshold {
        return Ok(vec![FileChunk { start: 0, end: total_bytes }]);
    }

    let mut file = File::open(path)?;
    let mut starts = vec![0u64];
    for i in 1..n {
        let naive = (i as u64) * total_bytes / (n as u64);
        match find_safe_boundary(&mut file, naive, total_bytes) {
            Some(b) if b > *starts.last().unwrap() && b < total_bytes => starts.push(b),
            _ => {
                log::warn!("no safe chunk boundary found near offset {naive}; merging into previous chunk");
            }
        }
    }

    let mut chunks = Vec::with_capacity(starts.len());
    for (idx, &start) in starts.iter().enumerate() {
        let end = starts.get(idx + 1).copied().unwrap_or(total_bytes);
        chunks.push(FileChunk { start, end });
    }
    Ok(chunks)
}

/// Find the first byte index `b >= naive_start` at which the scanner would
/// be at `RowStart` outside any quoted field (spec.md §4.4's "safe
/// boundary" predicate), or `None` if no such offset is found within
/// `FORWARD_WINDOW`.
fn find_safe_boundary(file: &mut File, naive_start: u64, total_bytes: u64) -> Option<u64> {
    let window_end = (naive_start + FORWARD_WINDOW).min(total_bytes);
    if naive_start >= window_end {
        return None;
    }
    let forward_buf = read_range(file, naive_start, window_end)?;

    let mut search_from = 0usize;
    loop {
        let lf_rel = memchr(b'\n', &forward_buf[search_from..])?;
        let lf_abs = naive_start + (search_from + lf_rel) as u64;
        let candidate = lf_abs + 1;
        if candidate >= total_bytes {
            return Some(total_bytes);
        }
        if quote_count_even_before(file, naive_start, candidate) {
            return Some(candidate);
        }
        search_from += lf_rel + 1;
        if search_from >= forward_buf.len() {
            return None;
        }
    }
}

/// Count `"` occurrences from `naive_start - BACKWARD_WINDOW` up to
/// `candidate`; an even count means `candidate` lies outside a quoted
/// field (spec.md §4.4 step 3).
fn quote_count_even_before(file: &mut File, naive_start: u64, candidate: u64) -> bool {
    let back_start = naive_start.saturating_sub(BACKWARD_WINDOW);
    let Some(buf) = read_range(file, back_start, candidate) else {
        return false;
    };
    memchr::memchr_iter(b'"', &buf).count() % 2 == 0
}

fn read_range(file: &mut File, start: u64, end: u64) -> Option<Vec<u8>> {
    if end <= start {
        return Some(Vec::new());
    }
    file.seek(SeekFrom::Start(start)).ok()?;
    let mut buf = vec![0u8; (end - start) as usize];
    let mut read_total = 0;
    while read_total < buf.len() {
        match file.read(&mut buf[read_total..]) {
            Ok(0) => break,
            Ok(n) => read_total += n,
            Err(_) => return None,
        }
    }
    buf.truncate(read_total);
    Some(buf)
}

/// Run `work` once per chunk — chunk 0 on the calling thread, chunks 1..N
/// each on their own scoped thread — and return the results in chunk
/// order. Mirrors `count.c`'s `count_chunk`/`pthread_create` fan-out
/// without needing `unsafe`: `std::thread::scope` guarantees every spawned
/// thread is joined before this function returns.
pub fn run_chunks<T, F>(chunks: &[FileChunk], work: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize, FileChunk) -> T + Sync,
{
    let mut results: Vec<Option<T>> = (0..chunks.len()).map(|_| None).collect();
    std::thread::scope(|scope| {
        let mut handles = Vec::new();
        for (i, chunk) in chunks.iter().enumerate().skip(1) {
            let chunk = *chunk;
            let work = &work;
            handles.push(scope.spawn(move || (i, work(i, chunk))));
        }
        if let Some(&chunk0) = chunks.first() {
            results[0] = Some(work(0, chunk0));
        }
        for h in handles {
            let (i, r) = h.join().expect("chunk worker panicked");
            results[i] = Some(r);
        }
    });
    results.into_iter().map(|r| r.expect("every chunk index is assigned exactly once")).collect()
}

/// Process-global cooperative cancellation flag installed by the CLI
/// binary (spec.md §5). Chunk workers check it between rows.
///
/// Held behind an `Arc` (not a bare `static AtomicBool`) because
/// `signal_hook::flag::register` takes ownership of an `Arc<AtomicBool>` to
/// share with the signal handler; `OnceLock` gives this crate the same
/// "exactly one flag, built lazily, for the whole process" shape without
/// needing `signal.rs` and `chunker.rs` to agree on initialization order.
static CANCELLED: OnceLock<Arc<AtomicBool>> = OnceLock::new();

fn cancelled_flag() -> &'static Arc<AtomicBool> {
    CANCELLED.get_or_init(|| Arc::new(AtomicBool::new(false)))
}

/// The shared flag, for `signal.rs` to register with `signal_hook`.
pub fn cancel_flag() -> Arc<AtomicBool> {
    cancelled_flag().clone()
}

pub fn is_cancelled() -> bool {
    cancelled_flag().load(Ordering::Relaxed)
}

pub fn reset_cancelled() {
    cancelled_flag().store(false, Ordering::Relaxed);
}
