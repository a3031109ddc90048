//! SIGINT → cooperative cancel flag, per spec.md §5/§9.
//!
//! "Signal handling must not be global in a library: expose a cancellation
//! flag (pointer/handle) the caller installs; the process-wide SIGINT
//! handler is a CLI-layer concern" — so this module is only ever used by
//! `bin/zsv.rs`, never by `lib.rs` itself. Installing the handler is a
//! one-line wrapper over `signal_hook::flag::register`, the same
//! lock-free-flag-only discipline a hand-rolled `libc` handler would need
//! to observe anyway; pulling in the crate buys that without `unsafe`.

use crate::chunker::cancel_flag;

/// Install a SIGINT handler that sets the shared cooperative cancel flag
/// (`crate::chunker::is_cancelled`). Safe to call more than once; only the
/// first registration takes effect per signal-hook's own dedup.
pub fn install() -> std::io::Result<()> {
    signal_hook::flag::register(signal_hook::consts::SIGINT, cancel_flag())?;
    Ok(())
}
