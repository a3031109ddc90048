//! CLI entry point: installs logging and the SIGINT cancel flag, then
//! dispatches to a built-in command by name.
//!
//! Grounded in `original_source/app/cli.c`'s `builtin_cmd` dispatch table
//! — this crate's command surface (spec.md §1) is limited to `select` and
//! `count`; every other name in the original's table (`sql`, `2db`,
//! `sheet`, `pretty`, `2json`, ...) is out of scope, so the table here has
//! exactly two entries rather than the original's two dozen.

use zsv::cli::{count, select, EXIT_ERR};

fn main() {
    if std::env::var_os("RUST_LOG").is_none() && std::env::args().any(|a| a == "-v" || a == "--verbose") {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    if let Err(e) = zsv::signal::install() {
        log::warn!("failed to install SIGINT handler: {e}");
    }

    let mut args = std::env::args().skip(1);
    let command = match args.next() {
        Some(c) => c,
        None => {
            eprintln!("Usage: zsv <command> [options]\n\nCommands: select, count");
            std::process::exit(EXIT_ERR);
        }
    };
    let rest: Vec<String> = args.collect();

    let code = match command.as_str() {
        "select" => select::run(&rest),
        "count" => count::run(&rest),
        "-h" | "--help" | "help" => {
            println!("Usage: zsv <command> [options]\n\nCommands: select, count");
            0
        }
        other => {
            eprintln!("Unrecognized command: {other}\n\nCommands: select, count");
            EXIT_ERR
        }
    };
    std::process::exit(code);
}
