use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "procmon",
    version,
    about = r#"
procmon traces the system calls of selected processes and lets you inspect,
filter, and persist the captured events.

EXAMPLES:
    # Trace every process, every syscall, interactively:
    sudo procmon

    # Trace two pids, only openat and close:
    sudo procmon -p 1337,4242 -e openat,close

    # Capture headlessly into a trace file until Ctrl+C:
    sudo procmon -p 1337 -c trace.db

    # Re-open a previously captured trace:
    procmon -f trace.db
"#
)]
pub struct Opt {
    /// Comma-separated list of process IDs to trace (at most 10).
    #[arg(short, long, value_name = "PIDS")]
    pub pids: Option<String>,

    /// Comma-separated list of syscall names to trace.
    #[arg(short, long, value_name = "EVENTS")]
    pub events: Option<String>,

    /// Headless capture; events are written to PATH on exit
    /// (default procmon_<date>_<time>.db).
    #[arg(
        short,
        long,
        value_name = "PATH",
        num_args = 0..=1,
        default_missing_value = ""
    )]
    pub collect: Option<String>,

    /// Open an existing trace file read-only.
    #[arg(short, long, value_name = "PATH", conflicts_with = "collect")]
    pub file: Option<PathBuf>,

    /// Write a debug log to PATH.
    #[arg(short, long, value_name = "PATH")]
    pub log: Option<PathBuf>,
}
