use std::path::PathBuf;
use std::time::SystemTime;

use log::info;
use nix::time::{clock_gettime, ClockId};

use crate::cli::Opt;
use crate::cli_utils::{parse_event_list, parse_pid_list};
use crate::error::ConfigError;
use crate::schema::SyscallTable;

/// Immutable session configuration, built once from the CLI and the host
/// schema and then only ever borrowed.
#[derive(Debug, Clone)]
pub struct ProcmonConfig {
    pub pids: Vec<i32>,
    /// Syscall names to capture. Defaults to every syscall the host's
    /// schema knows when the operator gives none.
    pub events: Vec<String>,
    pub headless: bool,
    pub trace_file: Option<PathBuf>,
    pub output_trace_path: PathBuf,
    /// Monotonic nanoseconds at session start; event timestamps are
    /// displayed relative to this.
    pub start_time_ns: u64,
    /// Wall-clock session start, RFC 3339.
    pub start_time_wall: String,
}

impl ProcmonConfig {
    pub fn from_opt(opt: &Opt, table: &SyscallTable) -> Result<Self, ConfigError> {
        let pids = match &opt.pids {
            Some(arg) => parse_pid_list(arg)?,
            None => Vec::new(),
        };

        let mut events = match &opt.events {
            Some(arg) => parse_event_list(arg),
            None => Vec::new(),
        };
        if events.is_empty() {
            events = table.all_names();
        } else {
            table.validate_names(&events)?;
        }

        let start_time_ns = monotonic_now_ns();
        let wall = humantime::format_rfc3339_seconds(SystemTime::now()).to_string();

        let headless = opt.collect.is_some();
        let output_trace_path = match opt.collect.as_deref() {
            Some("") | None => PathBuf::from(default_trace_file_name(&wall)),
            Some(path) => PathBuf::from(path),
        };

        if headless && opt.file.is_some() {
            return Err(ConfigError::TraceFileInHeadlessMode);
        }
        if let Some(file) = &opt.file {
            if !file.exists() {
                return Err(ConfigError::MissingTraceFile(file.clone()));
            }
        }

        info!(
            "tracing {} syscalls, {} pid filter(s), output {}",
            events.len(),
            pids.len(),
            output_trace_path.display()
        );

        Ok(ProcmonConfig {
            pids,
            events,
            headless,
            trace_file: opt.file.clone(),
            output_trace_path,
            start_time_ns,
            start_time_wall: wall,
        })
    }

    /// Re-anchors relative timestamps after loading a snapshot.
    pub fn set_start_time(&mut self, start_time_ns: u64, start_time_wall: String) {
        self.start_time_ns = start_time_ns;
        self.start_time_wall = start_time_wall;
    }
}

pub fn monotonic_now_ns() -> u64 {
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64,
        Err(_) => 0,
    }
}

/// `procmon_<date>_<time>.db`, derived from the RFC 3339 wall time.
fn default_trace_file_name(wall: &str) -> String {
    let (date, time) = wall
        .split_once('T')
        .unwrap_or(("unknown-date", "unknown-time"));
    let time = time.trim_end_matches('Z');
    format!("procmon_{date}_{time}.db")
}
