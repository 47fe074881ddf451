//! The in-memory event store and its query surface.
//!
//! The store is the only interface the consumer and the display drivers
//! depend on. One real backend (SQLite-backed, [`sqlite::Sqlite3StorageEngine`])
//! and one inert backend ([`mock::MockStorageEngine`]) implement the
//! [`StorageEngine`] contract.

pub mod mock;
pub mod sqlite;

use std::collections::BTreeMap;
use std::path::Path;

use procmon_probe_abi::MAX_BUFFER;

use crate::error::StorageError;
use crate::stack_trace::StackTrace;

/// One captured syscall invocation, as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRow {
    pub pid: i32,
    pub stack: StackTrace,
    pub comm: String,
    pub process_name: String,
    pub syscall: String,
    /// Signed 64-bit result; negative values are errnos.
    pub result: i64,
    pub duration_ns: u64,
    /// Nanoseconds since boot at syscall entry.
    pub timestamp_ns: u64,
    /// Argument payload, laid out per the syscall's schema.
    pub arguments: [u8; MAX_BUFFER],
}

impl Default for TelemetryRow {
    fn default() -> Self {
        TelemetryRow {
            pid: 0,
            stack: StackTrace::default(),
            comm: String::new(),
            process_name: String::new(),
            syscall: String::new(),
            result: 0,
            duration_ns: 0,
            timestamp_ns: 0,
            arguments: [0; MAX_BUFFER],
        }
    }
}

/// Sort keys the query surface understands. Every key other than `Time`
/// breaks ties by ascending timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Time,
    Pid,
    Process,
    Operation,
    Result,
    Duration,
}

impl SortKey {
    pub(crate) fn column(self) -> &'static str {
        match self {
            SortKey::Time => "timestamp",
            SortKey::Pid => "pid",
            SortKey::Process => "processname",
            SortKey::Operation => "syscall",
            SortKey::Result => "resultcode",
            SortKey::Duration => "duration",
        }
    }
}

/// `syscall name -> (count, total duration ns)`, maintained on insert.
pub type AggregateMap = BTreeMap<String, (u64, u64)>;

/// Metadata stored alongside a snapshot so a viewer can re-anchor
/// relative timestamps: `(start_time_ns, start_time_wall)`.
pub type SnapshotStartTime = (u64, String);

pub trait StorageEngine: Send + Sync {
    /// Arms the store with the configured syscall universe. A second call
    /// fails without disturbing state.
    fn initialize(&self, syscalls: &[String]) -> Result<(), StorageError>;

    fn store(&self, row: TelemetryRow) -> Result<(), StorageError>;

    /// All-or-nothing bulk insert.
    fn store_many(&self, rows: Vec<TelemetryRow>) -> Result<(), StorageError>;

    fn size(&self) -> Result<u64, StorageError>;

    /// Drops all rows and resets the aggregates. Idempotent.
    fn clear(&self) -> Result<(), StorageError>;

    #[allow(clippy::too_many_arguments)]
    fn query_page(
        &self,
        pids: &[i32],
        page: u32,
        page_size: u32,
        sort: SortKey,
        ascending: bool,
        syscalls: &[String],
    ) -> Result<Vec<TelemetryRow>, StorageError>;

    /// Like [`query_page`](Self::query_page), additionally restricted to
    /// rows whose rendered pid, process name, syscall name, duration, or
    /// result contains `text` as a case-sensitive substring.
    #[allow(clippy::too_many_arguments)]
    fn query_filtered_page(
        &self,
        text: &str,
        pids: &[i32],
        page: u32,
        page_size: u32,
        sort: SortKey,
        ascending: bool,
        syscalls: &[String],
    ) -> Result<Vec<TelemetryRow>, StorageError>;

    /// 1-based ordinals, under the current sort order, of the rows the
    /// text filter matches. Drives the UI's find-next.
    fn search_ids(
        &self,
        text: &str,
        pids: &[i32],
        sort: SortKey,
        ascending: bool,
        syscalls: &[String],
    ) -> Result<Vec<u64>, StorageError>;

    /// All rows whose result equals `result`, in insertion order.
    fn query_by_result(
        &self,
        result: i64,
        syscalls: &[String],
    ) -> Result<Vec<TelemetryRow>, StorageError>;

    fn aggregate(&self) -> Result<AggregateMap, StorageError>;

    fn export(
        &self,
        start_time_ns: u64,
        start_time_wall: &str,
        path: &Path,
    ) -> Result<(), StorageError>;

    fn load(&self, path: &Path) -> Result<SnapshotStartTime, StorageError>;
}
