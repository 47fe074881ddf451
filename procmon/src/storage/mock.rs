//! Inert storage backend.
//!
//! Accepts every call, stores nothing, and returns empty results. Used by
//! tests that exercise the pipeline or the display drivers without paying
//! for a real database.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::error::StorageError;
use crate::storage::{AggregateMap, SnapshotStartTime, SortKey, StorageEngine, TelemetryRow};

#[derive(Default)]
pub struct MockStorageEngine {
    ready: AtomicBool,
    accepted: AtomicU64,
}

impl MockStorageEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many rows were offered to the mock; they are not retained.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::SeqCst)
    }
}

impl StorageEngine for MockStorageEngine {
    fn initialize(&self, _syscalls: &[String]) -> Result<(), StorageError> {
        if self.ready.swap(true, Ordering::SeqCst) {
            return Err(StorageError::AlreadyInitialized);
        }
        Ok(())
    }

    fn store(&self, _row: TelemetryRow) -> Result<(), StorageError> {
        self.accepted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn store_many(&self, rows: Vec<TelemetryRow>) -> Result<(), StorageError> {
        self.accepted.fetch_add(rows.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    fn size(&self) -> Result<u64, StorageError> {
        Ok(0)
    }

    fn clear(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn query_page(
        &self,
        _pids: &[i32],
        _page: u32,
        _page_size: u32,
        _sort: SortKey,
        _ascending: bool,
        _syscalls: &[String],
    ) -> Result<Vec<TelemetryRow>, StorageError> {
        Ok(Vec::new())
    }

    fn query_filtered_page(
        &self,
        _text: &str,
        _pids: &[i32],
        _page: u32,
        _page_size: u32,
        _sort: SortKey,
        _ascending: bool,
        _syscalls: &[String],
    ) -> Result<Vec<TelemetryRow>, StorageError> {
        Ok(Vec::new())
    }

    fn search_ids(
        &self,
        _text: &str,
        _pids: &[i32],
        _sort: SortKey,
        _ascending: bool,
        _syscalls: &[String],
    ) -> Result<Vec<u64>, StorageError> {
        Ok(Vec::new())
    }

    fn query_by_result(
        &self,
        _result: i64,
        _syscalls: &[String],
    ) -> Result<Vec<TelemetryRow>, StorageError> {
        Ok(Vec::new())
    }

    fn aggregate(&self) -> Result<AggregateMap, StorageError> {
        Ok(AggregateMap::new())
    }

    fn export(
        &self,
        _start_time_ns: u64,
        _start_time_wall: &str,
        _path: &Path,
    ) -> Result<(), StorageError> {
        Ok(())
    }

    fn load(&self, _path: &Path) -> Result<SnapshotStartTime, StorageError> {
        Ok((0, String::new()))
    }
}
