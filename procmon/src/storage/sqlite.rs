//! SQLite-backed event store.
//!
//! The live database is in-memory with a shared cache, so any number of
//! reader connections can query it while the single writer inserts.
//! Readers never share a connection: each query opens its own read-only
//! connection against the shared cache and retries briefly when it
//! collides with the writer's transaction.

use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use log::debug;
use parking_lot::{Mutex, RwLock};
use procmon_probe_abi::MAX_BUFFER;
use rusqlite::{params, Connection, OpenFlags};

use crate::error::StorageError;
use crate::stack_trace::StackTrace;
use crate::storage::{AggregateMap, SnapshotStartTime, SortKey, StorageEngine, TelemetryRow};

const SQL_CREATE_EVENTS: &str = "CREATE TABLE IF NOT EXISTS events (
    pid INTEGER,
    stacktrace TEXT,
    comm TEXT,
    processname TEXT,
    resultcode INTEGER,
    timestamp INTEGER,
    syscall TEXT,
    duration INTEGER,
    arguments BLOB
)";
const SQL_CREATE_METADATA: &str =
    "CREATE TABLE IF NOT EXISTS metadata (start_time_ns INTEGER, start_time_wall TEXT)";
const SQL_CREATE_STATS: &str =
    "CREATE TABLE IF NOT EXISTS stats (syscall TEXT, count INTEGER, duration INTEGER)";

const SQL_SELECT: &str = "SELECT pid, stacktrace, comm, processname, resultcode, timestamp, \
                          syscall, duration, arguments FROM events";
const SQL_INSERT: &str = "INSERT INTO events (pid, stacktrace, comm, processname, resultcode, \
                          timestamp, syscall, duration, arguments) \
                          VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)";

/// Case-sensitive substring match over the five searchable renderings.
/// `instr` carries no wildcard semantics, unlike `LIKE`.
const SQL_TEXT_MATCH: &str = "(instr(CAST(pid AS TEXT), ?1) > 0 \
     OR instr(processname, ?1) > 0 \
     OR instr(syscall, ?1) > 0 \
     OR instr(CAST(duration AS TEXT), ?1) > 0 \
     OR instr(CAST(resultcode AS TEXT), ?1) > 0)";

static STORE_COUNTER: AtomicUsize = AtomicUsize::new(0);

const LOCKED_RETRY_LIMIT: u32 = 200;
const LOCKED_RETRY_SLEEP: Duration = Duration::from_millis(10);

#[derive(Clone)]
enum Backing {
    /// Shared-cache in-memory database, addressed by URI.
    Memory(String),
    /// A loaded snapshot file, read-only.
    File(std::path::PathBuf),
}

/// Reader-visible state: cheap to clone under a short read lock.
struct QueryState {
    ready: bool,
    universe: Vec<String>,
    backing: Backing,
}

pub struct Sqlite3StorageEngine {
    /// The single writer connection. Also pins the shared-cache database:
    /// an in-memory database lives as long as one connection holds it.
    writer: Mutex<Option<Connection>>,
    state: RwLock<QueryState>,
    aggregates: Mutex<AggregateMap>,
    row_count: AtomicU64,
}

impl Sqlite3StorageEngine {
    pub fn new() -> Self {
        let id = STORE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let uri = format!("file:procmon-store-{id}?mode=memory&cache=shared");
        Sqlite3StorageEngine {
            writer: Mutex::new(None),
            state: RwLock::new(QueryState {
                ready: false,
                universe: Vec::new(),
                backing: Backing::Memory(uri),
            }),
            aggregates: Mutex::new(AggregateMap::new()),
            row_count: AtomicU64::new(0),
        }
    }

    fn open_reader(&self) -> Result<(Connection, Vec<String>), StorageError> {
        let state = self.state.read();
        if !state.ready {
            return Err(StorageError::NotInitialized);
        }
        let conn = match &state.backing {
            Backing::Memory(uri) => Connection::open_with_flags(
                uri,
                OpenFlags::SQLITE_OPEN_READ_ONLY
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?,
            Backing::File(path) => Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?,
        };
        Ok((conn, state.universe.clone()))
    }

    /// `syscall IN (..)` restriction, or its complement when the selected
    /// set is the larger half of the universe. An empty or full selection
    /// means no restriction.
    fn syscall_clause(universe: &[String], syscalls: &[String]) -> Option<String> {
        if syscalls.is_empty() || syscalls.len() >= universe.len() {
            return None;
        }
        let quote_list = |names: &mut dyn Iterator<Item = &String>| {
            names
                .map(|n| format!("'{}'", n.replace('\'', "''")))
                .collect::<Vec<_>>()
                .join(", ")
        };
        if syscalls.len() > universe.len() / 2 {
            let excluded: Vec<&String> = universe
                .iter()
                .filter(|name| !syscalls.contains(*name))
                .collect();
            Some(format!(
                "syscall NOT IN ({})",
                quote_list(&mut excluded.into_iter())
            ))
        } else {
            Some(format!(
                "syscall IN ({})",
                quote_list(&mut syscalls.iter())
            ))
        }
    }

    fn pid_clause(pids: &[i32]) -> Option<String> {
        if pids.is_empty() {
            return None;
        }
        let list = pids
            .iter()
            .map(i32::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        Some(format!("pid IN ({list})"))
    }

    fn where_clause(conditions: &[Option<String>]) -> String {
        let parts: Vec<&str> = conditions
            .iter()
            .filter_map(|c| c.as_deref())
            .collect();
        if parts.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", parts.join(" AND "))
        }
    }

    /// `ORDER BY` terms for the given key. The trailing rowid term keeps
    /// equal rows in insertion order no matter the key.
    fn order_terms(sort: SortKey, ascending: bool) -> String {
        let direction = if ascending { "ASC" } else { "DESC" };
        match sort {
            SortKey::Time => format!("timestamp {direction}, rowid ASC"),
            _ => format!("{} {direction}, timestamp ASC, rowid ASC", sort.column()),
        }
    }

    fn query_rows(
        &self,
        sql: &str,
        text: Option<&str>,
    ) -> Result<Vec<TelemetryRow>, StorageError> {
        let (conn, _) = self.open_reader()?;
        let rows = with_locked_retry(|| {
            let mut stmt = conn.prepare(sql)?;
            let mapped = match text {
                Some(text) => stmt.query_map(params![text], parse_row)?,
                None => stmt.query_map([], parse_row)?,
            };
            mapped.collect::<rusqlite::Result<Vec<TelemetryRow>>>()
        })?;
        Ok(rows)
    }
}

impl Default for Sqlite3StorageEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine for Sqlite3StorageEngine {
    fn initialize(&self, syscalls: &[String]) -> Result<(), StorageError> {
        let mut state = self.state.write();
        if state.ready {
            return Err(StorageError::AlreadyInitialized);
        }
        let uri = match &state.backing {
            Backing::Memory(uri) => uri.clone(),
            Backing::File(_) => unreachable!("fresh engines always start on memory"),
        };
        let conn = Connection::open_with_flags(
            &uri,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        // One table for all events; the snapshot-only tables exist up
        // front so every VACUUM INTO carries the full schema.
        conn.execute_batch(&format!(
            "{SQL_CREATE_EVENTS}; {SQL_CREATE_METADATA}; {SQL_CREATE_STATS};"
        ))?;

        *self.writer.lock() = Some(conn);
        state.universe = syscalls.to_vec();
        state.ready = true;
        self.row_count.store(0, Ordering::SeqCst);
        debug!("storage armed for {} syscalls", syscalls.len());
        Ok(())
    }

    fn store(&self, row: TelemetryRow) -> Result<(), StorageError> {
        self.store_many(vec![row])
    }

    fn store_many(&self, rows: Vec<TelemetryRow>) -> Result<(), StorageError> {
        if rows.is_empty() {
            return Ok(());
        }
        if !self.state.read().ready {
            return Err(StorageError::NotInitialized);
        }

        let mut writer = self.writer.lock();
        let conn = writer.as_mut().ok_or(StorageError::NotInitialized)?;
        with_locked_retry(|| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(SQL_INSERT)?;
                for row in &rows {
                    stmt.execute(params![
                        row.pid,
                        row.stack.serialize(),
                        row.comm,
                        row.process_name,
                        row.result,
                        row.timestamp_ns as i64,
                        row.syscall,
                        row.duration_ns as i64,
                        &row.arguments[..],
                    ])?;
                }
            }
            tx.commit()
        })?;

        // The batch is committed; fold it into the running aggregate.
        let mut aggregates = self.aggregates.lock();
        for row in &rows {
            let entry = aggregates.entry(row.syscall.clone()).or_insert((0, 0));
            entry.0 += 1;
            entry.1 += row.duration_ns;
        }
        self.row_count.fetch_add(rows.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    fn size(&self) -> Result<u64, StorageError> {
        if !self.state.read().ready {
            return Err(StorageError::NotInitialized);
        }
        Ok(self.row_count.load(Ordering::SeqCst))
    }

    fn clear(&self) -> Result<(), StorageError> {
        if !self.state.read().ready {
            return Err(StorageError::NotInitialized);
        }
        let mut writer = self.writer.lock();
        let conn = writer.as_mut().ok_or(StorageError::NotInitialized)?;
        with_locked_retry(|| conn.execute("DELETE FROM events", []))?;
        self.aggregates.lock().clear();
        self.row_count.store(0, Ordering::SeqCst);
        Ok(())
    }

    fn query_page(
        &self,
        pids: &[i32],
        page: u32,
        page_size: u32,
        sort: SortKey,
        ascending: bool,
        syscalls: &[String],
    ) -> Result<Vec<TelemetryRow>, StorageError> {
        let universe = self.state.read().universe.clone();
        let sql = format!(
            "{SQL_SELECT}{} ORDER BY {} LIMIT {} OFFSET {}",
            Self::where_clause(&[
                Self::pid_clause(pids),
                Self::syscall_clause(&universe, syscalls)
            ]),
            Self::order_terms(sort, ascending),
            page_size,
            page as u64 * page_size as u64,
        );
        self.query_rows(&sql, None)
    }

    fn query_filtered_page(
        &self,
        text: &str,
        pids: &[i32],
        page: u32,
        page_size: u32,
        sort: SortKey,
        ascending: bool,
        syscalls: &[String],
    ) -> Result<Vec<TelemetryRow>, StorageError> {
        let universe = self.state.read().universe.clone();
        let sql = format!(
            "{SQL_SELECT}{} ORDER BY {} LIMIT {} OFFSET {}",
            Self::where_clause(&[
                Self::pid_clause(pids),
                Self::syscall_clause(&universe, syscalls),
                Some(SQL_TEXT_MATCH.to_string()),
            ]),
            Self::order_terms(sort, ascending),
            page_size,
            page as u64 * page_size as u64,
        );
        self.query_rows(&sql, Some(text))
    }

    fn search_ids(
        &self,
        text: &str,
        pids: &[i32],
        sort: SortKey,
        ascending: bool,
        syscalls: &[String],
    ) -> Result<Vec<u64>, StorageError> {
        let (conn, universe) = self.open_reader()?;
        // Ordinals are assigned over the pid/syscall-filtered view the UI
        // is paging through; the text restriction applies outside the
        // window function so it cannot perturb the numbering.
        let sql = format!(
            "SELECT rownum FROM ( \
                SELECT ROW_NUMBER() OVER (ORDER BY {}) AS rownum, \
                       pid, processname, syscall, duration, resultcode \
                FROM events{} \
             ) WHERE {SQL_TEXT_MATCH} ORDER BY rownum",
            Self::order_terms(sort, ascending),
            Self::where_clause(&[
                Self::pid_clause(pids),
                Self::syscall_clause(&universe, syscalls)
            ]),
        );
        let ids = with_locked_retry(|| {
            let mut stmt = conn.prepare(&sql)?;
            let mapped = stmt.query_map(params![text], |row| row.get::<_, u64>(0))?;
            mapped.collect::<rusqlite::Result<Vec<u64>>>()
        })?;
        Ok(ids)
    }

    fn query_by_result(
        &self,
        result: i64,
        syscalls: &[String],
    ) -> Result<Vec<TelemetryRow>, StorageError> {
        let universe = self.state.read().universe.clone();
        let sql = format!(
            "{SQL_SELECT}{} ORDER BY rowid ASC",
            Self::where_clause(&[
                Some(format!("resultcode = {result}")),
                Self::syscall_clause(&universe, syscalls)
            ]),
        );
        self.query_rows(&sql, None)
    }

    fn aggregate(&self) -> Result<AggregateMap, StorageError> {
        if !self.state.read().ready {
            return Err(StorageError::NotInitialized);
        }
        Ok(self.aggregates.lock().clone())
    }

    fn export(
        &self,
        start_time_ns: u64,
        start_time_wall: &str,
        path: &Path,
    ) -> Result<(), StorageError> {
        if !self.state.read().ready {
            return Err(StorageError::NotInitialized);
        }
        let mut writer = self.writer.lock();
        let conn = writer.as_mut().ok_or(StorageError::NotInitialized)?;

        if path.exists() {
            std::fs::remove_file(path).map_err(|_| StorageError::Export {
                path: path.to_path_buf(),
                source: rusqlite::Error::InvalidPath(path.to_path_buf()),
            })?;
        }

        let aggregates = self.aggregates.lock().clone();
        let result = export_with_sidecar_tables(conn, start_time_ns, start_time_wall, &aggregates, path);

        // The metadata and stats rows belong to the snapshot, not the live
        // session; scrub them whether or not the copy succeeded.
        let _ = conn.execute("DELETE FROM metadata", []);
        let _ = conn.execute("DELETE FROM stats", []);

        result.map_err(|source| StorageError::Export {
            path: path.to_path_buf(),
            source,
        })
    }

    fn load(&self, path: &Path) -> Result<SnapshotStartTime, StorageError> {
        let mut state = self.state.write();
        if !state.ready {
            return Err(StorageError::NotInitialized);
        }

        let restore_err = |source| StorageError::Restore {
            path: path.to_path_buf(),
            source,
        };

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(restore_err)?;

        let count: u64 = conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
            .map_err(restore_err)?;

        let mut aggregates = AggregateMap::new();
        {
            let mut stmt = conn
                .prepare("SELECT syscall, count, duration FROM stats")
                .map_err(restore_err)?;
            let entries = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, u64>(1)?,
                        row.get::<_, u64>(2)?,
                    ))
                })
                .map_err(restore_err)?;
            for entry in entries {
                let (syscall, count, duration) = entry.map_err(restore_err)?;
                aggregates.insert(syscall, (count, duration));
            }
        }

        let start_time = conn
            .query_row(
                "SELECT start_time_ns, start_time_wall FROM metadata",
                [],
                |row| Ok((row.get::<_, u64>(0)?, row.get::<_, String>(1)?)),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    StorageError::MissingMetadata(path.to_path_buf())
                }
                other => restore_err(other),
            })?;

        // Swap the snapshot in as the backing store. The old in-memory
        // database dies with its last connection.
        *self.writer.lock() = Some(conn);
        state.backing = Backing::File(path.to_path_buf());
        *self.aggregates.lock() = aggregates;
        self.row_count.store(count, Ordering::SeqCst);
        debug!("loaded {} events from {}", count, path.display());
        Ok(start_time)
    }
}

fn export_with_sidecar_tables(
    conn: &mut Connection,
    start_time_ns: u64,
    start_time_wall: &str,
    aggregates: &AggregateMap,
    path: &Path,
) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO metadata (start_time_ns, start_time_wall) VALUES (?1, ?2)",
        params![start_time_ns, start_time_wall],
    )?;
    {
        let mut stmt =
            tx.prepare("INSERT INTO stats (syscall, count, duration) VALUES (?1, ?2, ?3)")?;
        for (syscall, (count, duration)) in aggregates {
            stmt.execute(params![syscall, count, duration])?;
        }
    }
    tx.commit()?;

    let target = path.to_string_lossy().into_owned();
    conn.execute("VACUUM INTO ?1", params![target])?;
    Ok(())
}

fn parse_row(row: &rusqlite::Row) -> rusqlite::Result<TelemetryRow> {
    let stack: String = row.get(1)?;
    let blob: Vec<u8> = row.get(8)?;
    let mut arguments = [0u8; MAX_BUFFER];
    let len = blob.len().min(MAX_BUFFER);
    arguments[..len].copy_from_slice(&blob[..len]);
    Ok(TelemetryRow {
        pid: row.get(0)?,
        stack: StackTrace::inflate(&stack),
        comm: row.get(2)?,
        process_name: row.get(3)?,
        result: row.get(4)?,
        timestamp_ns: row.get::<_, i64>(5)? as u64,
        syscall: row.get(6)?,
        duration_ns: row.get::<_, i64>(7)? as u64,
        arguments,
    })
}

fn is_locked(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::DatabaseLocked
                || e.code == rusqlite::ErrorCode::DatabaseBusy
    )
}

/// Shared-cache readers and the writer collide with SQLITE_LOCKED rather
/// than queueing; back off and retry instead of surfacing the collision.
fn with_locked_retry<T>(
    mut f: impl FnMut() -> rusqlite::Result<T>,
) -> rusqlite::Result<T> {
    let mut attempts = 0;
    loop {
        match f() {
            Err(err) if is_locked(&err) && attempts < LOCKED_RETRY_LIMIT => {
                attempts += 1;
                std::thread::sleep(LOCKED_RETRY_SLEEP);
            }
            other => return other,
        }
    }
}
