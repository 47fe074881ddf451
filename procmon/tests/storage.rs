//! Event store contract tests: sorting, filtering, pagination, search,
//! aggregates, snapshot round-trips, and reader/writer consistency.

use std::path::Path;
use std::sync::Arc;

use procmon::stack_trace::StackTrace;
use procmon::storage::sqlite::Sqlite3StorageEngine;
use procmon::storage::{SortKey, StorageEngine, TelemetryRow};

const SYSCALLS: &[&str] = &["openat", "read", "write", "close", "kill"];

fn universe() -> Vec<String> {
    SYSCALLS.iter().map(|s| s.to_string()).collect()
}

fn new_engine() -> Sqlite3StorageEngine {
    let engine = Sqlite3StorageEngine::new();
    engine.initialize(&universe()).unwrap();
    engine
}

/// Tiny deterministic generator so the scenarios are reproducible.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    fn in_range(&mut self, lo: i64, hi: i64) -> i64 {
        lo + (self.next() % (hi - lo) as u64) as i64
    }
}

fn row(i: usize, pid: i32, syscall: &str, result: i64, timestamp_ns: u64) -> TelemetryRow {
    let mut arguments = [0u8; 128];
    arguments[..8].copy_from_slice(&(i as u64).to_ne_bytes());
    TelemetryRow {
        pid,
        stack: StackTrace {
            user_ips: vec![0x1000 + i as u64],
        },
        comm: format!("proc{pid}"),
        process_name: format!("proc{pid}"),
        syscall: syscall.to_string(),
        result,
        duration_ns: (i as u64 % 7) * 1000,
        timestamp_ns,
        arguments,
    }
}

fn sample_rows(count: usize) -> Vec<TelemetryRow> {
    let mut rng = Lcg(42);
    (0..count)
        .map(|i| {
            let pid = rng.in_range(1000, 1010) as i32;
            let syscall = SYSCALLS[(rng.next() % SYSCALLS.len() as u64) as usize];
            let result = rng.in_range(-20, 21);
            // Deliberate timestamp collisions exercise the tie-break.
            let timestamp = (rng.next() % (count as u64 / 2 + 1)) * 10;
            row(i, pid, syscall, result, timestamp)
        })
        .collect()
}

fn all_rows(engine: &dyn StorageEngine, sort: SortKey, asc: bool) -> Vec<TelemetryRow> {
    let mut out = Vec::new();
    let mut page = 0;
    loop {
        let rows = engine.query_page(&[], page, 1000, sort, asc, &[]).unwrap();
        let done = rows.len() < 1000;
        out.extend(rows);
        if done {
            return out;
        }
        page += 1;
    }
}

/// Mirrors the store's ordering contract: the requested key in the
/// requested direction, then time ascending, then insertion rank.
fn reference_sort(rows: &[TelemetryRow], sort: SortKey, asc: bool) -> Vec<TelemetryRow> {
    let mut indexed: Vec<(usize, &TelemetryRow)> = rows.iter().enumerate().collect();
    indexed.sort_by(|(ai, a), (bi, b)| {
        let primary = match sort {
            SortKey::Time => a.timestamp_ns.cmp(&b.timestamp_ns),
            SortKey::Pid => a.pid.cmp(&b.pid),
            SortKey::Process => a.process_name.cmp(&b.process_name),
            SortKey::Operation => a.syscall.cmp(&b.syscall),
            SortKey::Result => a.result.cmp(&b.result),
            SortKey::Duration => a.duration_ns.cmp(&b.duration_ns),
        };
        let primary = if asc { primary } else { primary.reverse() };
        primary
            .then(a.timestamp_ns.cmp(&b.timestamp_ns))
            .then(ai.cmp(bi))
    });
    indexed.into_iter().map(|(_, r)| r.clone()).collect()
}

/// The five searchable renderings, matching what the store matches on.
fn renders_contain(row: &TelemetryRow, text: &str) -> bool {
    row.pid.to_string().contains(text)
        || row.process_name.contains(text)
        || row.syscall.contains(text)
        || row.duration_ns.to_string().contains(text)
        || row.result.to_string().contains(text)
}

#[test]
fn bulk_inserts_are_fully_accounted() {
    let engine = new_engine();
    let rows = sample_rows(120);
    for chunk in rows.chunks(50) {
        engine.store_many(chunk.to_vec()).unwrap();
    }
    assert_eq!(engine.size().unwrap(), 120);
}

#[test]
fn time_sort_breaks_ties_by_insertion_rank() {
    let engine = new_engine();
    // Same timestamp everywhere: order must be pure insertion order.
    let rows: Vec<TelemetryRow> = (0..40)
        .map(|i| row(i, 1000 + i as i32, "read", 0, 555))
        .collect();
    engine.store_many(rows.clone()).unwrap();

    let fetched = engine
        .query_page(&[], 0, 100, SortKey::Time, true, &[])
        .unwrap();
    assert_eq!(fetched, rows);
}

#[test]
fn every_sort_key_matches_the_reference_ordering() {
    let engine = new_engine();
    let rows = sample_rows(200);
    engine.store_many(rows.clone()).unwrap();

    for sort in [
        SortKey::Time,
        SortKey::Pid,
        SortKey::Process,
        SortKey::Operation,
        SortKey::Result,
        SortKey::Duration,
    ] {
        for asc in [true, false] {
            let fetched = all_rows(&engine, sort, asc);
            let expected = reference_sort(&rows, sort, asc);
            assert_eq!(fetched, expected, "sort {sort:?} asc={asc}");
        }
    }
}

#[test]
fn pagination_is_a_window_over_the_sorted_view() {
    let engine = new_engine();
    let rows = sample_rows(95);
    engine.store_many(rows.clone()).unwrap();

    let expected = reference_sort(&rows, SortKey::Pid, true);
    let mut paged = Vec::new();
    for page in 0..10 {
        paged.extend(
            engine
                .query_page(&[], page, 10, SortKey::Pid, true, &[])
                .unwrap(),
        );
    }
    assert_eq!(paged, expected);
}

#[test]
fn pid_and_syscall_filters_restrict_the_view() {
    let engine = new_engine();
    let rows = sample_rows(150);
    engine.store_many(rows.clone()).unwrap();

    let pids = vec![1001, 1004];
    let selected = vec!["read".to_string(), "kill".to_string()];
    let fetched = engine
        .query_page(&pids, 0, 1000, SortKey::Time, true, &selected)
        .unwrap();

    let expected: Vec<TelemetryRow> = reference_sort(&rows, SortKey::Time, true)
        .into_iter()
        .filter(|r| pids.contains(&r.pid) && selected.contains(&r.syscall))
        .collect();
    assert_eq!(fetched, expected);

    // A selection covering the whole universe is no restriction.
    let everything = engine
        .query_page(&[], 0, 1000, SortKey::Time, true, &universe())
        .unwrap();
    assert_eq!(everything.len(), rows.len());

    // The larger-half selection exercises the exclusion form.
    let larger_half: Vec<String> = ["openat", "read", "write", "close"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let fetched = engine
        .query_page(&[], 0, 1000, SortKey::Time, true, &larger_half)
        .unwrap();
    assert!(fetched.iter().all(|r| r.syscall != "kill"));
    assert_eq!(
        fetched.len(),
        rows.iter().filter(|r| r.syscall != "kill").count()
    );
}

#[test]
fn text_filter_selects_exactly_the_matching_rows_in_order() {
    let engine = new_engine();
    let rows = sample_rows(200);
    engine.store_many(rows.clone()).unwrap();

    for text in ["100", "kill", "-1", "3000", "proc1007"] {
        let unfiltered = all_rows(&engine, SortKey::Duration, true);
        let expected: Vec<TelemetryRow> = unfiltered
            .into_iter()
            .filter(|r| renders_contain(r, text))
            .collect();
        let fetched = engine
            .query_filtered_page(text, &[], 0, 1000, SortKey::Duration, true, &[])
            .unwrap();
        assert_eq!(fetched, expected, "text filter {text:?}");
    }
}

#[test]
fn text_filter_is_case_sensitive_and_wildcard_free() {
    let engine = new_engine();
    engine
        .store_many(vec![
            row(0, 1000, "openat", 0, 1),
            row(1, 1001, "read", 0, 2),
        ])
        .unwrap();

    // Case matters.
    let fetched = engine
        .query_filtered_page("OPENAT", &[], 0, 100, SortKey::Time, true, &[])
        .unwrap();
    assert!(fetched.is_empty());

    // '%' has no wildcard meaning to the caller.
    let fetched = engine
        .query_filtered_page("%", &[], 0, 100, SortKey::Time, true, &[])
        .unwrap();
    assert!(fetched.is_empty());
}

#[test]
fn search_ids_are_ordinals_into_the_current_sort() {
    let engine = new_engine();
    let rows = sample_rows(150);
    engine.store_many(rows).unwrap();

    for (sort, asc) in [
        (SortKey::Time, true),
        (SortKey::Pid, false),
        (SortKey::Operation, true),
    ] {
        let text = "kill";
        let view = all_rows(&engine, sort, asc);
        let expected: Vec<u64> = view
            .iter()
            .enumerate()
            .filter(|(_, r)| renders_contain(r, text))
            .map(|(i, _)| i as u64 + 1)
            .collect();
        let ids = engine.search_ids(text, &[], sort, asc, &[]).unwrap();
        assert_eq!(ids, expected, "search ordinals for {sort:?} asc={asc}");

        // The ordinals point at exactly the rows the filtered query
        // returns, in the same order.
        let filtered = engine
            .query_filtered_page(text, &[], 0, 1000, sort, asc, &[])
            .unwrap();
        let by_ordinal: Vec<TelemetryRow> = ids
            .iter()
            .map(|id| view[*id as usize - 1].clone())
            .collect();
        assert_eq!(by_ordinal, filtered);
    }
}

#[test]
fn search_ids_number_the_pid_filtered_view() {
    let engine = new_engine();
    engine
        .store_many(vec![
            row(0, 1000, "kill", 0, 1),
            row(1, 2000, "kill", 0, 2),
            row(2, 2000, "read", 0, 3),
            row(3, 2000, "kill", 0, 4),
        ])
        .unwrap();

    // Within the pid-2000 view, the kill rows sit at ordinals 1 and 3.
    let ids = engine
        .search_ids("kill", &[2000], SortKey::Time, true, &[])
        .unwrap();
    assert_eq!(ids, vec![1, 3]);
}

#[test]
fn query_by_result_returns_exactly_the_matching_rows() {
    let engine = new_engine();
    let rows = sample_rows(50);
    engine.store_many(rows.clone()).unwrap();

    for result in -20..=20i64 {
        let fetched = engine.query_by_result(result, &[]).unwrap();
        let expected: Vec<TelemetryRow> = rows
            .iter()
            .filter(|r| r.result == result)
            .cloned()
            .collect();
        assert_eq!(fetched, expected, "result {result}");
    }
}

#[test]
fn aggregates_track_count_and_total_duration() {
    let engine = new_engine();
    let rows = sample_rows(300);
    engine.store_many(rows.clone()).unwrap();

    let aggregates = engine.aggregate().unwrap();
    for syscall in SYSCALLS {
        let matching: Vec<&TelemetryRow> =
            rows.iter().filter(|r| r.syscall == *syscall).collect();
        if matching.is_empty() {
            assert!(!aggregates.contains_key(*syscall));
            continue;
        }
        let (count, total) = aggregates[*syscall];
        assert_eq!(count, matching.len() as u64);
        assert_eq!(total, matching.iter().map(|r| r.duration_ns).sum::<u64>());
    }
}

#[test]
fn clear_is_idempotent_and_resets_everything() {
    let engine = new_engine();
    engine.store_many(sample_rows(30)).unwrap();
    assert_eq!(engine.size().unwrap(), 30);

    engine.clear().unwrap();
    assert_eq!(engine.size().unwrap(), 0);
    assert!(engine.aggregate().unwrap().is_empty());
    assert!(all_rows(&engine, SortKey::Time, true).is_empty());

    engine.clear().unwrap();
    assert_eq!(engine.size().unwrap(), 0);
}

fn assert_stores_equal(a: &dyn StorageEngine, b: &dyn StorageEngine) {
    assert_eq!(a.size().unwrap(), b.size().unwrap());
    assert_eq!(a.aggregate().unwrap(), b.aggregate().unwrap());
    for sort in [SortKey::Time, SortKey::Process, SortKey::Result] {
        for asc in [true, false] {
            assert_eq!(
                a.query_page(&[], 0, 1000, sort, asc, &[]).unwrap(),
                b.query_page(&[], 0, 1000, sort, asc, &[]).unwrap()
            );
        }
    }
}

#[test]
fn snapshot_round_trips_rows_aggregates_and_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trace.db");

    let engine = new_engine();
    engine.store_many(sample_rows(1000)).unwrap();
    engine
        .export(123_456_789, "2026-08-01T10:20:30Z", &path)
        .unwrap();

    let restored = new_engine();
    let (start_ns, start_wall) = restored.load(&path).unwrap();
    assert_eq!(start_ns, 123_456_789);
    assert_eq!(start_wall, "2026-08-01T10:20:30Z");
    assert_stores_equal(&engine, &restored);
}

#[test]
fn export_leaves_the_live_session_usable() {
    let dir = tempfile::tempdir().unwrap();
    let engine = new_engine();
    engine.store_many(sample_rows(20)).unwrap();

    engine
        .export(1, "t0", &dir.path().join("a.db"))
        .unwrap();
    // The session continues: more inserts, and a second export does not
    // duplicate metadata or stats.
    engine.store_many(sample_rows(20)).unwrap();
    engine
        .export(1, "t0", &dir.path().join("b.db"))
        .unwrap();

    let restored = new_engine();
    restored.load(&dir.path().join("b.db")).unwrap();
    assert_eq!(restored.size().unwrap(), 40);
}

#[test]
fn load_rejects_files_without_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.db");
    std::fs::write(&path, b"not a database").unwrap();

    let engine = new_engine();
    assert!(engine.load(&path).is_err());
    assert!(engine.load(Path::new("/nonexistent/trace.db")).is_err());
}

#[test]
fn five_hundred_thousand_rows_page_in_time_order() {
    let engine = new_engine();
    let mut rng = Lcg(7);
    let mut min_timestamps: Vec<(u64, usize)> = Vec::new();

    let mut batch = Vec::with_capacity(1000);
    let mut index = 0usize;
    for _ in 0..500 {
        batch.clear();
        for _ in 0..1000 {
            let timestamp = rng.next();
            batch.push(row(index, 1000, "read", 0, timestamp));
            min_timestamps.push((timestamp, index));
            index += 1;
        }
        engine.store_many(batch.clone()).unwrap();
    }
    assert_eq!(engine.size().unwrap(), 500_000);

    let fetched = engine
        .query_page(&[], 0, 100, SortKey::Time, true, &[])
        .unwrap();
    assert_eq!(fetched.len(), 100);

    min_timestamps.sort();
    for (fetched_row, (timestamp, _)) in fetched.iter().zip(min_timestamps.iter()) {
        assert_eq!(fetched_row.timestamp_ns, *timestamp);
    }
}

#[test]
fn concurrent_readers_observe_whole_batches_only() {
    let engine = Arc::new(new_engine());
    const BATCHES: i64 = 100;
    const BATCH_SIZE: usize = 50;

    let writer = {
        let engine = engine.clone();
        std::thread::spawn(move || {
            for batch_index in 0..BATCHES {
                let rows: Vec<TelemetryRow> = (0..BATCH_SIZE)
                    .map(|i| {
                        let mut r = row(i, batch_index as i32, "read", batch_index, 1);
                        r.duration_ns = batch_index as u64;
                        r
                    })
                    .collect();
                engine.store_many(rows).unwrap();
            }
        })
    };

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let engine = engine.clone();
            std::thread::spawn(move || {
                let mut last_seen = 0usize;
                while last_seen < (BATCHES as usize) * BATCH_SIZE {
                    let rows = all_rows(engine.as_ref(), SortKey::Time, true);
                    assert!(rows.len() >= last_seen, "row count went backwards");
                    last_seen = rows.len();

                    let mut per_batch = std::collections::BTreeMap::new();
                    for r in &rows {
                        // A torn row would break the pid/result/duration
                        // correlation the writer maintains.
                        assert_eq!(r.result, r.pid as i64);
                        assert_eq!(r.duration_ns, r.pid as u64);
                        *per_batch.entry(r.pid).or_insert(0usize) += 1;
                    }
                    for (batch_index, count) in per_batch {
                        assert_eq!(
                            count, BATCH_SIZE,
                            "partial batch visible for writer batch {batch_index}"
                        );
                    }
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
}
