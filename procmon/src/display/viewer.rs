//! Line-mode viewers: live streaming output for an interactive session,
//! and a snapshot dump for `--file`.

use std::time::Duration;

use crate::display::formatter::{EventFormatter, FormattedEvent};
use crate::display::sigint_received;
use crate::error::ProcmonError;
use crate::schema::SyscallTable;
use crate::session::Session;
use crate::storage::SortKey;

const PAGE_SIZE: u32 = 512;
const REFRESH_INTERVAL: Duration = Duration::from_millis(200);

fn print_header() {
    println!(
        "{:<14} {:>7} {:<16} {:<22} {:>20} {:>10}  {}",
        "TIME", "PID", "PROCESS", "OPERATION", "RESULT", "DURATION", "DETAILS"
    );
}

fn print_event(event: &FormattedEvent) {
    println!(
        "{:<14} {:>7} {:<16} {:<22} {:>20} {:>10}  {}",
        event.timestamp,
        event.pid,
        event.process,
        event.operation,
        event.result,
        event.duration,
        event.details
    );
}

/// Streams captured events to stdout as they arrive, in time order,
/// until Ctrl+C suspends the session.
pub fn run_stream(session: &Session, table: &SyscallTable) -> Result<(), ProcmonError> {
    let formatter = EventFormatter::new(table, session.config().start_time_ns);
    let storage = session.storage();

    print_header();
    let mut printed: u64 = 0;
    loop {
        if sigint_received() {
            session.suspend();
            break;
        }

        let total = storage.size()?;
        while printed < total {
            let page = (printed / PAGE_SIZE as u64) as u32;
            let rows = storage.query_page(&[], page, PAGE_SIZE, SortKey::Time, true, &[])?;
            let skip = (printed % PAGE_SIZE as u64) as usize;
            for row in rows.iter().skip(skip) {
                print_event(&formatter.format(row));
                printed += 1;
            }
            if rows.len() < PAGE_SIZE as usize {
                break;
            }
        }

        std::thread::sleep(REFRESH_INTERVAL);
    }
    Ok(())
}

/// Dumps a loaded snapshot to stdout, page by page.
pub fn run_snapshot(session: &Session, table: &SyscallTable) -> Result<(), ProcmonError> {
    let formatter = EventFormatter::new(table, session.config().start_time_ns);
    let storage = session.storage();
    let total = storage.size()?;

    println!(
        "Trace start: {}  ({} events)",
        session.config().start_time_wall,
        total
    );
    println!();
    print_header();

    let mut page = 0u32;
    loop {
        let rows = storage.query_page(&[], page, PAGE_SIZE, SortKey::Time, true, &[])?;
        if rows.is_empty() {
            break;
        }
        for row in &rows {
            print_event(&formatter.format(row));
        }
        if rows.len() < PAGE_SIZE as usize {
            break;
        }
        page += 1;
    }

    let aggregates = storage.aggregate()?;
    if !aggregates.is_empty() {
        println!();
        println!("{:<22} {:>10} {:>16}", "SYSCALL", "COUNT", "TOTAL NS");
        let mut entries: Vec<_> = aggregates.into_iter().collect();
        entries.sort_by(|a, b| b.1 .0.cmp(&a.1 .0));
        for (syscall, (count, duration)) in entries {
            println!("{syscall:<22} {count:>10} {duration:>16}");
        }
    }
    Ok(())
}
