//! Renders a telemetry row into its display columns.

use nix::errno::Errno;
use nix::sys::signal::Signal;
use procmon_probe_abi::{ArgTag, SyscallSchema, MAX_BUFFER, STRING_ARG_LEN};

use crate::schema::{SyscallTable, POINTER_RETURNING_SYSCALLS};
use crate::storage::TelemetryRow;

/// The rendered columns for one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormattedEvent {
    pub timestamp: String,
    pub pid: String,
    pub process: String,
    pub operation: String,
    pub result: String,
    pub duration: String,
    pub details: String,
}

pub struct EventFormatter<'a> {
    table: &'a SyscallTable,
    start_time_ns: u64,
}

type DetailFn = fn(&EventFormatter, &TelemetryRow, &SyscallSchema) -> String;

/// Per-syscall detail formatter. `kill` gets a specialized rendering; the
/// default branch decodes arguments by schema tag.
fn detail_formatter_for(syscall: &str) -> DetailFn {
    match syscall {
        "kill" => format_kill_details,
        _ => format_default_details,
    }
}

impl<'a> EventFormatter<'a> {
    pub fn new(table: &'a SyscallTable, start_time_ns: u64) -> Self {
        EventFormatter {
            table,
            start_time_ns,
        }
    }

    pub fn format(&self, row: &TelemetryRow) -> FormattedEvent {
        FormattedEvent {
            timestamp: self.timestamp(row),
            pid: row.pid.to_string(),
            process: row.process_name.clone(),
            operation: row.syscall.clone(),
            result: self.result(row),
            duration: self.duration(row),
            details: self.details(row),
        }
    }

    /// `+HH:MM:SS.mmm` relative to the session start.
    pub fn timestamp(&self, row: &TelemetryRow) -> String {
        let mut delta = row.timestamp_ns.saturating_sub(self.start_time_ns);
        let hours = delta / 3_600_000_000_000;
        delta %= 3_600_000_000_000;
        let minutes = delta / 60_000_000_000;
        delta %= 60_000_000_000;
        let seconds = delta / 1_000_000_000;
        let millis = (delta % 1_000_000_000) / 1_000_000;
        format!("+{hours:02}:{minutes:02}:{seconds:02}.{millis:03}")
    }

    /// Milliseconds with three decimal places.
    pub fn duration(&self, row: &TelemetryRow) -> String {
        format!("{:.3}", row.duration_ns as f64 / 1_000_000.0)
    }

    /// Decimal, `0xHEX` for the pointer-returning syscalls, or
    /// `decimal (errno name)` when negative.
    pub fn result(&self, row: &TelemetryRow) -> String {
        if row.result >= 0 {
            if POINTER_RETURNING_SYSCALLS.contains(&row.syscall.as_str()) {
                format!("0x{:016x}", row.result)
            } else {
                row.result.to_string()
            }
        } else {
            let errno = Errno::from_raw((-row.result) as i32);
            format!("{} ({:?})", row.result, errno)
        }
    }

    pub fn details(&self, row: &TelemetryRow) -> String {
        let Some(schema) = self.table.schema_for_name(&row.syscall) else {
            return String::new();
        };
        detail_formatter_for(&row.syscall)(self, row, schema)
    }
}

fn format_kill_details(_f: &EventFormatter, row: &TelemetryRow, _schema: &SyscallSchema) -> String {
    let target_pid = read_i64(&row.arguments, 0);
    let signal = read_i64(&row.arguments, 8);

    let sent = match i32::try_from(signal).ok().and_then(|s| Signal::try_from(s).ok()) {
        Some(signal_name) => {
            format!("{} sent to process ID {}", signal_name.as_str(), target_pid)
        }
        None => format!("Signal {signal} sent to process ID {target_pid}"),
    };
    format!("target_pid={target_pid}  signal={signal}  {sent}")
}

fn format_default_details(
    _f: &EventFormatter,
    row: &TelemetryRow,
    schema: &SyscallSchema,
) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut offset = 0usize;

    for i in 0..schema.used_arg_count as usize {
        let tag = schema.arg_tags[i];
        let len = tag.payload_len();
        if tag == ArgTag::Unknown || offset + len > MAX_BUFFER {
            // The probe stopped capturing here; anything further is absent.
            parts.push(format!(
                "{}={{}}",
                String::from_utf8_lossy(schema.arg_name_bytes(i))
            ));
            break;
        }

        let name = String::from_utf8_lossy(schema.arg_name_bytes(i));
        let value = match tag {
            ArgTag::Int | ArgTag::Long => read_i64(&row.arguments, offset).to_string(),
            ArgTag::Uint32 => read_u32(&row.arguments, offset).to_string(),
            ArgTag::UnsignedInt | ArgTag::UnsignedLong | ArgTag::SizeT | ArgTag::PidT => {
                read_u64(&row.arguments, offset).to_string()
            }
            ArgTag::CharPtr | ArgTag::ConstCharPtr => match row.syscall.as_str() {
                // read() fills its buffer on the way out; there is nothing
                // meaningful to show at entry.
                "read" => "{in}".to_string(),
                "write" => {
                    let wanted = row.result.max(0) as usize;
                    hex_preview(&row.arguments[offset..offset + STRING_ARG_LEN], wanted)
                }
                _ => string_preview(&row.arguments[offset..offset + STRING_ARG_LEN]),
            },
            ArgTag::Fd => string_preview(&row.arguments[offset..offset + STRING_ARG_LEN]),
            ArgTag::Ptr => {
                let ptr = read_u64(&row.arguments, offset);
                if ptr == 0 {
                    "NULL".to_string()
                } else {
                    format!("0x{ptr:x}")
                }
            }
            ArgTag::Unknown => unreachable!(),
        };

        parts.push(format!("{name}={value}"));
        offset += len;
    }

    parts.join("  ")
}

fn read_u64(buffer: &[u8; MAX_BUFFER], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buffer[offset..offset + 8]);
    u64::from_ne_bytes(bytes)
}

fn read_i64(buffer: &[u8; MAX_BUFFER], offset: usize) -> i64 {
    read_u64(buffer, offset) as i64
}

fn read_u32(buffer: &[u8; MAX_BUFFER], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buffer[offset..offset + 4]);
    u32::from_ne_bytes(bytes)
}

/// Printable preview of a captured string argument, up to the first NUL.
fn string_preview(bytes: &[u8]) -> String {
    let len = memchr::memchr(0, bytes).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..len]).into_owned()
}

/// Hex dump of up to `wanted` captured bytes (bounded by the slot size).
fn hex_preview(bytes: &[u8], wanted: usize) -> String {
    let len = wanted.min(bytes.len());
    bytes[..len]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SyscallTable;
    use std::fs;

    fn format_file(dir: &std::path::Path, syscall: &str, fields: &[(&str, &str)]) {
        let entry = dir.join(format!("sys_enter_{syscall}"));
        fs::create_dir(&entry).unwrap();
        let mut contents = String::from(
            "name: test\nID: 1\nformat:\n\tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;\n\n\tfield:int __syscall_nr;\toffset:8;\tsize:4;\tsigned:1;\n",
        );
        for (ty, name) in fields {
            contents.push_str(&format!("\tfield:{ty} {name};\toffset:16;\tsize:8;\tsigned:0;\n"));
        }
        fs::write(entry.join("format"), contents).unwrap();
    }

    fn test_table() -> (tempfile::TempDir, SyscallTable) {
        let dir = tempfile::tempdir().unwrap();
        format_file(dir.path(), "kill", &[("pid_t", "pid"), ("int", "sig")]);
        format_file(
            dir.path(),
            "write",
            &[("unsigned int", "fd"), ("const char *", "buf"), ("size_t", "count")],
        );
        format_file(
            dir.path(),
            "read",
            &[("unsigned int", "fd"), ("char *", "buf"), ("size_t", "count")],
        );
        format_file(
            dir.path(),
            "openat",
            &[("int", "dfd"), ("const char *", "filename"), ("int", "flags")],
        );
        format_file(dir.path(), "mmap", &[("unsigned long", "addr")]);
        format_file(dir.path(), "brk", &[("unsigned long", "brk")]);
        format_file(
            dir.path(),
            "poll",
            &[("struct pollfd *", "ufds"), ("unsigned int", "nfds")],
        );
        let table = SyscallTable::collect_from(dir.path()).unwrap();
        (dir, table)
    }

    fn row(syscall: &str) -> TelemetryRow {
        TelemetryRow {
            pid: 1000,
            process_name: "bash".to_string(),
            comm: "bash".to_string(),
            syscall: syscall.to_string(),
            ..TelemetryRow::default()
        }
    }

    #[test]
    fn kill_details_render_signal_names() {
        let (_dir, table) = test_table();
        let formatter = EventFormatter::new(&table, 0);

        let mut row = row("kill");
        row.arguments[..8].copy_from_slice(&1234i64.to_ne_bytes());
        row.arguments[8..16].copy_from_slice(&9i64.to_ne_bytes());

        assert_eq!(
            formatter.details(&row),
            "target_pid=1234  signal=9  SIGKILL sent to process ID 1234"
        );
    }

    #[test]
    fn kill_details_fall_back_for_unknown_signals() {
        let (_dir, table) = test_table();
        let formatter = EventFormatter::new(&table, 0);

        let mut row = row("kill");
        row.arguments[..8].copy_from_slice(&42i64.to_ne_bytes());
        row.arguments[8..16].copy_from_slice(&250i64.to_ne_bytes());

        assert_eq!(
            formatter.details(&row),
            "target_pid=42  signal=250  Signal 250 sent to process ID 42"
        );
    }

    #[test]
    fn read_prints_in_marker_and_write_hexdumps() {
        let (_dir, table) = test_table();
        let formatter = EventFormatter::new(&table, 0);

        let mut read_row = row("read");
        read_row.arguments[..8].copy_from_slice(&3u64.to_ne_bytes());
        assert_eq!(formatter.details(&read_row), "fd=3  buf={in}  count=0");

        let mut write_row = row("write");
        write_row.result = 2;
        write_row.arguments[..8].copy_from_slice(&1u64.to_ne_bytes());
        write_row.arguments[8] = 0xde;
        write_row.arguments[9] = 0xad;
        // Only min(result, slot) bytes of the payload are shown.
        let details = formatter.details(&write_row);
        assert_eq!(details, "fd=1  buf=de ad  count=0");
    }

    #[test]
    fn string_arguments_preview_up_to_nul() {
        let (_dir, table) = test_table();
        let formatter = EventFormatter::new(&table, 0);

        let mut row = row("openat");
        row.arguments[..8].copy_from_slice(&(-100i64).to_ne_bytes());
        row.arguments[8..17].copy_from_slice(b"/etc/host");
        let details = formatter.details(&row);
        assert_eq!(details, "dfd=-100  filename=/etc/host  flags=0");
    }

    #[test]
    fn results_render_decimal_hex_and_errno() {
        let (_dir, table) = test_table();
        let formatter = EventFormatter::new(&table, 0);

        let mut plain = row("read");
        plain.result = 17;
        assert_eq!(formatter.result(&plain), "17");

        let mut pointer = row("mmap");
        pointer.result = 0x7f00_0000;
        assert_eq!(formatter.result(&pointer), "0x000000007f000000");

        let mut failed = row("openat");
        failed.result = -2;
        assert_eq!(formatter.result(&failed), "-2 (ENOENT)");
    }

    #[test]
    fn timestamps_are_relative_and_zero_padded() {
        let (_dir, table) = test_table();
        let formatter = EventFormatter::new(&table, 1_000_000_000);

        let mut r = row("read");
        r.timestamp_ns = 1_000_000_000 + 3_661_042_000_000;
        assert_eq!(formatter.timestamp(&r), "+01:01:01.042");

        // Events predating the session anchor clamp to zero.
        r.timestamp_ns = 0;
        assert_eq!(formatter.timestamp(&r), "+00:00:00.000");
    }

    #[test]
    fn duration_is_milliseconds_with_three_decimals() {
        let (_dir, table) = test_table();
        let formatter = EventFormatter::new(&table, 0);

        let mut r = row("read");
        r.duration_ns = 1_534_000;
        assert_eq!(formatter.duration(&r), "1.534");
        r.duration_ns = 12;
        assert_eq!(formatter.duration(&r), "0.000");
    }

    #[test]
    fn pointers_render_as_hex_or_null() {
        let (_dir, table) = test_table();
        let formatter = EventFormatter::new(&table, 0);

        let mut r = row("poll");
        r.arguments[..8].copy_from_slice(&0u64.to_ne_bytes());
        r.arguments[8..16].copy_from_slice(&5u64.to_ne_bytes());
        assert_eq!(formatter.details(&r), "ufds=NULL  nfds=5");

        r.arguments[..8].copy_from_slice(&0xdead_beefu64.to_ne_bytes());
        assert_eq!(formatter.details(&r), "ufds=0xdeadbeef  nfds=5");
    }
}
