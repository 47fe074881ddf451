//! Syscall schema collection.
//!
//! At startup the host's tracepoint format descriptors are parsed into one
//! [`SyscallSchema`] record per syscall. The records are shared read-only
//! with the kernel probe (keyed by syscall number) and drive the argument
//! decoder in the formatter.

pub mod syscall_nr;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use procmon_probe_abi::{ArgTag, SyscallSchema, MAX_ARGS, SYSCALL_NAME_LEN};

use crate::error::ConfigError;

/// Syscalls whose non-negative return value is an address and is rendered
/// as hex.
pub const POINTER_RETURNING_SYSCALLS: &[&str] = &["mmap", "mremap", "shmat", "getcwd"];

const TRACEFS_SYSCALL_DIRS: &[&str] = &[
    "/sys/kernel/tracing/events/syscalls",
    "/sys/kernel/debug/tracing/events/syscalls",
];

/// Maps a tracepoint argument to its tag. The rules are fixed: exact
/// textual matches first, then the `fd` name rule, then the generic
/// pointer rule, then `Unknown`.
pub fn arg_tag_for(arg_name: &str, arg_type: &str) -> ArgTag {
    match arg_type {
        "fd" => ArgTag::Fd,
        "int" => ArgTag::Int,
        "unsigned int" => ArgTag::UnsignedInt,
        "size_t" => ArgTag::SizeT,
        "pid_t" => ArgTag::PidT,
        "long" => ArgTag::Long,
        "unsigned long" => ArgTag::UnsignedLong,
        "char *" => ArgTag::CharPtr,
        "const char *" => ArgTag::ConstCharPtr,
        "u32" => ArgTag::Uint32,
        "unsigned" => ArgTag::UnsignedInt,
        "umode_t" => ArgTag::Int,
        _ if arg_name == "fd" => ArgTag::Fd,
        _ if arg_type.contains('*') => ArgTag::Ptr,
        _ => ArgTag::Unknown,
    }
}

/// Every syscall the host knows about, keyed by syscall number.
pub struct SyscallTable {
    entries: BTreeMap<u32, SyscallSchema>,
    numbers_by_name: BTreeMap<String, u32>,
}

impl SyscallTable {
    /// Walks the host's syscall tracepoint directory and parses every
    /// `sys_enter_*` format descriptor.
    pub fn collect() -> Result<Self, ConfigError> {
        let dir = TRACEFS_SYSCALL_DIRS
            .iter()
            .map(Path::new)
            .find(|p| p.is_dir())
            .ok_or_else(|| ConfigError::SchemaUnavailable {
                path: PathBuf::from(TRACEFS_SYSCALL_DIRS[0]),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })?;
        Self::collect_from(dir)
    }

    pub fn collect_from(dir: &Path) -> Result<Self, ConfigError> {
        let mut table = SyscallTable {
            entries: BTreeMap::new(),
            numbers_by_name: BTreeMap::new(),
        };

        let read_dir = fs::read_dir(dir).map_err(|source| ConfigError::SchemaUnavailable {
            path: dir.to_path_buf(),
            source,
        })?;

        for entry in read_dir.flatten() {
            let file_name = entry.file_name();
            let Some(name) = file_name
                .to_str()
                .and_then(|n| n.strip_prefix("sys_enter_"))
            else {
                continue;
            };
            let Some(nr) = syscall_nr::number_for_name(name) else {
                // Present in tracefs but not in our per-arch table; the
                // probe could not be keyed for it anyway.
                debug!("no syscall number for {name}, skipping");
                continue;
            };
            let format_path = entry.path().join("format");
            let contents = match fs::read_to_string(&format_path) {
                Ok(contents) => contents,
                Err(err) => {
                    warn!("could not read {}: {err}", format_path.display());
                    continue;
                }
            };
            let schema = parse_format(name, &contents);
            table.numbers_by_name.insert(name.to_string(), nr);
            table.entries.insert(nr, schema);
        }

        debug!("collected {} syscall schemas", table.entries.len());
        Ok(table)
    }

    /// Checks an operator-supplied list of names; the first unknown name
    /// aborts startup.
    pub fn validate_names(&self, names: &[String]) -> Result<(), ConfigError> {
        for name in names {
            if !self.numbers_by_name.contains_key(name) {
                return Err(ConfigError::UnknownSyscall(name.clone()));
            }
        }
        Ok(())
    }

    pub fn number_for_name(&self, name: &str) -> Option<u32> {
        self.numbers_by_name.get(name).copied()
    }

    pub fn name_for_number(&self, nr: u32) -> Option<&str> {
        self.entries
            .get(&nr)
            .map(|s| std::str::from_utf8(s.name_bytes()).unwrap_or(""))
    }

    pub fn schema_for_number(&self, nr: u32) -> Option<&SyscallSchema> {
        self.entries.get(&nr)
    }

    pub fn schema_for_name(&self, name: &str) -> Option<&SyscallSchema> {
        self.number_for_name(name)
            .and_then(|nr| self.schema_for_number(nr))
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &SyscallSchema)> {
        self.entries.iter().map(|(nr, s)| (*nr, s))
    }

    /// All syscall names the host implements, sorted.
    pub fn all_names(&self) -> Vec<String> {
        self.numbers_by_name.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parses one `format` descriptor. Everything up to and including the
/// `__syscall_nr` field is common tracepoint preamble; the remaining
/// `field:` lines describe the syscall's arguments in order.
fn parse_format(syscall_name: &str, contents: &str) -> SyscallSchema {
    let mut schema = SyscallSchema::zeroed();
    copy_truncated(&mut schema.name, syscall_name.as_bytes());

    let mut past_preamble = false;
    let mut arg_count = 0usize;
    for line in contents.lines() {
        if !past_preamble {
            past_preamble = line.contains("__syscall_nr");
            continue;
        }
        if arg_count >= MAX_ARGS {
            break;
        }
        let Some((arg_type, arg_name)) = parse_field_line(line) else {
            continue;
        };
        copy_truncated(&mut schema.arg_names[arg_count], arg_name.as_bytes());
        schema.arg_tags[arg_count] = arg_tag_for(arg_name, arg_type);
        arg_count += 1;
    }

    schema.used_arg_count = arg_count as u32;
    schema
}

/// Extracts `(type, name)` from a line of the shape
/// `\tfield:const char * filename;\toffset:16;\tsize:8;\tsigned:0;`.
fn parse_field_line(line: &str) -> Option<(&str, &str)> {
    if !line.contains("field:") {
        return None;
    }
    let colon = line.find(':')?;
    let semicolon = line.find(';')?;
    let declaration = line.get(colon + 1..semicolon)?.trim();
    let last_space = declaration.rfind(' ')?;
    let arg_type = declaration[..last_space].trim();
    let arg_name = declaration[last_space + 1..].trim();
    if arg_name.is_empty() || arg_type.is_empty() {
        return None;
    }
    Some((arg_type, arg_name))
}

fn copy_truncated(dst: &mut [u8; SYSCALL_NAME_LEN], src: &[u8]) {
    let len = src.len().min(SYSCALL_NAME_LEN - 1);
    dst[..len].copy_from_slice(&src[..len]);
}
