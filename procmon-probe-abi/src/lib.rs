//! Types that cross the kernel/user boundary.
//!
//! Everything in here is `#[repr(C)]`, `Copy`, and fixed-size: the kernel
//! probe writes these records into shared maps and the perf ring, and the
//! userspace engine reads them back out. The layouts are part of the probe
//! ABI; changing them requires rebuilding the bundled kernel artifacts.

#![cfg_attr(not(any(feature = "user", test)), no_std)]

/// Size of the per-event argument payload.
pub const MAX_BUFFER: usize = 128;

/// Bytes reserved per string-typed argument inside the payload.
pub const STRING_ARG_LEN: usize = MAX_BUFFER / 6;

/// Maximum captured user-stack depth.
pub const MAX_STACK_FRAMES: usize = 32;

/// Maximum number of PID filter slots.
pub const MAX_PIDS: usize = 10;

/// `TASK_COMM_LEN` in the kernel.
pub const COMM_LEN: usize = 16;

/// Maximum arguments a syscall can take.
pub const MAX_ARGS: usize = 6;

/// Capacity of the kernel-shared schema map.
pub const MAX_SYSCALLS: u32 = 345;

/// Capacity of the pending-entries table.
pub const MAX_PENDING_EVENTS: u32 = 1000;

pub const SYSCALL_NAME_LEN: usize = 100;

/// The tracer's own command name; the probe drops events from it.
pub const SELF_COMM: &[u8; 7] = b"procmon";

/// Run-state latch values, read by the probe before any capture work.
pub const RUN_STATE_RUNNING: u32 = 0;
pub const RUN_STATE_SUSPENDED: u32 = 1;
pub const RUN_STATE_STOP: u32 = 2;

/// Classification of a syscall argument, derived from the textual type in
/// the host's tracepoint format descriptor. Drives both the probe's
/// payload-capture branch and the userspace argument decoder.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgTag {
    Unknown = 0,
    Int,
    UnsignedInt,
    SizeT,
    PidT,
    Long,
    UnsignedLong,
    CharPtr,
    ConstCharPtr,
    Fd,
    Ptr,
    Uint32,
}

impl ArgTag {
    /// Whether the payload stores a NUL-terminated string for this tag.
    pub fn is_string(self) -> bool {
        matches!(self, ArgTag::CharPtr | ArgTag::ConstCharPtr | ArgTag::Fd)
    }

    /// Bytes the tag occupies in the 128-byte argument payload.
    pub fn payload_len(self) -> usize {
        match self {
            ArgTag::Unknown => 0,
            ArgTag::Uint32 => core::mem::size_of::<u32>(),
            ArgTag::CharPtr | ArgTag::ConstCharPtr | ArgTag::Fd => STRING_ARG_LEN,
            _ => core::mem::size_of::<u64>(),
        }
    }
}

/// Per-syscall argument schema, written once at startup into the
/// kernel-shared schema map keyed by syscall number.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SyscallSchema {
    pub name: [u8; SYSCALL_NAME_LEN],
    pub arg_names: [[u8; SYSCALL_NAME_LEN]; MAX_ARGS],
    pub arg_tags: [ArgTag; MAX_ARGS],
    pub used_arg_count: u32,
}

impl SyscallSchema {
    pub const fn zeroed() -> Self {
        SyscallSchema {
            name: [0; SYSCALL_NAME_LEN],
            arg_names: [[0; SYSCALL_NAME_LEN]; MAX_ARGS],
            arg_tags: [ArgTag::Unknown; MAX_ARGS],
            used_arg_count: 0,
        }
    }

    /// The syscall name, up to the first NUL.
    pub fn name_bytes(&self) -> &[u8] {
        truncate_at_nul(&self.name)
    }

    pub fn arg_name_bytes(&self, index: usize) -> &[u8] {
        truncate_at_nul(&self.arg_names[index])
    }
}

/// One syscall invocation, filled in by the probe between the enter and
/// exit tracepoints and submitted to the perf ring on exit.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RawSyscallEvent {
    pub pid: u32,
    pub sysnum: u32,
    pub timestamp_ns: u64,
    pub duration_ns: u64,
    pub user_stack: [u64; MAX_STACK_FRAMES],
    pub user_stack_count: u64,
    pub ret: u64,
    pub comm: [u8; COMM_LEN],
    pub buffer: [u8; MAX_BUFFER],
}

impl RawSyscallEvent {
    pub const fn zeroed() -> Self {
        RawSyscallEvent {
            pid: 0,
            sysnum: 0,
            timestamp_ns: 0,
            duration_ns: 0,
            user_stack: [0; MAX_STACK_FRAMES],
            user_stack_count: 0,
            ret: 0,
            comm: [0; COMM_LEN],
            buffer: [0; MAX_BUFFER],
        }
    }

    pub fn comm_bytes(&self) -> &[u8] {
        truncate_at_nul(&self.comm)
    }
}

fn truncate_at_nul(bytes: &[u8]) -> &[u8] {
    match bytes.iter().position(|&b| b == 0) {
        Some(len) => &bytes[..len],
        None => bytes,
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for SyscallSchema {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for RawSyscallEvent {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_event_layout_is_stable() {
        // The perf ring carries these records verbatim; any change here is
        // an ABI break against the bundled kernel artifacts.
        assert_eq!(core::mem::size_of::<RawSyscallEvent>(), 440);
        assert_eq!(core::mem::align_of::<RawSyscallEvent>(), 8);
    }

    #[test]
    fn schema_layout_is_stable() {
        assert_eq!(core::mem::size_of::<SyscallSchema>(), 728);
        assert_eq!(core::mem::align_of::<SyscallSchema>(), 4);
    }

    #[test]
    fn string_tags_reserve_a_sixth_of_the_payload() {
        assert_eq!(STRING_ARG_LEN, 21);
        assert_eq!(ArgTag::CharPtr.payload_len(), STRING_ARG_LEN);
        assert_eq!(ArgTag::Fd.payload_len(), STRING_ARG_LEN);
        assert_eq!(ArgTag::Long.payload_len(), 8);
        assert_eq!(ArgTag::Uint32.payload_len(), 4);
        assert_eq!(ArgTag::Unknown.payload_len(), 0);
    }

    #[test]
    fn comm_truncates_at_nul() {
        let mut event = RawSyscallEvent::zeroed();
        event.comm[..4].copy_from_slice(b"bash");
        assert_eq!(event.comm_bytes(), b"bash");
    }
}
