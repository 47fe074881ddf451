//! Kernel probe: raw syscall enter/exit tracepoints.
//!
//! The enter program captures the arguments of a filtered syscall into a
//! per-CPU scratch record and parks it in the pending-entries table keyed
//! by pid_tgid. The exit program picks the record back up, stamps duration
//! and return value, and submits it to the perf ring. Userspace populates
//! the run-state latch, the PID filter, and the schema map before the
//! programs are attached.

#![no_std]
#![no_main]

use aya_ebpf::helpers::{bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_ktime_get_ns};
use aya_ebpf::helpers::gen::bpf_get_stack;
use aya_ebpf::macros::{map, tracepoint};
use aya_ebpf::maps::{Array, HashMap, PerCpuArray, PerfEventArray};
use aya_ebpf::programs::TracePointContext;
use aya_ebpf::EbpfContext;

use procmon_probe_abi::{
    ArgTag, RawSyscallEvent, SyscallSchema, COMM_LEN, MAX_ARGS, MAX_BUFFER, MAX_PENDING_EVENTS,
    MAX_PIDS, MAX_STACK_FRAMES, MAX_SYSCALLS, RUN_STATE_RUNNING, SELF_COMM, STRING_ARG_LEN,
};

// Offsets within tracepoint:raw_syscalls:sys_enter / sys_exit, from the
// format descriptors: the common header is 8 bytes, `id` is a long at
// offset 8, followed by `args[6]` (enter) or `ret` (exit) at offset 16.
const TP_OFFSET_ID: usize = 8;
const TP_OFFSET_ARGS: usize = 16;
const TP_OFFSET_RET: usize = 16;

const BPF_F_USER_STACK: u64 = 256;

#[map]
static RUN_STATE: Array<u32> = Array::with_max_entries(1, 0);

#[map]
static PID_FILTER: Array<i32> = Array::with_max_entries(MAX_PIDS as u32, 0);

#[map]
static SYSCALL_SCHEMAS: HashMap<u32, SyscallSchema> =
    HashMap::with_max_entries(MAX_SYSCALLS, 0);

#[map]
static PENDING_EVENTS: HashMap<u64, RawSyscallEvent> =
    HashMap::with_max_entries(MAX_PENDING_EVENTS, 0);

#[map]
static SCRATCH: PerCpuArray<RawSyscallEvent> = PerCpuArray::with_max_entries(1, 0);

#[map]
static EVENTS: PerfEventArray<RawSyscallEvent> = PerfEventArray::new(0);

#[tracepoint]
pub fn procmon_enter(ctx: TracePointContext) -> u32 {
    match try_enter(&ctx) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

#[tracepoint]
pub fn procmon_exit(ctx: TracePointContext) -> u32 {
    match try_exit(&ctx) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

/// Command name of the current task, or an error if the helper fails.
fn current_comm() -> Result<[u8; COMM_LEN], i64> {
    bpf_get_current_comm().map_err(|e| e as i64)
}

/// The tracer must never trace itself; a probe firing on procmon's own
/// syscalls would feed back into the pipeline it is filling.
fn is_self(comm: &[u8; COMM_LEN]) -> bool {
    let mut i = 0;
    while i < SELF_COMM.len() {
        if comm[i] == 0 || comm[i] != SELF_COMM[i] {
            return false;
        }
        i += 1;
    }
    true
}

fn is_running() -> bool {
    // A missing slot means userspace has not armed the latch yet; keep
    // tracing rather than silently dropping everything.
    match RUN_STATE.get(0) {
        Some(state) => *state == RUN_STATE_RUNNING,
        None => true,
    }
}

/// PID filter: slot 0 holding -1 means "match all"; otherwise the pid must
/// equal an occupied slot before the first -1 sentinel.
fn pid_filter_match(pid: u32) -> bool {
    match PID_FILTER.get(0) {
        Some(first) if *first == -1 => return true,
        None => return true,
        _ => {}
    }
    let mut i = 0;
    while i < MAX_PIDS as u32 {
        match PID_FILTER.get(i) {
            Some(slot) => {
                if *slot == -1 {
                    break;
                }
                if *slot == pid as i32 {
                    return true;
                }
            }
            None => break,
        }
        i += 1;
    }
    false
}

fn passes_filters(pid: u32) -> Result<bool, i64> {
    if is_self(&current_comm()?) {
        return Ok(false);
    }
    if !is_running() {
        return Ok(false);
    }
    Ok(pid_filter_match(pid))
}

/// Append one argument to the payload at the running offset. Returns the
/// new offset, or Err to stop the walk (overflow or an UNKNOWN tag).
fn capture_arg(
    tag: ArgTag,
    arg: u64,
    event: &mut RawSyscallEvent,
    offset: usize,
) -> Result<usize, ()> {
    let len = tag.payload_len();
    if len == 0 || offset + len > MAX_BUFFER {
        return Err(());
    }

    if tag.is_string() {
        // Fd arguments carry a file descriptor number, not a user pointer;
        // the path lookup happens in userspace. Store the raw value as a
        // decimal-free byte copy would be useless, so leave the reserved
        // slot zeroed for Fd and read user memory for the char pointers.
        if matches!(tag, ArgTag::CharPtr | ArgTag::ConstCharPtr) && arg != 0 {
            let dst = &mut event.buffer[offset..offset + STRING_ARG_LEN];
            let res = unsafe {
                aya_ebpf::helpers::gen::bpf_probe_read_user_str(
                    dst.as_mut_ptr() as *mut core::ffi::c_void,
                    STRING_ARG_LEN as u32,
                    arg as *const core::ffi::c_void,
                )
            };
            if res < 0 {
                return Err(());
            }
        }
    } else {
        let bytes = arg.to_ne_bytes();
        let mut i = 0;
        while i < len {
            event.buffer[offset + i] = bytes[i];
            i += 1;
        }
    }

    Ok(offset + len)
}

fn try_enter(ctx: &TracePointContext) -> Result<(), i64> {
    let pid_tgid = bpf_get_current_pid_tgid();
    let pid = (pid_tgid >> 32) as u32;

    if !passes_filters(pid)? {
        return Ok(());
    }

    let sysnum: i64 = unsafe { ctx.read_at(TP_OFFSET_ID) }?;
    let sysnum = sysnum as u32;

    // No schema entry means this syscall was not selected; emit nothing.
    let schema = match unsafe { SYSCALL_SCHEMAS.get(&sysnum) } {
        Some(schema) => schema,
        None => return Ok(()),
    };

    let event = match SCRATCH.get_ptr_mut(0) {
        Some(event) => unsafe { &mut *event },
        None => return Err(1),
    };

    event.pid = pid;
    event.sysnum = sysnum;
    event.timestamp_ns = unsafe { bpf_ktime_get_ns() };
    event.duration_ns = 0;
    event.ret = 0;
    event.comm = current_comm()?;
    event.buffer = [0; MAX_BUFFER];

    let stack_bytes = unsafe {
        bpf_get_stack(
            ctx.as_ptr(),
            event.user_stack.as_mut_ptr() as *mut core::ffi::c_void,
            (MAX_STACK_FRAMES * core::mem::size_of::<u64>()) as u32,
            BPF_F_USER_STACK,
        )
    };
    event.user_stack_count = if stack_bytes > 0 {
        stack_bytes as u64 / core::mem::size_of::<u64>() as u64
    } else {
        0
    };

    let args: [u64; MAX_ARGS] = unsafe { ctx.read_at(TP_OFFSET_ARGS) }?;
    let mut offset = 0;
    let mut i = 0;
    while i < MAX_ARGS {
        if i >= schema.used_arg_count as usize {
            break;
        }
        match capture_arg(schema.arg_tags[i], args[i], event, offset) {
            Ok(next) => offset = next,
            Err(()) => break,
        }
        i += 1;
    }

    PENDING_EVENTS
        .insert(&pid_tgid, event, 0)
        .map_err(|e| e as i64)?;
    Ok(())
}

fn try_exit(ctx: &TracePointContext) -> Result<(), i64> {
    let pid_tgid = bpf_get_current_pid_tgid();
    let pid = (pid_tgid >> 32) as u32;

    if !passes_filters(pid)? {
        return Ok(());
    }

    // An exit without a pending entry was filtered at enter time; drop it.
    let event = match unsafe { PENDING_EVENTS.get(&pid_tgid) } {
        Some(event) => event,
        None => return Ok(()),
    };

    let ret: i64 = unsafe { ctx.read_at(TP_OFFSET_RET) }?;

    let scratch = match SCRATCH.get_ptr_mut(0) {
        Some(scratch) => unsafe { &mut *scratch },
        None => return Err(1),
    };
    *scratch = *event;
    scratch.ret = ret as u64;
    scratch.duration_ns = unsafe { bpf_ktime_get_ns() } - scratch.timestamp_ns;

    EVENTS.output(ctx, scratch, 0);

    // The pending slot is dead once submission was attempted, whether or
    // not the ring accepted the record.
    let _ = PENDING_EVENTS.remove(&pid_tgid);
    Ok(())
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
