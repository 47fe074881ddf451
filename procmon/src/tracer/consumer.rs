//! Hand-off queue consumer.
//!
//! Waits for the probe to come up, then pops raw records, translates them
//! into telemetry rows, and flushes them to the store in batches. The
//! run-state latch is examined between pops; STOP breaks out, SUSPENDED
//! idles. On break-out the queue is drained so nothing the probe already
//! delivered is lost.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;
use log::{debug, warn};
use memchr::memchr;
use procmon_probe_abi::RawSyscallEvent;

use crate::schema::SyscallTable;
use crate::stack_trace::StackTrace;
use crate::storage::{StorageEngine, TelemetryRow};
use crate::tracer::queue::{CancellableEventQueue, PopResult};
use crate::tracer::{RunState, RunStateLatch};

const BATCH_SIZE: usize = 50;
const POP_TIMEOUT: Duration = Duration::from_millis(100);
const IDLE_SLEEP: Duration = Duration::from_millis(10);

pub struct Consumer {
    queue: Arc<CancellableEventQueue<RawSyscallEvent>>,
    storage: Arc<dyn StorageEngine>,
    table: Arc<SyscallTable>,
    run_state: Arc<RunStateLatch>,
    probe_ready: Receiver<()>,
}

impl Consumer {
    pub fn new(
        queue: Arc<CancellableEventQueue<RawSyscallEvent>>,
        storage: Arc<dyn StorageEngine>,
        table: Arc<SyscallTable>,
        run_state: Arc<RunStateLatch>,
        probe_ready: Receiver<()>,
    ) -> Self {
        Consumer {
            queue,
            storage,
            table,
            run_state,
            probe_ready,
        }
    }

    pub fn run(self) {
        // A closed channel means the loader failed before attaching.
        if self.probe_ready.recv().is_err() {
            return;
        }

        let mut batch: Vec<TelemetryRow> = Vec::with_capacity(BATCH_SIZE);
        loop {
            match self.run_state.get() {
                RunState::Stop => break,
                RunState::Suspended => {
                    self.flush(&mut batch);
                    std::thread::sleep(IDLE_SLEEP);
                    continue;
                }
                RunState::Running => {}
            }

            match self.queue.pop_timeout(POP_TIMEOUT) {
                PopResult::Cancelled => break,
                PopResult::TimedOut => {
                    self.flush(&mut batch);
                    std::thread::sleep(IDLE_SLEEP);
                }
                PopResult::Value(event) => {
                    if let Some(row) = self.translate(&event) {
                        batch.push(row);
                    }
                    if batch.len() >= BATCH_SIZE {
                        self.flush(&mut batch);
                    }
                }
            }
        }

        // The probe has stopped emitting; whatever is still queued was
        // delivered before shutdown and belongs in the store.
        for event in self.queue.drain() {
            if let Some(row) = self.translate(&event) {
                batch.push(row);
            }
            if batch.len() >= BATCH_SIZE {
                self.flush(&mut batch);
            }
        }
        self.flush(&mut batch);
        debug!("consumer exiting");
    }

    fn translate(&self, event: &RawSyscallEvent) -> Option<TelemetryRow> {
        let Some(syscall) = self.table.name_for_number(event.sysnum) else {
            // The probe only emits schema-backed syscalls; a number we
            // cannot name is an invariant violation. Drop the event.
            warn!("dropping event with unknown syscall number {}", event.sysnum);
            return None;
        };

        let comm_len = memchr(0, &event.comm).unwrap_or(event.comm.len());
        let comm = String::from_utf8_lossy(&event.comm[..comm_len]).into_owned();

        Some(TelemetryRow {
            pid: event.pid as i32,
            stack: StackTrace::from_raw(&event.user_stack, event.user_stack_count),
            process_name: comm.clone(),
            comm,
            syscall: syscall.to_string(),
            // The raw return is a u64; reinterpreting it as two's
            // complement is exactly the sign extension the errno
            // convention expects.
            result: event.ret as i64,
            duration_ns: event.duration_ns,
            timestamp_ns: event.timestamp_ns,
            arguments: event.buffer,
        })
    }

    fn flush(&self, batch: &mut Vec<TelemetryRow>) {
        if batch.is_empty() {
            return;
        }
        if let Err(err) = self.storage.store_many(std::mem::take(batch)) {
            warn!("dropping batch of rows: {err}");
        }
    }
}
