//! Tracer engine: owns the probe, the hand-off queue, and the poller and
//! consumer threads.
//!
//! Shutdown protocol: the latch goes to STOP (the probe emits nothing
//! new), the queue is cancelled (the consumer wakes immediately), and
//! both threads are joined. The consumer drains the queue on its way out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use aya::maps::{Array, MapData};
use aya::Ebpf;
use log::warn;
use parking_lot::Mutex;
use procmon_probe_abi::RawSyscallEvent;

use crate::config::ProcmonConfig;
use crate::error::ProbeError;
use crate::schema::SyscallTable;
use crate::storage::StorageEngine;
use crate::tracer::consumer::Consumer;
use crate::tracer::poller::Poller;
use crate::tracer::probe::{write_pid_slots, ProbeHandle};
use crate::tracer::queue::CancellableEventQueue;
use crate::tracer::{RunState, RunStateLatch};

/// Hand-off queue bound; sized for a few perf-callback batches.
const QUEUE_CAPACITY: usize = 4096;

pub struct TracerEngine {
    run_state: Arc<RunStateLatch>,
    queue: Arc<CancellableEventQueue<RawSyscallEvent>>,
    run_state_map: Mutex<Array<MapData, u32>>,
    pid_filter_map: Mutex<Array<MapData, i32>>,
    poller: Option<JoinHandle<()>>,
    consumer: Option<JoinHandle<()>>,
    ring_lost: Arc<AtomicU64>,
    // Dropping the Ebpf object detaches the tracepoints; it lives as
    // long as the engine does.
    _ebpf: Ebpf,
}

impl TracerEngine {
    pub fn new(
        config: &ProcmonConfig,
        table: Arc<SyscallTable>,
        storage: Arc<dyn StorageEngine>,
    ) -> Result<Self, ProbeError> {
        let mut probe = ProbeHandle::load()?;
        probe.configure(&table, &config.events)?;

        let buffers = probe.open_perf_buffers()?;
        let run_state_map = probe.take_run_state_map()?;
        let mut pid_filter_map = probe.take_pid_filter_map()?;
        write_pid_slots(&mut pid_filter_map, &config.pids)?;

        let queue = Arc::new(CancellableEventQueue::new(QUEUE_CAPACITY));
        let run_state = Arc::new(RunStateLatch::new());
        let ring_lost = Arc::new(AtomicU64::new(0));
        let (probe_ready_tx, probe_ready_rx) = crossbeam_channel::bounded(1);

        let consumer = Consumer::new(
            queue.clone(),
            storage,
            table,
            run_state.clone(),
            probe_ready_rx,
        );
        let consumer_handle = std::thread::Builder::new()
            .name("procmon-consumer".into())
            .spawn(move || consumer.run())?;

        let poller = Poller::new(buffers, queue.clone(), ring_lost.clone());
        let poller_handle = std::thread::Builder::new()
            .name("procmon-poller".into())
            .spawn(move || poller.run())?;

        if let Err(err) = probe.attach() {
            // Unwind the half-started pipeline: dropping the ready sender
            // releases the consumer, cancellation releases the poller.
            drop(probe_ready_tx);
            queue.cancel();
            let _ = consumer_handle.join();
            let _ = poller_handle.join();
            return Err(err);
        }
        let _ = probe_ready_tx.send(());

        Ok(TracerEngine {
            run_state,
            queue,
            run_state_map: Mutex::new(run_state_map),
            pid_filter_map: Mutex::new(pid_filter_map),
            poller: Some(poller_handle),
            consumer: Some(consumer_handle),
            ring_lost,
            _ebpf: probe.into_ebpf(),
        })
    }

    pub fn run_state(&self) -> RunState {
        self.run_state.get()
    }

    /// Latch write plus kernel-map mirror. Never blocks the caller beyond
    /// the map update.
    pub fn set_run_state(&self, state: RunState) {
        self.run_state.set(state);
        if let Err(err) = self.run_state_map.lock().set(0, state.as_u32(), 0) {
            warn!("failed to mirror run state into the probe: {err}");
        }
    }

    /// Replaces the kernel-side PID filter.
    pub fn set_pids(&self, pids: &[i32]) -> Result<(), ProbeError> {
        write_pid_slots(&mut self.pid_filter_map.lock(), pids)
    }

    /// Events lost to ring overruns plus hand-off queue overflow.
    pub fn lost_records(&self) -> u64 {
        self.ring_lost.load(Ordering::Relaxed) + self.queue.dropped()
    }

    pub fn shutdown(mut self) {
        self.shutdown_impl();
    }

    fn shutdown_impl(&mut self) {
        self.set_run_state(RunState::Stop);
        self.queue.cancel();
        if let Some(handle) = self.consumer.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.poller.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TracerEngine {
    fn drop(&mut self) {
        self.shutdown_impl();
    }
}
