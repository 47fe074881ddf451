//! Perf ring poller.
//!
//! One dedicated thread polls the per-CPU ring buffer fds and forwards
//! every delivered record to the hand-off queue with a single `push`.
//! Ring overruns are counted, never propagated.

use std::io;
use std::mem;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use aya::maps::perf::PerfEventArrayBuffer;
use aya::maps::MapData;
use bytes::BytesMut;
use log::{debug, warn};
use procmon_probe_abi::RawSyscallEvent;

use crate::tracer::queue::CancellableEventQueue;

const POLL_TIMEOUT_MS: i32 = 500;

/// Records read per ring per wakeup; matches the queue's one-batch bound.
const READ_CHUNK: usize = 32;

pub struct Poller {
    buffers: Vec<PerfEventArrayBuffer<MapData>>,
    queue: Arc<CancellableEventQueue<RawSyscallEvent>>,
    lost: Arc<AtomicU64>,
}

impl Poller {
    pub fn new(
        buffers: Vec<PerfEventArrayBuffer<MapData>>,
        queue: Arc<CancellableEventQueue<RawSyscallEvent>>,
        lost: Arc<AtomicU64>,
    ) -> Self {
        Poller {
            buffers,
            queue,
            lost,
        }
    }

    pub fn run(mut self) {
        let mut read_bufs: Vec<BytesMut> = (0..READ_CHUNK)
            .map(|_| BytesMut::with_capacity(mem::size_of::<RawSyscallEvent>()))
            .collect();
        let mut poll_fds: Vec<libc::pollfd> = self
            .buffers
            .iter()
            .map(|buffer| libc::pollfd {
                fd: buffer.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();

        loop {
            if self.queue.is_cancelled() {
                break;
            }

            let rc = unsafe {
                libc::poll(poll_fds.as_mut_ptr(), poll_fds.len() as _, POLL_TIMEOUT_MS)
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!("perf poll failed: {err}");
                break;
            }
            if rc == 0 {
                continue;
            }

            for (buffer, poll_fd) in self.buffers.iter_mut().zip(poll_fds.iter()) {
                if poll_fd.revents & libc::POLLIN == 0 {
                    continue;
                }
                loop {
                    let events = match buffer.read_events(&mut read_bufs) {
                        Ok(events) => events,
                        Err(err) => {
                            warn!("perf read failed: {err}");
                            break;
                        }
                    };
                    if events.lost > 0 {
                        self.lost.fetch_add(events.lost as u64, Ordering::Relaxed);
                    }
                    for buf in read_bufs.iter().take(events.read) {
                        match parse_record(buf) {
                            Some(event) => {
                                self.queue.push(event);
                            }
                            None => {
                                self.lost.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                    if events.read < read_bufs.len() {
                        break;
                    }
                }
            }
        }

        debug!("poller exiting; ring closed");
    }
}

/// The payload after the perf header must hold exactly one raw event;
/// anything shorter is a truncated delivery and counts as a loss.
fn parse_record(buf: &BytesMut) -> Option<RawSyscallEvent> {
    if buf.len() < mem::size_of::<RawSyscallEvent>() {
        return None;
    }
    Some(unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const RawSyscallEvent) })
}
