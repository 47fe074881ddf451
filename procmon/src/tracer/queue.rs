//! Single-producer/single-consumer hand-off queue with external
//! cancellation.
//!
//! Two sub-queues bound cross-thread contention: the producer only ever
//! touches the write queue, the consumer drains the read queue and swaps
//! the two when it runs dry. Cancellation wakes a blocked consumer and
//! makes every subsequent pop return [`PopResult::Cancelled`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(Debug, PartialEq, Eq)]
pub enum PopResult<T> {
    Value(T),
    Cancelled,
    TimedOut,
}

pub struct CancellableEventQueue<T> {
    write_queue: Mutex<VecDeque<T>>,
    read_queue: Mutex<VecDeque<T>>,
    available: Condvar,
    cancelled: AtomicBool,
    capacity: usize,
    dropped: AtomicU64,
}

impl<T> CancellableEventQueue<T> {
    /// `capacity` bounds the write side; a full queue drops new records
    /// rather than blocking the producer.
    pub fn new(capacity: usize) -> Self {
        CancellableEventQueue {
            write_queue: Mutex::new(VecDeque::new()),
            read_queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            cancelled: AtomicBool::new(false),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Never blocks. Returns false when the record was dropped because
    /// the queue is full.
    pub fn push(&self, value: T) -> bool {
        {
            let mut write = self.write_queue.lock();
            if write.len() >= self.capacity {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            write.push_back(value);
        }
        self.available.notify_all();
        true
    }

    /// Blocks until a record is available, the queue is cancelled, or the
    /// timeout elapses.
    pub fn pop_timeout(&self, timeout: Duration) -> PopResult<T> {
        let mut read = self.read_queue.lock();
        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                return PopResult::Cancelled;
            }
            if let Some(value) = read.pop_front() {
                return PopResult::Value(value);
            }
            {
                let mut write = self.write_queue.lock();
                if !write.is_empty() {
                    std::mem::swap(&mut *read, &mut *write);
                    continue;
                }
            }
            if self.available.wait_for(&mut read, timeout).timed_out() {
                // One last look: the producer may have pushed between the
                // wait expiring and us re-taking the lock.
                if self.cancelled.load(Ordering::SeqCst) {
                    return PopResult::Cancelled;
                }
                let mut write = self.write_queue.lock();
                if write.is_empty() {
                    return PopResult::TimedOut;
                }
                std::mem::swap(&mut *read, &mut *write);
            }
        }
    }

    /// Idempotent. Wakes any blocked consumer.
    pub fn cancel(&self) {
        let _read = self.read_queue.lock();
        self.cancelled.store(true, Ordering::SeqCst);
        self.available.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Removes everything still queued, regardless of cancellation.
    /// The shutdown path uses this to drain records that arrived before
    /// the probe stopped emitting.
    pub fn drain(&self) -> Vec<T> {
        let mut read = self.read_queue.lock();
        let mut write = self.write_queue.lock();
        read.extend(write.drain(..));
        read.drain(..).collect()
    }

    /// Records dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
