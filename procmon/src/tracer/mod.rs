pub mod consumer;
pub mod engine;
pub mod poller;
pub mod probe;
pub mod queue;

pub use engine::TracerEngine;

use std::sync::atomic::{AtomicU32, Ordering};

use procmon_probe_abi::{RUN_STATE_RUNNING, RUN_STATE_STOP, RUN_STATE_SUSPENDED};

/// Capture states. The latch is mirrored into the kernel-shared map so
/// the probe stops emitting without any cross-thread wake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Suspended,
    Stop,
}

impl RunState {
    pub fn as_u32(self) -> u32 {
        match self {
            RunState::Running => RUN_STATE_RUNNING,
            RunState::Suspended => RUN_STATE_SUSPENDED,
            RunState::Stop => RUN_STATE_STOP,
        }
    }

    pub fn from_u32(value: u32) -> RunState {
        match value {
            RUN_STATE_SUSPENDED => RunState::Suspended,
            RUN_STATE_STOP => RunState::Stop,
            _ => RunState::Running,
        }
    }
}

/// The userspace half of the run-state latch: one writer (the UI), two
/// polling readers (probe via the mirrored map, consumer via this cell).
pub struct RunStateLatch(AtomicU32);

impl RunStateLatch {
    pub fn new() -> Self {
        RunStateLatch(AtomicU32::new(RUN_STATE_RUNNING))
    }

    pub fn get(&self) -> RunState {
        RunState::from_u32(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, state: RunState) {
        self.0.store(state.as_u32(), Ordering::SeqCst);
    }
}

impl Default for RunStateLatch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latch_round_trips_states() {
        let latch = RunStateLatch::new();
        assert_eq!(latch.get(), RunState::Running);
        latch.set(RunState::Suspended);
        assert_eq!(latch.get(), RunState::Suspended);
        latch.set(RunState::Stop);
        assert_eq!(latch.get(), RunState::Stop);
        assert_eq!(RunState::from_u32(1234), RunState::Running);
    }
}
