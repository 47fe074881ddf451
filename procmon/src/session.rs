//! A session owns the store and (for live captures) the tracer engine.
//! The display drivers borrow the session; nothing holds a reference
//! back into them.

use std::sync::Arc;

use crate::config::ProcmonConfig;
use crate::error::{ProcmonError, StorageError};
use crate::schema::SyscallTable;
use crate::storage::StorageEngine;
use crate::tracer::{RunState, TracerEngine};

pub struct Session {
    config: ProcmonConfig,
    storage: Arc<dyn StorageEngine>,
    tracer: Option<TracerEngine>,
    syscall_universe_len: usize,
}

impl Session {
    /// Starts a live capture: arms the store and brings up the probe.
    pub fn start_capture(
        config: ProcmonConfig,
        storage: Arc<dyn StorageEngine>,
        table: Arc<SyscallTable>,
    ) -> Result<Self, ProcmonError> {
        storage.initialize(&config.events)?;
        let tracer = TracerEngine::new(&config, table.clone(), storage.clone())?;
        Ok(Session {
            config,
            storage,
            tracer: Some(tracer),
            syscall_universe_len: table.len(),
        })
    }

    /// Opens a previously captured trace read-only. Re-anchors the
    /// session start time from the snapshot metadata.
    pub fn open_snapshot(
        mut config: ProcmonConfig,
        storage: Arc<dyn StorageEngine>,
        table: Arc<SyscallTable>,
    ) -> Result<Self, ProcmonError> {
        storage.initialize(&config.events)?;
        let path = config
            .trace_file
            .clone()
            .expect("snapshot sessions require a trace file");
        let (start_time_ns, start_time_wall) = storage.load(&path)?;
        config.set_start_time(start_time_ns, start_time_wall);
        Ok(Session {
            config,
            storage,
            tracer: None,
            syscall_universe_len: table.len(),
        })
    }

    pub fn config(&self) -> &ProcmonConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn StorageEngine> {
        &self.storage
    }

    pub fn syscall_universe_len(&self) -> usize {
        self.syscall_universe_len
    }

    pub fn suspend(&self) {
        if let Some(tracer) = &self.tracer {
            tracer.set_run_state(RunState::Suspended);
        }
    }

    pub fn resume(&self) {
        if let Some(tracer) = &self.tracer {
            tracer.set_run_state(RunState::Running);
        }
    }

    pub fn lost_records(&self) -> u64 {
        self.tracer.as_ref().map_or(0, TracerEngine::lost_records)
    }

    /// Snapshots the store to the configured output path.
    pub fn export(&self) -> Result<(), StorageError> {
        self.storage.export(
            self.config.start_time_ns,
            &self.config.start_time_wall,
            &self.config.output_trace_path,
        )
    }

    /// Stops the probe, drains the pipeline, and joins the worker
    /// threads. The store then holds everything the probe delivered.
    pub fn stop(&mut self) {
        if let Some(tracer) = self.tracer.take() {
            tracer.shutdown();
        }
    }
}
