//! Probe loading and configuration.
//!
//! The probe ships as prebuilt BPF objects, one per supported kernel
//! range. The loader picks the newest artifact the running kernel can
//! take, loads it, fills the shared maps (run-state latch, PID filter,
//! syscall schemas), and attaches the two raw-syscall tracepoints.

use std::path::{Path, PathBuf};

use aya::maps::perf::PerfEventArrayBuffer;
use aya::maps::{Array, HashMap, MapData, PerfEventArray};
use aya::programs::TracePoint;
use aya::Ebpf;
use log::{debug, info};
use procmon_probe_abi::{SyscallSchema, MAX_PIDS, RUN_STATE_RUNNING};

use crate::error::ProbeError;
use crate::schema::SyscallTable;

struct KernelArtifact {
    min_release: (u64, u64),
    file_name: &'static str,
}

/// Bundled probe objects, oldest kernel first. The 4.17 build predates
/// BTF-enabled helpers; the 5.8 build assumes them.
const BUNDLED_ARTIFACTS: &[KernelArtifact] = &[
    KernelArtifact {
        min_release: (4, 17),
        file_name: "procmon_probe_4.17.o",
    },
    KernelArtifact {
        min_release: (5, 8),
        file_name: "procmon_probe_5.8.o",
    },
];

const SYSTEM_PROBE_DIR: &str = "/usr/lib/procmon";

pub struct ProbeHandle {
    ebpf: Ebpf,
}

impl ProbeHandle {
    /// Selects and loads the kernel artifact for the running kernel.
    pub fn load() -> Result<Self, ProbeError> {
        let release = kernel_release()?;
        let version = parse_release(&release);
        let artifact = select_artifact(version)
            .ok_or_else(|| ProbeError::NoArtifactForKernel(release.clone()))?;
        let path = find_artifact(artifact.file_name)
            .ok_or_else(|| ProbeError::NoArtifactForKernel(release.clone()))?;
        info!(
            "kernel {release}: loading probe artifact {}",
            path.display()
        );

        let data = std::fs::read(&path)?;
        let ebpf = Ebpf::load(&data).map_err(|source| ProbeError::Load { path, source })?;
        Ok(ProbeHandle { ebpf })
    }

    /// Populates the shared maps before attachment: latch to RUNNING and
    /// one schema record per selected syscall. The PID filter is written
    /// through the engine, which owns that map for runtime updates.
    pub fn configure(
        &mut self,
        table: &SyscallTable,
        events: &[String],
    ) -> Result<(), ProbeError> {
        let mut run_state: Array<_, u32> = Array::try_from(
            self.ebpf
                .map_mut("RUN_STATE")
                .ok_or(ProbeError::MissingObject("RUN_STATE"))?,
        )?;
        run_state.set(0, RUN_STATE_RUNNING, 0)?;

        let mut schemas: HashMap<_, u32, SyscallSchema> = HashMap::try_from(
            self.ebpf
                .map_mut("SYSCALL_SCHEMAS")
                .ok_or(ProbeError::MissingObject("SYSCALL_SCHEMAS"))?,
        )?;
        let mut installed = 0usize;
        for name in events {
            let Some(nr) = table.number_for_name(name) else {
                continue;
            };
            if let Some(schema) = table.schema_for_number(nr) {
                schemas.insert(nr, *schema, 0)?;
                installed += 1;
            }
        }
        debug!("installed {installed} syscall schemas into the probe");
        Ok(())
    }

    pub fn attach(&mut self) -> Result<(), ProbeError> {
        for (program_name, tracepoint) in
            [("procmon_enter", "sys_enter"), ("procmon_exit", "sys_exit")]
        {
            let program: &mut TracePoint = self
                .ebpf
                .program_mut(program_name)
                .ok_or(ProbeError::MissingObject("tracepoint program"))?
                .try_into()?;
            program.load()?;
            program.attach("raw_syscalls", tracepoint)?;
        }
        Ok(())
    }

    /// Opens one perf ring buffer per online CPU.
    pub fn open_perf_buffers(
        &mut self,
    ) -> Result<Vec<PerfEventArrayBuffer<MapData>>, ProbeError> {
        let mut events: PerfEventArray<MapData> = PerfEventArray::try_from(
            self.ebpf
                .take_map("EVENTS")
                .ok_or(ProbeError::MissingObject("EVENTS"))?,
        )?;
        let cpus = aya::util::online_cpus().map_err(|(_, err)| ProbeError::Io(err))?;
        let mut buffers = Vec::with_capacity(cpus.len());
        for cpu in cpus {
            buffers.push(events.open(cpu, Some(64))?);
        }
        Ok(buffers)
    }

    /// Hands the run-state latch map to the engine for runtime writes.
    pub fn take_run_state_map(&mut self) -> Result<Array<MapData, u32>, ProbeError> {
        Ok(Array::try_from(
            self.ebpf
                .take_map("RUN_STATE")
                .ok_or(ProbeError::MissingObject("RUN_STATE"))?,
        )?)
    }

    pub fn take_pid_filter_map(&mut self) -> Result<Array<MapData, i32>, ProbeError> {
        Ok(Array::try_from(
            self.ebpf
                .take_map("PID_FILTER")
                .ok_or(ProbeError::MissingObject("PID_FILTER"))?,
        )?)
    }

    pub fn into_ebpf(self) -> Ebpf {
        self.ebpf
    }
}

/// Writes the pid list into the filter slots, terminated (and padded)
/// with the -1 sentinel the probe stops at.
pub fn write_pid_slots<T: std::borrow::BorrowMut<MapData>>(
    map: &mut Array<T, i32>,
    pids: &[i32],
) -> Result<(), ProbeError> {
    for slot in 0..MAX_PIDS {
        let value = pids.get(slot).copied().unwrap_or(-1);
        map.set(slot as u32, value, 0)?;
    }
    Ok(())
}

fn kernel_release() -> Result<String, ProbeError> {
    Ok(uname::uname()?.release)
}

/// `"6.8.0-41-generic"` -> `(6, 8)`.
fn parse_release(release: &str) -> (u64, u64) {
    let mut parts = release.split(['.', '-']);
    let major = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    (major, minor)
}

fn select_artifact(version: (u64, u64)) -> Option<&'static KernelArtifact> {
    BUNDLED_ARTIFACTS
        .iter()
        .filter(|artifact| artifact.min_release <= version)
        .max_by_key(|artifact| artifact.min_release)
}

/// Looks for a bundled artifact next to the executable, in the override
/// directory, or in the system location.
fn find_artifact(file_name: &str) -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Ok(dir) = std::env::var("PROCMON_PROBE_DIR") {
        candidates.push(PathBuf::from(dir));
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            candidates.push(dir.to_path_buf());
        }
    }
    candidates.push(PathBuf::from(SYSTEM_PROBE_DIR));

    candidates
        .into_iter()
        .map(|dir| dir.join(file_name))
        .find(|path| Path::new(path).is_file())
}
