use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type. Everything surfaced to the operator funnels
/// through here; per-event losses are counted inside the pipeline instead.
#[derive(Debug, Error)]
pub enum ProcmonError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Probe(#[from] ProbeError),

    #[error("{0}")]
    Storage(#[from] StorageError),
}

/// Invalid CLI input or an unusable environment. Always fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid pid '{0}'")]
    InvalidPid(String),

    #[error("at most {max} pids can be traced, got {got}")]
    TooManyPids { max: usize, got: usize },

    #[error("invalid syscall '{0}'")]
    UnknownSyscall(String),

    #[error("trace file {} does not exist", .0.display())]
    MissingTraceFile(PathBuf),

    #[error("cannot open a trace file in headless mode")]
    TraceFileInHeadlessMode,

    #[error("could not read syscall metadata from {}: {source}", .path.display())]
    SchemaUnavailable {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// The host cannot run the kernel probe, or the probe failed mid-flight.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("no bundled kernel artifact supports kernel {0}")]
    NoArtifactForKernel(String),

    #[error("failed to load kernel artifact {}: {source}", .path.display())]
    Load {
        path: PathBuf,
        source: aya::EbpfError,
    },

    #[error("kernel artifact is missing object '{0}'")]
    MissingObject(&'static str),

    #[error("probe map error: {0}")]
    Map(#[from] aya::maps::MapError),

    #[error("probe program error: {0}")]
    Program(#[from] aya::programs::ProgramError),

    #[error("perf ring error: {0}")]
    PerfRing(#[from] aya::maps::perf::PerfBufferError),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// Event store failures. Export failures leave the session running;
/// restore failures abort it.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage engine must be initialized first")]
    NotInitialized,

    #[error("storage engine is already initialized")]
    AlreadyInitialized,

    #[error("failed to write trace file {}: {source}", .path.display())]
    Export {
        path: PathBuf,
        source: rusqlite::Error,
    },

    #[error("failed to open trace file {}: {source}", .path.display())]
    Restore {
        path: PathBuf,
        source: rusqlite::Error,
    },

    #[error("trace file {} has no metadata record", .0.display())]
    MissingMetadata(PathBuf),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}
