use std::fmt;

/// The bring-up step that failed while preparing a base VM for a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BringUpStep {
    Resume,
    ReseedRng,
    SyncTime,
    AddCpus,
    AddMemory,
    OnlineCpuMemory,
}

impl fmt::Display for BringUpStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resume => f.write_str("resume"),
            Self::ReseedRng => f.write_str("reseed rng"),
            Self::SyncTime => f.write_str("sync time"),
            Self::AddCpus => f.write_str("add cpus"),
            Self::AddMemory => f.write_str("add memory"),
            Self::OnlineCpuMemory => f.write_str("online cpu/memory"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("backend not available: {0}")]
    BackendNotAvailable(String),

    #[error("vm operation failed: {0}")]
    Vm(String),

    #[error("{step} failed: {source}")]
    BringUp {
        step: BringUpStep,
        #[source]
        source: Box<SandboxError>,
    },

    #[error("remote cache: {0}")]
    Remote(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("factory closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SandboxError>;
