//! Error types for supervisor operations

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type for supervisor operations
pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Error types for supervisor
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("process {0} not found")]
    NotFound(String),

    #[error("process {0} already exists")]
    AlreadyExists(String),

    #[error("{name} process already running (PID: {pid})")]
    AlreadyRunning { name: String, pid: u32 },

    #[error("process {0} has no associated OS process")]
    NoProcess(String),

    #[error("agent file {} does not exist", .0.display())]
    AgentFileMissing(PathBuf),

    #[error(
        "registry binary not found at any of these locations: {}. \
         Please ensure the binary is built or run 'make build' to compile it",
        .0.join(", ")
    )]
    BinaryNotFound(Vec<String>),

    #[error("failed to spawn {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process {name} did not terminate within {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("registry at {url} did not become ready within {timeout:?}")]
    ReadinessTimeout { url: String, timeout: Duration },

    #[error("pre-restart check failed: {0}")]
    Validation(String),

    #[error("signal error: {0}")]
    Signal(String),

    #[error("registry request failed: {0}")]
    Registry(#[from] reqwest::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("state file error: {0}")]
    State(String),

    #[error("file watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<figment::Error> for SupervisorError {
    fn from(err: figment::Error) -> Self {
        SupervisorError::Configuration(err.to_string())
    }
}

#[cfg(unix)]
impl From<nix::errno::Errno> for SupervisorError {
    fn from(err: nix::errno::Errno) -> Self {
        SupervisorError::Signal(err.desc().to_string())
    }
}
