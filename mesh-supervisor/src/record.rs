//! Process records tracked by the supervisor

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::process::Child;

/// Kind of service a record supervises
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Agent,
    Registry,
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceType::Agent => write!(f, "agent"),
            ServiceType::Registry => write!(f, "registry"),
        }
    }
}

/// Lifecycle status of a supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Running,
    Stopped,
    Killed,
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessStatus::Running => write!(f, "running"),
            ProcessStatus::Stopped => write!(f, "stopped"),
            ProcessStatus::Killed => write!(f, "killed"),
        }
    }
}

/// Result of the most recent health evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheck {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
    Failed,
    Stopped,
    Killed,
}

/// Ownership of the live OS process behind a record
#[derive(Debug)]
pub enum ProcessHandle {
    /// Spawned by this invocation; we can wait on it directly
    Owned(Child),
    /// Found alive in the state file left by an earlier invocation
    Adopted(u32),
}

impl ProcessHandle {
    /// OS process id, `None` once an owned child has been reaped
    pub fn pid(&self) -> Option<u32> {
        match self {
            ProcessHandle::Owned(child) => child.id(),
            ProcessHandle::Adopted(pid) => Some(*pid),
        }
    }
}

/// One supervised process
#[derive(Debug, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub name: String,
    pub service_type: ServiceType,
    pub pid: Option<u32>,
    #[serde(skip)]
    pub handle: Option<ProcessHandle>,
    pub status: ProcessStatus,
    #[serde(default)]
    pub health_check: HealthCheck,
    /// Program followed by its arguments
    pub command: Vec<String>,
    pub working_dir: PathBuf,
    /// Variables layered on top of the inherited environment
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub registry_url: String,
    pub start_time: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub last_restart: Option<DateTime<Utc>>,
    pub restarts: u32,
    pub consecutive_fails: u32,
    #[serde(default = "default_auto_restart")]
    pub auto_restart: bool,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

fn default_auto_restart() -> bool {
    true
}

impl ProcessRecord {
    /// Whether a live OS process is attached
    pub fn is_running(&self) -> bool {
        self.status == ProcessStatus::Running && self.handle.is_some()
    }

    /// Detach the live process and record a terminal status
    pub fn mark_exited(&mut self, status: ProcessStatus, health: HealthCheck) {
        self.status = status;
        self.health_check = health;
        self.pid = None;
        self.handle = None;
    }

    /// Attach a freshly spawned process
    pub fn mark_started(&mut self, handle: ProcessHandle) {
        let now = Utc::now();
        self.pid = handle.pid();
        self.handle = Some(handle);
        self.status = ProcessStatus::Running;
        self.start_time = now;
        self.last_seen = now;
    }

    /// Copy of the record without the process handle
    pub fn snapshot(&self) -> ProcessRecord {
        ProcessRecord {
            name: self.name.clone(),
            service_type: self.service_type,
            pid: self.pid,
            handle: None,
            status: self.status,
            health_check: self.health_check,
            command: self.command.clone(),
            working_dir: self.working_dir.clone(),
            environment: self.environment.clone(),
            registry_url: self.registry_url.clone(),
            start_time: self.start_time,
            last_seen: self.last_seen,
            last_restart: self.last_restart,
            restarts: self.restarts,
            consecutive_fails: self.consecutive_fails,
            auto_restart: self.auto_restart,
            metadata: self.metadata.clone(),
        }
    }

    /// Agent source file recorded at start, if any
    pub fn agent_file(&self) -> Option<&str> {
        self.metadata.get("agent_file").and_then(|v| v.as_str())
    }
}
