//! Supervisor trait and status reporting

use crate::error::{Result, SupervisorError};
use crate::record::{ProcessRecord, ProcessStatus, ServiceType};
use crate::registry::RegistryView;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Free-form metadata attached to a process record
pub type Metadata = HashMap<String, serde_json::Value>;

/// Options for starting the registry
#[derive(Debug, Clone, Default)]
pub struct RegistryOptions {
    /// Defaults to the configured registry port
    pub port: Option<u16>,
    /// Defaults to the configured database path
    pub db_path: Option<String>,
    pub metadata: Metadata,
}

/// Options for restarting a process
#[derive(Debug, Clone)]
pub struct RestartOptions {
    /// Replacement argv
    pub command: Option<Vec<String>>,
    /// Entries merged into the existing metadata
    pub metadata: Option<Metadata>,
    /// Graceful stop budget before the old process is force-killed
    pub timeout: Duration,
}

impl Default for RestartOptions {
    fn default() -> Self {
        Self {
            command: None,
            metadata: None,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Everything known about one process, plus what the registry thinks of it
#[derive(Debug, Serialize)]
pub struct ProcessStatusReport {
    #[serde(flatten)]
    pub record: ProcessRecord,
    /// Whole seconds since start; `None` unless running
    pub uptime_secs: Option<u64>,
    /// Present for agents only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry: Option<RegistryView>,
}

/// Supervisor for locally executed agent and registry processes
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Start an agent from its source file
    async fn start_agent(&self, agent_file: &Path, metadata: Metadata) -> Result<ProcessRecord>;

    /// Start the registry service
    async fn start_registry(&self, options: RegistryOptions) -> Result<ProcessRecord>;

    /// Graceful stop, force-killing the group if it outlives `timeout`
    async fn stop(&self, name: &str, timeout: Duration) -> Result<()>;

    /// Immediate force-kill, waiting at most `timeout` for the exit to be confirmed
    async fn terminate(&self, name: &str, timeout: Duration) -> Result<()>;

    /// Stop if running, then respawn with the (possibly replaced) command
    async fn restart(&self, name: &str, options: RestartOptions) -> Result<ProcessRecord>;

    /// Status of one process
    async fn status(&self, name: &str) -> Result<ProcessStatusReport>;

    /// Snapshot of every tracked process, sorted by name
    async fn list(&self) -> Result<Vec<ProcessRecord>>;

    /// Stop tracking a process that is no longer running
    async fn remove(&self, name: &str) -> Result<bool>;

    /// Stop every running agent, then every running registry. Failures are
    /// collected rather than aborting the sweep.
    async fn stop_all(&self, timeout: Duration) -> Vec<SupervisorError> {
        let records = match self.list().await {
            Ok(records) => records,
            Err(e) => return vec![e],
        };

        let running = |kind: ServiceType| {
            records
                .iter()
                .filter(move |r| {
                    r.service_type == kind && r.status == ProcessStatus::Running && r.pid.is_some()
                })
                .map(|r| r.name.clone())
                .collect::<Vec<_>>()
        };
        let order: Vec<String> = running(ServiceType::Agent)
            .into_iter()
            .chain(running(ServiceType::Registry))
            .collect();

        info!("Stopping {} processes", order.len());
        let mut errors = Vec::new();
        for name in order {
            if let Err(e) = self.stop(&name, timeout).await {
                warn!("Failed to stop {}: {}", name, e);
                errors.push(e);
            }
        }
        errors
    }
}
