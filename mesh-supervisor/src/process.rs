//! Process-based supervisor implementation

use crate::config::MeshConfig;
use crate::error::{Result, SupervisorError};
use crate::launch::{AgentLauncher, DefaultLauncher, LaunchCommand, find_registry_binary};
use crate::process_group::{ProcessGroupController, Termination, platform_controller};
use crate::record::{HealthCheck, ProcessHandle, ProcessRecord, ProcessStatus, ServiceType};
use crate::registry::RegistryClient;
use crate::store::ProcessStore;
use crate::supervisor::{
    Metadata, ProcessStatusReport, RegistryOptions, RestartOptions, Supervisor,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Name of the registry's process record
pub const REGISTRY_NAME: &str = "registry";

/// Upper bound on reaping a child after SIGKILL
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Supervisor that spawns local processes and mirrors them to the state file
pub struct ProcessSupervisor {
    store: Arc<Mutex<ProcessStore>>,
    config: MeshConfig,
    launcher: Arc<dyn AgentLauncher>,
    groups: Arc<dyn ProcessGroupController>,
    base_dir: PathBuf,
}

impl ProcessSupervisor {
    /// Load the persisted process table named by `config` and adopt whatever is still alive
    pub fn new(config: MeshConfig) -> Result<Self> {
        let groups = platform_controller();
        let store = ProcessStore::load(config.state_file(), groups.as_ref())?;
        Ok(Self::with_store(config, store, groups))
    }

    /// Build around an existing store
    pub fn with_store(
        config: MeshConfig,
        store: ProcessStore,
        groups: Arc<dyn ProcessGroupController>,
    ) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
            config,
            launcher: Arc::new(DefaultLauncher::default()),
            groups,
            base_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Replace the agent launcher
    pub fn with_launcher(mut self, launcher: Arc<dyn AgentLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Directory used as the working directory and for the registry binary search
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = dir.into();
        self
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub(crate) fn store(&self) -> &Arc<Mutex<ProcessStore>> {
        &self.store
    }

    pub(crate) fn groups(&self) -> &dyn ProcessGroupController {
        self.groups.as_ref()
    }

    /// Mark every running record whose process is gone as stopped. Returns their names.
    pub async fn cleanup_dead(&self) -> Vec<String> {
        let mut store = self.store.lock().await;
        let mut dead = Vec::new();
        for record in store.records_mut() {
            if refresh_liveness(record, self.groups.as_ref()) {
                dead.push(record.name.clone());
            }
        }
        if !dead.is_empty() {
            info!("Cleaned up {} dead processes", dead.len());
            store.save_or_warn();
        }
        dead
    }

    pub(crate) fn registry_url_for(&self, record: &ProcessRecord) -> String {
        if record.registry_url.is_empty() {
            self.config.registry_url()
        } else {
            record.registry_url.clone()
        }
    }

    pub(crate) fn registry_client_for(&self, record: &ProcessRecord) -> RegistryClient {
        RegistryClient::new(self.registry_url_for(record))
    }
}

/// `MCP_MESH_*` variables from our own environment, recorded so restarts see the same values
fn inherited_mesh_environment() -> HashMap<String, String> {
    std::env::vars()
        .filter(|(key, _)| key.starts_with("MCP_MESH_"))
        .collect()
}

fn spawn(command: &LaunchCommand, name: &str) -> Result<Child> {
    command
        .to_command()
        .spawn()
        .map_err(|source| SupervisorError::Spawn {
            name: name.to_string(),
            source,
        })
}

fn new_record(
    name: String,
    service_type: ServiceType,
    command: &LaunchCommand,
    registry_url: String,
    metadata: Metadata,
    child: Child,
) -> ProcessRecord {
    let now = Utc::now();
    let mut record = ProcessRecord {
        name,
        service_type,
        pid: None,
        handle: None,
        status: ProcessStatus::Stopped,
        health_check: HealthCheck::Unknown,
        command: command.argv(),
        working_dir: command.working_dir.clone().unwrap_or_default(),
        environment: command.env.clone(),
        registry_url,
        start_time: now,
        last_seen: now,
        last_restart: None,
        restarts: 0,
        consecutive_fails: 0,
        auto_restart: true,
        metadata,
    };
    record.mark_started(ProcessHandle::Owned(child));
    record
}

/// Probe the process behind `record`; downgrade it to stopped if it is gone.
/// Returns true when the record was downgraded.
pub(crate) fn refresh_liveness(
    record: &mut ProcessRecord,
    groups: &dyn ProcessGroupController,
) -> bool {
    let alive = match record.handle.as_mut() {
        Some(ProcessHandle::Owned(child)) => match child.try_wait() {
            Ok(Some(status)) => {
                debug!("Process {} exited with {}", record.name, status);
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!("Could not poll process {}: {}", record.name, e);
                true
            }
        },
        Some(ProcessHandle::Adopted(pid)) => groups.is_alive(*pid),
        None => return false,
    };

    if alive {
        record.last_seen = Utc::now();
        false
    } else {
        if let Some(pid) = record.pid {
            reclaim_group(groups, &record.name, pid);
        }
        record.mark_exited(ProcessStatus::Stopped, HealthCheck::Failed);
        true
    }
}

/// SIGKILL whatever an exited leader left behind in its process group
fn reclaim_group(groups: &dyn ProcessGroupController, name: &str, pgid: u32) {
    if !groups.is_group_alive(pgid) {
        return;
    }
    debug!("Killing leftover members of process group {} ({})", pgid, name);
    if let Err(e) = groups.force_kill(pgid) {
        warn!("Could not kill process group {} of {}: {}", pgid, name, e);
    }
}

/// Respawn a record from its stored command, working directory and environment
pub(crate) fn respawn(record: &mut ProcessRecord) -> Result<()> {
    let mut command = LaunchCommand::from_argv(&record.command).ok_or_else(|| {
        SupervisorError::State(format!("process {} has no command recorded", record.name))
    })?;
    command.working_dir = Some(record.working_dir.clone());
    command.env = record.environment.clone();

    let child = spawn(&command, &record.name)?;
    record.mark_started(ProcessHandle::Owned(child));
    record.health_check = HealthCheck::Unknown;
    info!("Spawned {} (PID: {:?})", record.name, record.pid);
    Ok(())
}

/// Graceful signal to the group, force-kill once `limit` expires
async fn shutdown(
    groups: &dyn ProcessGroupController,
    name: &str,
    handle: &mut ProcessHandle,
    limit: Duration,
) -> Result<ProcessStatus> {
    match handle {
        ProcessHandle::Owned(child) => {
            let pid = match (child.id(), child.try_wait()?) {
                (Some(pid), None) => pid,
                _ => {
                    debug!("Process {} already exited", name);
                    return Ok(ProcessStatus::Stopped);
                }
            };

            groups.signal_graceful(pid)?;
            match timeout(limit, child.wait()).await {
                Ok(status) => {
                    info!("Process {} stopped gracefully ({})", name, status?);
                    reclaim_group(groups, name, pid);
                    Ok(ProcessStatus::Stopped)
                }
                Err(_) => {
                    warn!(
                        "Process {} did not stop within {:?}, force killing (PID: {})",
                        name, limit, pid
                    );
                    groups.force_kill(pid)?;
                    let _ = child.start_kill();
                    if timeout(KILL_REAP_TIMEOUT, child.wait()).await.is_err() {
                        warn!("Process {} not reaped after SIGKILL", name);
                    }
                    Ok(ProcessStatus::Killed)
                }
            }
        }
        ProcessHandle::Adopted(pid) => match groups.terminate(*pid, limit).await? {
            Termination::AlreadyExited | Termination::Graceful => Ok(ProcessStatus::Stopped),
            Termination::Killed => Ok(ProcessStatus::Killed),
        },
    }
}

/// SIGKILL the group and wait at most `limit` for the process to disappear
async fn kill_now(
    groups: &dyn ProcessGroupController,
    name: &str,
    handle: &mut ProcessHandle,
    limit: Duration,
) -> Result<()> {
    let timed_out = || SupervisorError::Timeout {
        name: name.to_string(),
        timeout: limit,
    };

    match handle {
        ProcessHandle::Owned(child) => {
            if let Some(pid) = child.id() {
                groups.force_kill(pid)?;
            }
            let _ = child.start_kill();
            timeout(limit, child.wait())
                .await
                .map_err(|_| timed_out())??;
            Ok(())
        }
        ProcessHandle::Adopted(pid) => {
            let pid = *pid;
            groups.force_kill(pid)?;
            let probe = async {
                while groups.is_alive(pid) {
                    tokio::time::sleep(crate::process_group::POLL_INTERVAL).await;
                }
            };
            timeout(limit, probe).await.map_err(|_| timed_out())
        }
    }
}

/// Apply restart options, stop the current process and spawn a new one
async fn cycle(
    groups: &dyn ProcessGroupController,
    record: &mut ProcessRecord,
    options: RestartOptions,
) -> Result<ProcessRecord> {
    if let Some(command) = options.command {
        record.command = command;
    }
    if let Some(metadata) = options.metadata {
        record.metadata.extend(metadata);
    }

    if let Some(handle) = record.handle.as_mut() {
        info!("Stopping {} for restart (PID: {:?})", record.name, handle.pid());
        let status = shutdown(groups, &record.name, handle, options.timeout).await?;
        record.mark_exited(status, HealthCheck::Stopped);
    }

    respawn(record)?;
    record.restarts += 1;
    record.consecutive_fails = 0;
    record.last_restart = Some(Utc::now());
    info!(
        "Restarted {} (PID: {:?}, restarts: {})",
        record.name, record.pid, record.restarts
    );
    Ok(record.snapshot())
}

#[async_trait]
impl Supervisor for ProcessSupervisor {
    async fn start_agent(&self, agent_file: &Path, mut metadata: Metadata) -> Result<ProcessRecord> {
        if !agent_file.exists() {
            return Err(SupervisorError::AgentFileMissing(agent_file.to_path_buf()));
        }
        let file = agent_file.to_string_lossy().to_string();

        let mut store = self.store.lock().await;
        let name = store.derive_agent_name(&file)?;

        let mut command = self.launcher.command_for(agent_file)?;
        if command.working_dir.is_none() {
            command.working_dir = Some(self.base_dir.clone());
        }
        command.env.extend(inherited_mesh_environment());
        command.env.extend(self.config.agent_environment());

        info!("Starting agent {} ({})", name, command);
        let child = spawn(&command, &name)?;

        metadata.insert("agent_file".to_string(), serde_json::Value::from(file));
        let record = new_record(
            name,
            ServiceType::Agent,
            &command,
            self.config.registry_url(),
            metadata,
            child,
        );
        info!("Agent {} started (PID: {:?})", record.name, record.pid);

        let snapshot = record.snapshot();
        store.insert(record);
        store.save_or_warn();
        Ok(snapshot)
    }

    async fn start_registry(&self, options: RegistryOptions) -> Result<ProcessRecord> {
        let mut store = self.store.lock().await;
        for record in store.records_mut() {
            if record.service_type == ServiceType::Registry {
                refresh_liveness(record, self.groups.as_ref());
            }
        }
        if let Some(existing) = store
            .records()
            .find(|r| r.service_type == ServiceType::Registry && r.is_running())
        {
            return Err(SupervisorError::AlreadyRunning {
                name: existing.name.clone(),
                pid: existing.pid.unwrap_or_default(),
            });
        }

        let port = options.port.unwrap_or(self.config.registry_port);
        let db_path = options
            .db_path
            .unwrap_or_else(|| self.config.db_path.clone());
        let binary = find_registry_binary(&self.base_dir)?;

        let mut command = LaunchCommand::new(binary.to_string_lossy())
            .args(["-port".to_string(), port.to_string()])
            .current_dir(&self.base_dir);
        command.env.extend(self.config.registry_environment(port, &db_path));

        info!("Starting registry on port {} ({})", port, command);
        let child = spawn(&command, REGISTRY_NAME)?;

        let mut metadata = options.metadata;
        metadata.insert("port".to_string(), serde_json::Value::from(port));
        metadata.insert("db_path".to_string(), serde_json::Value::from(db_path));

        let url = format!("http://{}:{}", self.config.registry_host, port);
        let mut record = new_record(
            REGISTRY_NAME.to_string(),
            ServiceType::Registry,
            &command,
            url.clone(),
            metadata,
            child,
        );
        if let Some(previous) = store.get(REGISTRY_NAME) {
            record.restarts = previous.restarts;
        }
        info!("Registry started (PID: {:?})", record.pid);

        let snapshot = record.snapshot();
        store.insert(record);
        store.save_or_warn();

        if let Err(e) = RegistryClient::new(url)
            .wait_ready(self.config.startup_timeout)
            .await
        {
            warn!("{}", e);
        }
        Ok(snapshot)
    }

    async fn stop(&self, name: &str, timeout: Duration) -> Result<()> {
        let mut store = self.store.lock().await;
        let record = store
            .get_mut(name)
            .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;
        let handle = record
            .handle
            .as_mut()
            .ok_or_else(|| SupervisorError::NoProcess(name.to_string()))?;

        info!("Stopping {} (PID: {:?})", name, handle.pid());
        let outcome = shutdown(self.groups.as_ref(), name, handle, timeout).await;
        let status = match outcome {
            Ok(status) => status,
            Err(e) => {
                store.save_or_warn();
                return Err(e);
            }
        };

        let health = match status {
            ProcessStatus::Killed => HealthCheck::Killed,
            _ => HealthCheck::Stopped,
        };
        record.mark_exited(status, health);
        info!("Process {} is {}", name, status);
        store.save_or_warn();
        Ok(())
    }

    async fn terminate(&self, name: &str, timeout: Duration) -> Result<()> {
        let mut store = self.store.lock().await;
        let record = store
            .get_mut(name)
            .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;
        let handle = record
            .handle
            .as_mut()
            .ok_or_else(|| SupervisorError::NoProcess(name.to_string()))?;

        warn!("Force killing {} (PID: {:?})", name, handle.pid());
        let outcome = kill_now(self.groups.as_ref(), name, handle, timeout).await;
        if outcome.is_ok() {
            record.mark_exited(ProcessStatus::Killed, HealthCheck::Killed);
        }
        store.save_or_warn();
        outcome
    }

    async fn restart(&self, name: &str, options: RestartOptions) -> Result<ProcessRecord> {
        let mut store = self.store.lock().await;
        let record = store
            .get_mut(name)
            .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;

        // Whatever happened to the old process is persisted, even on failure
        let outcome = cycle(self.groups.as_ref(), record, options).await;
        store.save_or_warn();
        outcome
    }

    async fn status(&self, name: &str) -> Result<ProcessStatusReport> {
        let record = {
            let mut store = self.store.lock().await;
            let record = store
                .get_mut(name)
                .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;
            let downgraded = refresh_liveness(record, self.groups.as_ref());
            let snapshot = record.snapshot();
            if downgraded {
                store.save_or_warn();
            }
            snapshot
        };

        let uptime_secs = (record.status == ProcessStatus::Running)
            .then(|| (Utc::now() - record.start_time).num_seconds().max(0) as u64);

        let registry = match record.service_type {
            ServiceType::Agent => Some(self.registry_client_for(&record).agent_view(name).await),
            ServiceType::Registry => None,
        };

        Ok(ProcessStatusReport {
            record,
            uptime_secs,
            registry,
        })
    }

    async fn list(&self) -> Result<Vec<ProcessRecord>> {
        let mut store = self.store.lock().await;
        let mut downgraded = false;
        for record in store.records_mut() {
            downgraded |= refresh_liveness(record, self.groups.as_ref());
        }
        if downgraded {
            store.save_or_warn();
        }

        let mut records: Vec<ProcessRecord> = store.records().map(ProcessRecord::snapshot).collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    async fn remove(&self, name: &str) -> Result<bool> {
        let mut store = self.store.lock().await;
        let Some(record) = store.get_mut(name) else {
            return Ok(false);
        };
        refresh_liveness(record, self.groups.as_ref());
        if record.is_running() {
            return Err(SupervisorError::AlreadyRunning {
                name: name.to_string(),
                pid: record.pid.unwrap_or_default(),
            });
        }

        store.remove(name);
        info!("Removed process {}", name);
        store.save_or_warn();
        Ok(true)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sleeper() -> Arc<dyn AgentLauncher> {
        Arc::new(|_: &Path| -> Result<LaunchCommand> {
            Ok(LaunchCommand::new("sh").args(["-c", "exec sleep 30"]))
        })
    }

    fn supervisor(dir: &Path) -> ProcessSupervisor {
        let config = MeshConfig {
            state_dir: dir.join("state"),
            ..Default::default()
        };
        let store = ProcessStore::new(config.state_file());
        ProcessSupervisor::with_store(config, store, platform_controller())
            .with_launcher(sleeper())
            .with_base_dir(dir)
    }

    #[tokio::test]
    async fn test_start_agent_records_environment() {
        let dir = tempfile::tempdir().unwrap();
        let agent = dir.path().join("hello.py");
        std::fs::write(&agent, "").unwrap();

        let supervisor = supervisor(dir.path());
        let record = supervisor.start_agent(&agent, Metadata::new()).await.unwrap();

        assert!(record.pid.is_some());
        assert_eq!(record.environment["MCP_MESH_REGISTRY_PORT"], "8080");
        assert_eq!(record.agent_file(), Some(agent.to_string_lossy().as_ref()));

        supervisor.terminate(&record.name, Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_without_process_is_no_process() {
        let dir = tempfile::tempdir().unwrap();
        let agent = dir.path().join("idle.py");
        std::fs::write(&agent, "").unwrap();

        let supervisor = supervisor(dir.path());
        let record = supervisor.start_agent(&agent, Metadata::new()).await.unwrap();
        supervisor.stop(&record.name, Duration::from_secs(5)).await.unwrap();

        assert!(matches!(
            supervisor.stop(&record.name, Duration::from_secs(1)).await,
            Err(SupervisorError::NoProcess(_))
        ));
        assert!(matches!(
            supervisor.terminate("missing", Duration::from_secs(1)).await,
            Err(SupervisorError::NotFound(_))
        ));

        assert!(supervisor.remove(&record.name).await.unwrap());
        assert!(!supervisor.remove(&record.name).await.unwrap());
    }

    #[tokio::test]
    async fn test_cleanup_dead_downgrades_exited_process() {
        let dir = tempfile::tempdir().unwrap();
        let agent = dir.path().join("short.py");
        std::fs::write(&agent, "").unwrap();

        let supervisor = supervisor(dir.path()).with_launcher(Arc::new(
            |_: &Path| -> Result<LaunchCommand> { Ok(LaunchCommand::new("true")) },
        ));
        let record = supervisor.start_agent(&agent, Metadata::new()).await.unwrap();

        let mut dead = Vec::new();
        for _ in 0..50 {
            dead = supervisor.cleanup_dead().await;
            if !dead.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(dead, vec![record.name.clone()]);

        let status = supervisor.status(&record.name).await.unwrap();
        assert_eq!(status.record.status, ProcessStatus::Stopped);
        assert!(status.uptime_secs.is_none());
    }
}
