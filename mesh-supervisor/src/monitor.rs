//! Background health monitoring with policy-bounded auto-restart

use crate::process::{ProcessSupervisor, refresh_liveness, respawn};
use crate::record::{HealthCheck, ProcessRecord, ProcessStatus, ServiceType};
use crate::registry::{RegistryAgent, RegistryClient};
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Heartbeats older than this make an agent unhealthy
pub const HEARTBEAT_FRESHNESS: Duration = Duration::from_secs(120);

/// When and how often dead processes are restarted
#[derive(Debug, Clone)]
pub struct MonitoringPolicy {
    pub check_interval: Duration,
    pub restart_on_failure: bool,
    /// Restarts beyond this count are not attempted
    pub max_restart_attempts: u32,
    /// Minimum time since the last restart before another one
    pub restart_cooldown: Duration,
}

impl Default for MonitoringPolicy {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            restart_on_failure: true,
            max_restart_attempts: 3,
            restart_cooldown: Duration::from_secs(5 * 60),
        }
    }
}

impl MonitoringPolicy {
    fn should_restart(&self, record: &ProcessRecord) -> bool {
        if !record.auto_restart || !self.restart_on_failure {
            return false;
        }
        if record.restarts >= self.max_restart_attempts {
            return false;
        }
        match record.last_restart {
            Some(at) => (Utc::now() - at).to_std().unwrap_or_default() >= self.restart_cooldown,
            None => true,
        }
    }
}

/// Outcome of one sweep
#[derive(Debug, Default, Clone)]
pub struct HealthSweep {
    /// Processes found dead during this sweep
    pub dead: Vec<String>,
    /// Processes restarted during this sweep
    pub restarted: Vec<String>,
    /// Live agents the registry does not consider healthy
    pub unhealthy: Vec<String>,
}

/// Whether the registry reports `agent` active with a recent heartbeat
fn registry_healthy(agent: Option<&RegistryAgent>) -> bool {
    let Some(agent) = agent else {
        return false;
    };
    let active = matches!(agent.status.as_str(), "active" | "healthy");
    let fresh = agent.last_heartbeat.is_some_and(|seen| {
        (Utc::now() - seen).to_std().unwrap_or_default() < HEARTBEAT_FRESHNESS
    });
    active && fresh
}

/// Agent listings of every registry a running agent points at, `None` when unreachable
async fn fetch_listings(supervisor: &ProcessSupervisor) -> HashMap<String, Option<Vec<RegistryAgent>>> {
    let urls: BTreeSet<String> = {
        let store = supervisor.store().lock().await;
        store
            .records()
            .filter(|r| r.service_type == ServiceType::Agent && r.is_running())
            .map(|r| supervisor.registry_url_for(r))
            .collect()
    };

    let mut listings = HashMap::new();
    for url in urls {
        let agents = match RegistryClient::new(url.clone()).agents().await {
            Ok(agents) => Some(agents),
            Err(e) => {
                debug!("Registry {} unavailable: {}", url, e);
                None
            }
        };
        listings.insert(url, agents);
    }
    listings
}

/// Run one health sweep over every tracked process.
///
/// Registry listings are fetched once per sweep before the store lock is taken.
pub async fn check_health(supervisor: &ProcessSupervisor, policy: &MonitoringPolicy) -> HealthSweep {
    let mut sweep = HealthSweep::default();
    let listings = fetch_listings(supervisor).await;
    let mut store = supervisor.store().lock().await;

    for name in store.names() {
        let Some(record) = store.get_mut(&name) else {
            continue;
        };

        if refresh_liveness(record, supervisor.groups()) {
            info!("Process {} is no longer running", name);
            record.consecutive_fails += 1;
            sweep.dead.push(name.clone());
        }

        if record.status != ProcessStatus::Running {
            // Only crashed processes are candidates, never ones stopped on request
            if record.health_check == HealthCheck::Failed && policy.should_restart(record) {
                info!("Attempting auto-restart for process: {}", name);
                match respawn(record) {
                    Ok(()) => {
                        record.restarts += 1;
                        record.last_restart = Some(Utc::now());
                        record.consecutive_fails = 0;
                        sweep.restarted.push(name.clone());
                    }
                    Err(e) => warn!("Auto-restart failed for {}: {}", name, e),
                }
            }
            continue;
        }

        match record.service_type {
            ServiceType::Agent => {
                let healthy = match listings.get(&supervisor.registry_url_for(record)) {
                    Some(Some(agents)) => registry_healthy(agents.iter().find(|a| a.name == name)),
                    Some(None) => false,
                    None => {
                        debug!("Agent {} started during the sweep; checking it next time", name);
                        continue;
                    }
                };
                if healthy {
                    record.health_check = HealthCheck::Healthy;
                    record.last_seen = Utc::now();
                    record.consecutive_fails = 0;
                } else {
                    warn!("Agent {} failed registry health check", name);
                    record.health_check = HealthCheck::Unhealthy;
                    record.consecutive_fails += 1;
                    sweep.unhealthy.push(name.clone());
                }
            }
            ServiceType::Registry => {
                record.health_check = HealthCheck::Healthy;
                record.last_seen = Utc::now();
                record.consecutive_fails = 0;
            }
        }
    }

    store.save_or_warn();
    sweep
}

/// Periodic health checks running on a background task
pub struct HealthMonitor {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl HealthMonitor {
    /// Start sweeping every `policy.check_interval`
    pub fn spawn(supervisor: Arc<ProcessSupervisor>, policy: MonitoringPolicy) -> Self {
        let token = CancellationToken::new();
        let cancelled = token.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(policy.check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            info!(
                "Started health monitoring with {:?} interval",
                policy.check_interval
            );
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        let sweep = check_health(&supervisor, &policy).await;
                        if !sweep.dead.is_empty() || !sweep.restarted.is_empty() {
                            info!(
                                "Health sweep: dead={:?}, restarted={:?}, unhealthy={:?}",
                                sweep.dead, sweep.restarted, sweep.unhealthy
                            );
                        }
                    }
                }
            }
            info!("Stopped health monitoring");
        });

        Self { token, task }
    }

    /// Stop the background task and wait for it to finish
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            warn!("Health monitor task failed: {}", e);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::MeshConfig;
    use crate::launch::{AgentLauncher, LaunchCommand};
    use crate::process_group::platform_controller;
    use crate::store::ProcessStore;
    use crate::supervisor::{Metadata, Supervisor};
    use std::path::Path;

    fn supervisor(dir: &Path, config: MeshConfig, script: &'static str) -> ProcessSupervisor {
        let launcher: Arc<dyn AgentLauncher> =
            Arc::new(move |_: &Path| -> crate::Result<LaunchCommand> {
                Ok(LaunchCommand::new("sh").args(["-c", script]))
            });
        let config = MeshConfig {
            state_dir: dir.join("state"),
            ..config
        };
        let store = ProcessStore::new(config.state_file());
        ProcessSupervisor::with_store(config, store, platform_controller())
            .with_launcher(launcher)
            .with_base_dir(dir)
    }

    fn agent_file(dir: &Path, name: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, "").unwrap();
        path
    }

    #[tokio::test]
    async fn test_crashed_agent_restarted_within_limits() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path(), MeshConfig::default(), "exit 1");
        let record = supervisor
            .start_agent(&agent_file(dir.path(), "crash.py"), Metadata::new())
            .await
            .unwrap();

        let policy = MonitoringPolicy {
            check_interval: Duration::from_millis(10),
            max_restart_attempts: 2,
            restart_cooldown: Duration::ZERO,
            ..Default::default()
        };

        for expected_restarts in 1..=2 {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let sweep = check_health(&supervisor, &policy).await;
            assert_eq!(sweep.dead, vec![record.name.clone()]);
            assert_eq!(sweep.restarted, vec![record.name.clone()]);
            let store = supervisor.store().lock().await;
            assert_eq!(store.get(&record.name).unwrap().restarts, expected_restarts);
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        let sweep = check_health(&supervisor, &policy).await;
        assert_eq!(sweep.dead, vec![record.name.clone()]);
        assert!(sweep.restarted.is_empty());

        let store = supervisor.store().lock().await;
        let record = store.get(&record.name).unwrap();
        assert_eq!(record.status, ProcessStatus::Stopped);
        assert_eq!(record.health_check, HealthCheck::Failed);
        assert_eq!(record.consecutive_fails, 1);
    }

    #[tokio::test]
    async fn test_stopped_on_request_is_not_restarted() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path(), MeshConfig::default(), "exec sleep 30");
        let record = supervisor
            .start_agent(&agent_file(dir.path(), "calm.py"), Metadata::new())
            .await
            .unwrap();
        supervisor
            .stop(&record.name, Duration::from_secs(5))
            .await
            .unwrap();

        let policy = MonitoringPolicy {
            restart_cooldown: Duration::ZERO,
            ..Default::default()
        };
        let sweep = check_health(&supervisor, &policy).await;
        assert!(sweep.dead.is_empty());
        assert!(sweep.restarted.is_empty());
    }

    #[tokio::test]
    async fn test_agent_health_from_registry() {
        let mut server = mockito::Server::new_async().await;
        let address = server.host_with_port();
        let (host, port) = address.rsplit_once(':').unwrap();
        let config = MeshConfig {
            registry_host: host.to_string(),
            registry_port: port.parse().unwrap(),
            ..Default::default()
        };

        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path(), config, "exec sleep 30");
        let fresh = supervisor
            .start_agent(&agent_file(dir.path(), "fresh.py"), Metadata::new())
            .await
            .unwrap();
        let stale = supervisor
            .start_agent(&agent_file(dir.path(), "stale.py"), Metadata::new())
            .await
            .unwrap();

        let body = serde_json::json!({
            "agents": [
                {"name": fresh.name, "status": "active", "last_heartbeat": Utc::now()},
                {"name": stale.name, "status": "active",
                 "last_heartbeat": Utc::now() - chrono::Duration::minutes(10)},
            ]
        });
        let agents = server
            .mock("GET", "/agents")
            .with_status(200)
            .with_body(body.to_string())
            .expect(1)
            .create_async()
            .await;

        let sweep = check_health(&supervisor, &MonitoringPolicy::default()).await;
        assert_eq!(sweep.unhealthy, vec![stale.name.clone()]);
        // Both agents share one listing
        agents.assert_async().await;
        {
            let store = supervisor.store().lock().await;
            assert_eq!(store.get(&fresh.name).unwrap().health_check, HealthCheck::Healthy);
            assert_eq!(store.get(&stale.name).unwrap().health_check, HealthCheck::Unhealthy);
        }

        let errors = supervisor.stop_all(Duration::from_secs(5)).await;
        assert!(errors.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_registry_marks_agents_unhealthy() {
        let config = MeshConfig {
            registry_host: "127.0.0.1".to_string(),
            registry_port: 9,
            ..Default::default()
        };
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path(), config, "exec sleep 30");
        let mut names = Vec::new();
        for file in ["one.py", "two.py"] {
            let record = supervisor
                .start_agent(&agent_file(dir.path(), file), Metadata::new())
                .await
                .unwrap();
            names.push(record.name);
        }

        let sweep = check_health(&supervisor, &MonitoringPolicy::default()).await;
        let mut unhealthy = sweep.unhealthy;
        unhealthy.sort();
        names.sort();
        assert_eq!(unhealthy, names);

        let errors = supervisor.stop_all(Duration::from_secs(5)).await;
        assert!(errors.is_empty());
    }

    #[tokio::test]
    async fn test_monitor_stops_on_request() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Arc::new(supervisor(dir.path(), MeshConfig::default(), "exit 0"));
        let monitor = HealthMonitor::spawn(
            supervisor,
            MonitoringPolicy {
                check_interval: Duration::from_millis(20),
                ..Default::default()
            },
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        tokio::time::timeout(Duration::from_secs(2), monitor.stop())
            .await
            .unwrap();
    }
}
