//! HTTP client for the registry's health and agent listing endpoints

use crate::error::{Result, SupervisorError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Interval between readiness probes
pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// An agent as the registry sees it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryAgent {
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, alias = "last_seen")]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AgentsResponse {
    Wrapped { agents: Vec<RegistryAgent> },
    Bare(Vec<RegistryAgent>),
}

/// Registry view attached to an agent's status report
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryView {
    pub connected: bool,
    pub registered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry_status: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Client for one registry base URL
#[derive(Debug, Clone)]
pub struct RegistryClient {
    base_url: String,
    http: reqwest::Client,
}

impl RegistryClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Single `GET /health` probe
    pub async fn is_ready(&self) -> bool {
        match self.http.get(format!("{}/health", self.base_url)).send().await {
            Ok(resp) => resp.status() == reqwest::StatusCode::OK,
            Err(e) => {
                debug!("Registry health probe failed: {}", e);
                false
            }
        }
    }

    /// Poll `GET /health` until it answers 200 or `timeout` elapses
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let attempt = tokio::time::timeout_at(deadline, self.is_ready()).await;
            if matches!(attempt, Ok(true)) {
                return Ok(());
            }
            if Instant::now() + READY_POLL_INTERVAL > deadline {
                return Err(SupervisorError::ReadinessTimeout {
                    url: self.base_url.clone(),
                    timeout,
                });
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    /// `GET /agents`
    pub async fn agents(&self) -> Result<Vec<RegistryAgent>> {
        let resp = self
            .http
            .get(format!("{}/agents", self.base_url))
            .send()
            .await?
            .error_for_status()?;
        Ok(match resp.json::<AgentsResponse>().await? {
            AgentsResponse::Wrapped { agents } | AgentsResponse::Bare(agents) => agents,
        })
    }

    /// The registry's view of one agent; transport problems land in `error`
    pub async fn agent_view(&self, name: &str) -> RegistryView {
        match self.agents().await {
            Ok(agents) => {
                let mut view = RegistryView {
                    connected: true,
                    ..Default::default()
                };
                if let Some(agent) = agents.into_iter().find(|a| a.name == name) {
                    view.registered = true;
                    view.registry_status = Some(agent.status);
                    view.last_heartbeat = agent.last_heartbeat;
                }
                view
            }
            Err(e) => RegistryView {
                error: Some(e.to_string()),
                ..Default::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_ready_succeeds() {
        let mut server = mockito::Server::new_async().await;
        let health = server
            .mock("GET", "/health")
            .with_status(200)
            .create_async()
            .await;

        let client = RegistryClient::new(server.url());
        client.wait_ready(Duration::from_secs(2)).await.unwrap();
        health.assert_async().await;
    }

    #[tokio::test]
    async fn test_wait_ready_times_out() {
        let mut server = mockito::Server::new_async().await;
        let _health = server
            .mock("GET", "/health")
            .with_status(503)
            .expect_at_least(1)
            .create_async()
            .await;

        let client = RegistryClient::new(server.url());
        let started = std::time::Instant::now();
        let err = client.wait_ready(Duration::from_millis(600)).await.unwrap_err();
        assert!(matches!(err, SupervisorError::ReadinessTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_agent_view_wrapped_listing() {
        let mut server = mockito::Server::new_async().await;
        let _agents = server
            .mock("GET", "/agents")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"agents":[{"name":"hello","status":"healthy","last_heartbeat":"2026-10-19T10:00:00Z"}]}"#,
            )
            .create_async()
            .await;

        let client = RegistryClient::new(server.url());
        let view = client.agent_view("hello").await;
        assert!(view.connected);
        assert!(view.registered);
        assert_eq!(view.registry_status.as_deref(), Some("healthy"));
        assert!(view.last_heartbeat.is_some());

        let missing = client.agent_view("other").await;
        assert!(missing.connected);
        assert!(!missing.registered);
    }

    #[tokio::test]
    async fn test_agents_bare_listing() {
        let mut server = mockito::Server::new_async().await;
        let _agents = server
            .mock("GET", "/agents")
            .with_status(200)
            .with_body(r#"[{"name":"a","status":"healthy","last_heartbeat":null}]"#)
            .create_async()
            .await;

        let agents = RegistryClient::new(server.url()).agents().await.unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].name, "a");
    }

    #[tokio::test]
    async fn test_agent_view_unreachable_registry() {
        let client = RegistryClient::new("http://127.0.0.1:1");
        let view = client.agent_view("hello").await;
        assert!(!view.connected);
        assert!(!view.registered);
        assert!(view.error.is_some());
    }
}
