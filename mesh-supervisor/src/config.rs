//! Configuration for the mesh supervisor and watch mode

use crate::error::{Result, SupervisorError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default watch-mode debounce delay
pub const DEFAULT_DEBOUNCE_DELAY: Duration = Duration::from_millis(500);

/// Default delay between killing an agent and starting its replacement
pub const DEFAULT_PORT_DELAY: Duration = Duration::from_millis(500);

/// Default SIGTERM -> SIGKILL escalation timeout in watch mode
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// CLI-level configuration shared by every supervisor operation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Registry host agents connect to
    pub registry_host: String,

    /// Registry port
    pub registry_port: u16,

    /// Registry database path
    pub db_path: String,

    /// Log level forwarded to the registry
    pub log_level: String,

    /// Registry heartbeat check interval in seconds
    pub health_check_interval: u64,

    /// Forces DEBUG logging in the registry
    pub debug_mode: bool,

    /// How long to wait for the registry to answer health checks
    #[serde(with = "humantime_serde")]
    pub startup_timeout: Duration,

    /// Default graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Directory holding the persisted process table
    pub state_dir: PathBuf,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            registry_host: "localhost".to_string(),
            registry_port: 8080,
            db_path: "./dev_registry.db".to_string(),
            log_level: "INFO".to_string(),
            health_check_interval: 10,
            debug_mode: false,
            startup_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(30),
            state_dir: default_state_dir(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".mcp_mesh")
}

impl MeshConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Loads in this order:
    /// 1. Default configuration
    /// 2. `~/.mcp_mesh/cli_config.toml`, or the path in `MCP_MESH_CONFIG_PATH`
    /// 3. `MCP_MESH_*` environment variable overrides
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file is invalid or a value fails validation.
    pub fn load() -> Result<Self> {
        use figment::{
            Figment,
            providers::{Env, Format, Serialized, Toml},
        };

        let path = std::env::var("MCP_MESH_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_state_dir().join("cli_config.toml"));

        let config: MeshConfig = Figment::from(Serialized::defaults(MeshConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("MCP_MESH_").ignore(&["config_path"]))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path, without environment overrides.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        use figment::{
            Figment,
            providers::{Format, Serialized, Toml},
        };

        let config: MeshConfig = Figment::from(Serialized::defaults(MeshConfig::default()))
            .merge(Toml::file(path))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Registry base URL, e.g. `http://localhost:8080`
    pub fn registry_url(&self) -> String {
        format!("http://{}:{}", self.registry_host, self.registry_port)
    }

    /// Path of the persisted process table
    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join("processes.json")
    }

    /// Environment layered onto agent processes so they can find the registry
    pub fn agent_environment(&self) -> Vec<(String, String)> {
        vec![
            ("MCP_MESH_REGISTRY_URL".to_string(), self.registry_url()),
            ("MCP_MESH_REGISTRY_HOST".to_string(), self.registry_host.clone()),
            ("MCP_MESH_REGISTRY_PORT".to_string(), self.registry_port.to_string()),
            ("MCP_MESH_DB_PATH".to_string(), self.db_path.clone()),
        ]
    }

    /// Environment for the registry service itself
    pub fn registry_environment(&self, port: u16, db_path: &str) -> Vec<(String, String)> {
        let log_level = if self.debug_mode {
            "DEBUG".to_string()
        } else {
            self.log_level.to_uppercase()
        };

        vec![
            ("HOST".to_string(), self.registry_host.clone()),
            ("PORT".to_string(), port.to_string()),
            ("DATABASE_URL".to_string(), db_path.to_string()),
            ("MCP_MESH_LOG_LEVEL".to_string(), log_level),
            ("MCP_MESH_DEBUG_MODE".to_string(), self.debug_mode.to_string()),
            (
                "HEALTH_CHECK_INTERVAL".to_string(),
                self.health_check_interval.to_string(),
            ),
        ]
    }

    fn validate(&self) -> Result<()> {
        if self.registry_port == 0 {
            return Err(SupervisorError::Configuration(
                "registry_port must be greater than 0".to_string(),
            ));
        }
        if self.registry_host.trim().is_empty() {
            return Err(SupervisorError::Configuration(
                "registry_host must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Watch-mode tunables read from the environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchTunables {
    /// `MCP_MESH_RELOAD_DEBOUNCE`, seconds as a float
    pub debounce_delay: Duration,
    /// `MCP_MESH_RELOAD_PORT_DELAY`, seconds as a float
    pub port_delay: Duration,
    /// `MCP_MESH_RELOAD_PRECHECK`
    pub precheck_enabled: bool,
}

impl Default for WatchTunables {
    fn default() -> Self {
        Self {
            debounce_delay: DEFAULT_DEBOUNCE_DELAY,
            port_delay: DEFAULT_PORT_DELAY,
            precheck_enabled: true,
        }
    }
}

impl WatchTunables {
    /// Read tunables from the process environment, falling back to defaults
    pub fn from_env() -> Self {
        let var = |key: &str| std::env::var(key).ok();
        Self {
            debounce_delay: parse_seconds(
                var("MCP_MESH_RELOAD_DEBOUNCE").as_deref(),
                DEFAULT_DEBOUNCE_DELAY,
            ),
            port_delay: parse_seconds(
                var("MCP_MESH_RELOAD_PORT_DELAY").as_deref(),
                DEFAULT_PORT_DELAY,
            ),
            precheck_enabled: var("MCP_MESH_RELOAD_PRECHECK")
                .filter(|v| !v.is_empty())
                .map(|v| parse_bool(&v))
                .unwrap_or(true),
        }
    }
}

/// Parse a float number of seconds; missing, invalid or non-positive values yield `default`
pub fn parse_seconds(value: Option<&str>, default: Duration) -> Duration {
    value
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs > 0.0)
        .map(Duration::from_secs_f64)
        .unwrap_or(default)
}

/// Boolean parsing shared with the Python runtime: unknown values are false
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "true" | "1" | "yes" | "on" | "t" | "y"
    )
}
