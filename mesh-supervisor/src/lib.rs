//! Mesh Supervisor - local process supervision for MCP Mesh agents and their registry
//!
//! Starts, stops, restarts and reports on agent worker processes and the
//! registry they register with, keeping a persistent process table so later
//! invocations can manage what earlier ones started. Watch mode keeps a single
//! development agent alive and replaces it whenever its sources change.
//!
//! ## Pieces
//!
//! - [`ProcessSupervisor`] - the [`Supervisor`] implementation over a [`ProcessStore`]
//! - [`RegistryClient`] - readiness probing and the registry's view of an agent
//! - [`ProcessGroupController`] - graceful-then-forced termination of whole process groups
//! - [`watch`] - file watching, debounce and the [`watch::AgentWatcher`] state machine
//! - [`HealthMonitor`] - optional periodic health checks with bounded auto-restart

mod config;
mod error;
mod launch;
mod logs;
mod monitor;
mod process;
mod process_group;
mod record;
mod registry;
mod store;
mod supervisor;
pub mod watch;

pub use config::{
    DEFAULT_DEBOUNCE_DELAY, DEFAULT_PORT_DELAY, DEFAULT_STOP_TIMEOUT, MeshConfig, WatchTunables,
    parse_bool, parse_seconds,
};
pub use error::{Result, SupervisorError};
pub use launch::{
    AgentLauncher, DefaultLauncher, LaunchCommand, REGISTRY_BINARY, REGISTRY_LOCAL_PATHS,
    find_registry_binary,
};
pub use logs::{LogManager, LogSinkFactory, MAX_LOG_FILES, sanitize_log_name};
pub use monitor::{HEARTBEAT_FRESHNESS, HealthMonitor, HealthSweep, MonitoringPolicy, check_health};
pub use process::{ProcessSupervisor, REGISTRY_NAME};
pub use process_group::{ProcessGroupController, Termination, platform_controller};
#[cfg(unix)]
pub use process_group::SignalGroupController;
pub use record::{HealthCheck, ProcessHandle, ProcessRecord, ProcessStatus, ServiceType};
pub use registry::{RegistryAgent, RegistryClient, RegistryView};
pub use store::{ProcessStore, base_process_name};
pub use supervisor::{Metadata, ProcessStatusReport, RegistryOptions, RestartOptions, Supervisor};
