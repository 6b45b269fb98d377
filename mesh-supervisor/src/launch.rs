//! Building runnable commands for agents and the registry

use crate::error::{Result, SupervisorError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// Registry executable name looked up on `PATH`
pub const REGISTRY_BINARY: &str = "mcp-mesh-registry";

/// Local build outputs checked before `PATH`, in order
pub const REGISTRY_LOCAL_PATHS: &[&str] = &[
    "./bin/mcp-mesh-registry",
    "./mcp-mesh-registry",
    "./build/mcp-mesh-registry",
    "cmd/mcp-mesh-registry/mcp-mesh-registry",
];

/// A program, its arguments, working directory and environment overrides
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

impl LaunchCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Set or replace an environment override
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Rebuild from a stored argv; `None` if the argv is empty
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone()).args(args.iter().cloned()))
    }

    /// Program followed by its arguments
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Tokio command placed in its own process group, inheriting stdio
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        isolate_process_group(&mut cmd);
        cmd
    }
}

impl std::fmt::Display for LaunchCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.argv().join(" "))
    }
}

/// Make the child lead a new process group so the whole tree can be signalled
pub fn isolate_process_group(cmd: &mut Command) {
    #[cfg(unix)]
    cmd.process_group(0);

    #[cfg(windows)]
    {
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }
}

/// Turns an agent source file into a runnable command
pub trait AgentLauncher: Send + Sync {
    fn command_for(&self, agent_file: &Path) -> Result<LaunchCommand>;
}

/// Picks an interpreter from the file extension
#[derive(Debug, Clone)]
pub struct DefaultLauncher {
    pub python: String,
}

impl Default for DefaultLauncher {
    fn default() -> Self {
        Self {
            python: std::env::var("MCP_MESH_PYTHON").unwrap_or_else(|_| "python".to_string()),
        }
    }
}

impl AgentLauncher for DefaultLauncher {
    fn command_for(&self, agent_file: &Path) -> Result<LaunchCommand> {
        let file = agent_file.to_string_lossy().to_string();
        let cmd = match agent_file.extension().and_then(|e| e.to_str()) {
            Some("py") => LaunchCommand::new(&self.python).arg(file),
            Some("js") | Some("mjs") => LaunchCommand::new("node").arg(file),
            Some("ts") => LaunchCommand::new("npx").args(["tsx".to_string(), file]),
            _ => LaunchCommand::new(file),
        };
        Ok(cmd)
    }
}

impl<F> AgentLauncher for F
where
    F: Fn(&Path) -> Result<LaunchCommand> + Send + Sync,
{
    fn command_for(&self, agent_file: &Path) -> Result<LaunchCommand> {
        self(agent_file)
    }
}

/// Locate the registry executable: local build outputs first, then `PATH`
pub fn find_registry_binary(base_dir: &Path) -> Result<PathBuf> {
    for candidate in REGISTRY_LOCAL_PATHS {
        let path = base_dir.join(candidate);
        if path.is_file() {
            return Ok(path);
        }
    }

    if let Ok(path) = which::which(REGISTRY_BINARY) {
        return Ok(path);
    }

    let mut tried: Vec<String> = REGISTRY_LOCAL_PATHS.iter().map(|p| p.to_string()).collect();
    tried.push(format!("{REGISTRY_BINARY} (in PATH)"));
    Err(SupervisorError::BinaryNotFound(tried))
}
