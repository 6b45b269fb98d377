//! Per-agent log files with generation rotation

use crate::error::Result;
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Log files kept per agent: the current one plus four previous generations
pub const MAX_LOG_FILES: usize = 5;

/// Produces a fresh writable sink each time a process generation starts
pub trait LogSinkFactory: Send + Sync {
    fn create_sink(&self) -> Result<File>;
}

impl<F> LogSinkFactory for F
where
    F: Fn() -> Result<File> + Send + Sync,
{
    fn create_sink(&self) -> Result<File> {
        self()
    }
}

/// Log files under one directory, named after the agent
#[derive(Debug, Clone)]
pub struct LogManager {
    logs_dir: PathBuf,
}

impl LogManager {
    /// Manager rooted at `~/.mcp-mesh/logs`
    pub fn new() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "home directory not found"))?;
        Self::with_dir(home.join(".mcp-mesh").join("logs"))
    }

    /// Manager rooted at `logs_dir`, created if missing
    pub fn with_dir(logs_dir: impl Into<PathBuf>) -> Result<Self> {
        let logs_dir = logs_dir.into();
        fs::create_dir_all(&logs_dir)?;
        Ok(Self { logs_dir })
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    /// Current log file for `agent`
    pub fn log_path(&self, agent: &str) -> PathBuf {
        self.logs_dir.join(format!("{}.log", sanitize_log_name(agent)))
    }

    /// Previous generation `1..MAX_LOG_FILES`, 1 being the most recent
    pub fn previous_log_path(&self, agent: &str, generation: usize) -> Option<PathBuf> {
        (1..MAX_LOG_FILES).contains(&generation).then(|| {
            self.logs_dir
                .join(format!("{}.{}.log", sanitize_log_name(agent), generation))
        })
    }

    /// Shift every generation up by one, dropping the oldest
    pub fn rotate(&self, agent: &str) -> Result<()> {
        let last = MAX_LOG_FILES - 1;
        if let Some(oldest) = self.previous_log_path(agent, last) {
            remove_if_exists(&oldest)?;
        }

        for generation in (1..last).rev() {
            if let (Some(from), Some(to)) = (
                self.previous_log_path(agent, generation),
                self.previous_log_path(agent, generation + 1),
            ) {
                if from.exists() {
                    fs::rename(&from, &to)?;
                }
            }
        }

        let current = self.log_path(agent);
        if let Some(first) = self.previous_log_path(agent, 1) {
            if current.exists() {
                fs::rename(&current, &first)?;
            }
        }
        debug!("Rotated logs for {}", agent);
        Ok(())
    }

    /// Truncate or create the current log file for writing
    pub fn create(&self, agent: &str) -> Result<File> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.log_path(agent))?;
        Ok(file)
    }

    /// Agents with at least one log file, sorted
    pub fn list_agents(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.logs_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut agents = BTreeSet::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().to_string();
            let Some(stem) = file_name.strip_suffix(".log") else {
                continue;
            };
            let name = match stem.rsplit_once('.') {
                Some((name, generation)) if generation.parse::<usize>().is_ok() => name,
                _ => stem,
            };
            agents.insert(name.to_string());
        }
        Ok(agents.into_iter().collect())
    }

    /// Remove every generation of `agent`'s logs
    pub fn clean(&self, agent: &str) -> Result<()> {
        remove_if_exists(&self.log_path(agent))?;
        for generation in 1..MAX_LOG_FILES {
            if let Some(path) = self.previous_log_path(agent, generation) {
                remove_if_exists(&path)?;
            }
        }
        Ok(())
    }

    /// Sink factory for watch mode: every call rotates, then opens a fresh file
    pub fn sink_factory(&self, agent: &str) -> Arc<dyn LogSinkFactory> {
        let manager = self.clone();
        let agent = agent.to_string();
        Arc::new(move || -> Result<File> {
            manager.rotate(&agent)?;
            manager.create(&agent)
        })
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Base name only, `.py` stripped, anything outside `[A-Za-z0-9_-]` replaced by `_`
pub fn sanitize_log_name(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let base = base.strip_suffix(".py").unwrap_or(&base);

    let sanitized: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if sanitized.is_empty() {
        "unknown".to_string()
    } else {
        sanitized
    }
}
