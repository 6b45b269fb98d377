//! Persistent table of supervised processes

use crate::error::{Result, SupervisorError};
use crate::process_group::ProcessGroupController;
use crate::record::{HealthCheck, ProcessHandle, ProcessRecord, ProcessStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const CONFIG_VERSION: u32 = 1;

/// Source extensions stripped before deriving a process name
const SOURCE_EXTENSIONS: &[&str] = &["py", "ts", "js", "mjs", "java"];

/// On-disk layout of the state file
#[derive(Debug, Serialize, Deserialize)]
struct StoreSnapshot {
    processes: HashMap<String, ProcessRecord>,
    last_updated: DateTime<Utc>,
    config_version: u32,
}

/// In-memory process table mirrored to a JSON state file.
///
/// The store itself does no locking; the supervisor wraps it in a single mutex.
#[derive(Debug)]
pub struct ProcessStore {
    state_file: PathBuf,
    records: HashMap<String, ProcessRecord>,
}

impl ProcessStore {
    /// Empty store that will persist to `state_file`
    pub fn new(state_file: impl Into<PathBuf>) -> Self {
        Self {
            state_file: state_file.into(),
            records: HashMap::new(),
        }
    }

    /// Load the state file, adopting live processes and downgrading dead ones
    pub fn load(
        state_file: impl Into<PathBuf>,
        groups: &dyn ProcessGroupController,
    ) -> Result<Self> {
        let mut store = Self::new(state_file);

        let data = match std::fs::read_to_string(&store.state_file) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(store),
            Err(e) => {
                return Err(SupervisorError::State(format!(
                    "failed to read state file {}: {}",
                    store.state_file.display(),
                    e
                )));
            }
        };

        let snapshot: StoreSnapshot = serde_json::from_str(&data).map_err(|e| {
            SupervisorError::State(format!(
                "failed to parse state file {}: {}",
                store.state_file.display(),
                e
            ))
        })?;
        store.records = snapshot.processes;
        info!("Loaded state for {} processes", store.records.len());

        let dead = store.reconcile(groups);
        if !dead.is_empty() {
            store.save()?;
        }
        Ok(store)
    }

    /// Re-attach PIDs that are still alive; mark the rest stopped. Returns the names downgraded.
    pub fn reconcile(&mut self, groups: &dyn ProcessGroupController) -> Vec<String> {
        let mut dead = Vec::new();
        for (name, record) in self.records.iter_mut() {
            if record.status != ProcessStatus::Running {
                continue;
            }
            match (record.pid, &record.handle) {
                (_, Some(ProcessHandle::Owned(_))) => {}
                (Some(pid), _) if groups.is_alive(pid) => {
                    record.handle = Some(ProcessHandle::Adopted(pid));
                    record.last_seen = Utc::now();
                }
                _ => {
                    debug!("Process {} (PID: {:?}) is no longer running", name, record.pid);
                    record.mark_exited(ProcessStatus::Stopped, HealthCheck::Failed);
                    dead.push(name.clone());
                }
            }
        }
        dead
    }

    /// Persist the full table, replacing the state file atomically
    pub fn save(&self) -> Result<()> {
        if let Some(dir) = self.state_file.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| {
                SupervisorError::State(format!(
                    "failed to create state directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }

        let snapshot = StoreSnapshot {
            processes: self
                .records
                .iter()
                .map(|(name, record)| (name.clone(), record.snapshot()))
                .collect(),
            last_updated: Utc::now(),
            config_version: CONFIG_VERSION,
        };
        let data = serde_json::to_vec_pretty(&snapshot)?;

        let tmp = self.state_file.with_extension("json.tmp");
        std::fs::write(&tmp, data)
            .and_then(|_| std::fs::rename(&tmp, &self.state_file))
            .map_err(|e| {
                SupervisorError::State(format!(
                    "failed to write state file {}: {}",
                    self.state_file.display(),
                    e
                ))
            })
    }

    /// Persist, downgrading failures to a warning so the operation's own outcome stands
    pub fn save_or_warn(&self) {
        if let Err(e) = self.save() {
            warn!("Could not save process state: {}", e);
        }
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    pub fn get(&self, name: &str) -> Option<&ProcessRecord> {
        self.records.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ProcessRecord> {
        self.records.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.records.contains_key(name)
    }

    pub fn insert(&mut self, record: ProcessRecord) {
        self.records.insert(record.name.clone(), record);
    }

    pub fn remove(&mut self, name: &str) -> Option<ProcessRecord> {
        self.records.remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.records.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn records(&self) -> impl Iterator<Item = &ProcessRecord> {
        self.records.values()
    }

    pub fn records_mut(&mut self) -> impl Iterator<Item = &mut ProcessRecord> {
        self.records.values_mut()
    }

    /// Derive a process name for an agent file.
    ///
    /// Returns [`SupervisorError::AlreadyExists`] when the file is already tracked; a
    /// different file that normalizes to the same name gets a numeric suffix.
    pub fn derive_agent_name(&self, agent_file: &str) -> Result<String> {
        let base = base_process_name(agent_file);
        let mut name = base.clone();
        let mut counter = 1;

        while let Some(existing) = self.records.get(&name) {
            if existing.agent_file() == Some(agent_file) {
                return Err(SupervisorError::AlreadyExists(name));
            }
            name = format!("{base}_{counter}");
            counter += 1;
        }
        Ok(name)
    }
}

/// Strip the source extension and replace path separators and dots with underscores
pub fn base_process_name(agent_file: &str) -> String {
    let stem = Path::new(agent_file)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| SOURCE_EXTENSIONS.contains(ext))
        .map(|ext| &agent_file[..agent_file.len() - ext.len() - 1])
        .unwrap_or(agent_file);

    stem.replace(['/', '\\', '.'], "_")
}
