//! Watch-mode controller: keeps one development agent alive and replaces it on change

use super::debounce::Debouncer;
use super::filter::WatchFilter;
use super::fs::{FileWatcher, FsEvents};
use crate::config::{DEFAULT_DEBOUNCE_DELAY, DEFAULT_PORT_DELAY, DEFAULT_STOP_TIMEOUT, WatchTunables};
use crate::error::{Result, SupervisorError};
use crate::launch::LaunchCommand;
use crate::logs::LogSinkFactory;
use crate::process_group::{ProcessGroupController, Termination, platform_controller};
use std::fs::File;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Directories skipped unless the caller says otherwise
pub const DEFAULT_EXCLUDE_DIRS: &[&str] = &["__pycache__", "node_modules", "venv", ".venv", "target"];

/// Builds the command for each process generation
pub trait CommandFactory: Send + Sync {
    fn command(&self) -> LaunchCommand;
}

impl<F> CommandFactory for F
where
    F: Fn() -> LaunchCommand + Send + Sync,
{
    fn command(&self) -> LaunchCommand {
        self()
    }
}

/// Validation run before the live process is replaced, e.g. a compile check
pub trait PreRestartCheck: Send + Sync {
    fn check(&self) -> anyhow::Result<()>;
}

impl<F> PreRestartCheck for F
where
    F: Fn() -> anyhow::Result<()> + Send + Sync,
{
    fn check(&self) -> anyhow::Result<()> {
        self()
    }
}

/// Settings for one watch session
#[derive(Clone)]
pub struct WatchConfig {
    /// Used in log messages only
    pub project_root: PathBuf,
    pub watch_dir: PathBuf,
    pub extensions: Vec<String>,
    pub exclude_dirs: Vec<String>,
    pub debounce_delay: Duration,
    /// Pause between killing the old process and starting the new one
    pub port_delay: Duration,
    pub stop_timeout: Duration,
    pub agent_name: String,
    /// Output goes to our own stdout/stderr when unset
    pub log_sink: Option<Arc<dyn LogSinkFactory>>,
    pub pre_restart_check: Option<Arc<dyn PreRestartCheck>>,
}

impl WatchConfig {
    pub fn new(agent_name: impl Into<String>, watch_dir: impl Into<PathBuf>) -> Self {
        let watch_dir = watch_dir.into();
        Self {
            project_root: watch_dir.clone(),
            watch_dir,
            extensions: vec![".py".to_string()],
            exclude_dirs: DEFAULT_EXCLUDE_DIRS.iter().map(|d| d.to_string()).collect(),
            debounce_delay: DEFAULT_DEBOUNCE_DELAY,
            port_delay: DEFAULT_PORT_DELAY,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            agent_name: agent_name.into(),
            log_sink: None,
            pre_restart_check: None,
        }
    }

    /// Apply environment tunables; a disabled pre-check drops any configured hook
    pub fn with_tunables(mut self, tunables: WatchTunables) -> Self {
        self.debounce_delay = tunables.debounce_delay;
        self.port_delay = tunables.port_delay;
        if !tunables.precheck_enabled {
            self.pre_restart_check = None;
        }
        self
    }
}

impl std::fmt::Debug for WatchConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchConfig")
            .field("project_root", &self.project_root)
            .field("watch_dir", &self.watch_dir)
            .field("extensions", &self.extensions)
            .field("exclude_dirs", &self.exclude_dirs)
            .field("debounce_delay", &self.debounce_delay)
            .field("port_delay", &self.port_delay)
            .field("stop_timeout", &self.stop_timeout)
            .field("agent_name", &self.agent_name)
            .field("log_sink", &self.log_sink.is_some())
            .field("pre_restart_check", &self.pre_restart_check.is_some())
            .finish()
    }
}

/// Controller lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Starting,
    Running,
    Restarting,
    Stopped,
}

impl std::fmt::Display for WatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchState::Starting => write!(f, "starting"),
            WatchState::Running => write!(f, "running"),
            WatchState::Restarting => write!(f, "restarting"),
            WatchState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Published state and live PID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchStatus {
    pub state: WatchState,
    pub pid: Option<u32>,
}

struct ExitNotice {
    generation: u64,
    status: std::io::Result<ExitStatus>,
}

#[derive(Debug, Clone, Copy)]
struct Generation {
    id: u64,
    pid: u32,
}

/// Watch-mode controller for one agent
pub struct AgentWatcher {
    config: WatchConfig,
    factory: Arc<dyn CommandFactory>,
    groups: Arc<dyn ProcessGroupController>,
}

impl AgentWatcher {
    pub fn new(config: WatchConfig, factory: Arc<dyn CommandFactory>) -> Self {
        Self {
            config,
            factory,
            groups: platform_controller(),
        }
    }

    pub fn with_groups(mut self, groups: Arc<dyn ProcessGroupController>) -> Self {
        self.groups = groups;
        self
    }

    /// Register the watches, spawn the first process and start the event loop.
    ///
    /// Failing to watch the directory or to spawn the first process ends the
    /// session here; later failures are logged and survived.
    pub async fn start(self) -> Result<WatchHandle> {
        let filter = Arc::new(WatchFilter::new(
            &self.config.extensions,
            self.config.exclude_dirs.iter().cloned(),
        ));
        let (fs, fs_events) = FileWatcher::new(&self.config.watch_dir, filter.clone())?;

        let (rebuild_tx, rebuild_rx) = mpsc::channel(1);
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(WatchStatus {
            state: WatchState::Starting,
            pid: None,
        });
        let stop = CancellationToken::new();
        let done = CancellationToken::new();

        let mut controller = Controller {
            debouncer: Debouncer::with_sender(self.config.debounce_delay, rebuild_tx.clone()),
            config: self.config,
            factory: self.factory,
            groups: self.groups,
            filter,
            fs,
            status_tx,
            exit_tx,
            stop: stop.clone(),
            current: None,
            lingering: None,
            generation: 0,
            log_sink: None,
        };
        controller.spawn_generation()?;
        info!(
            "Watch mode: watching {} for changes (project {})",
            controller.config.watch_dir.display(),
            controller.config.project_root.display()
        );
        controller.publish(WatchState::Running);

        let done_guard = done.clone().drop_guard();
        tokio::spawn(async move {
            let _done = done_guard;
            controller.run(fs_events, rebuild_rx, exit_rx).await;
        });

        Ok(WatchHandle {
            stop,
            done,
            status: status_rx,
            rebuild_tx,
        })
    }
}

/// Caller side of a running watch session
#[derive(Debug, Clone)]
pub struct WatchHandle {
    stop: CancellationToken,
    done: CancellationToken,
    status: watch::Receiver<WatchStatus>,
    rebuild_tx: mpsc::Sender<()>,
}

impl WatchHandle {
    /// Ask the session to shut down; safe to call more than once
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Resolves once the loop, the watcher and the log sink are closed
    pub async fn wait(&self) {
        self.done.cancelled().await;
    }

    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }

    /// PID of the live process, if any
    pub fn pid(&self) -> Option<u32> {
        self.status.borrow().pid
    }

    pub fn state(&self) -> WatchState {
        self.status.borrow().state
    }

    /// Receiver for state and PID changes
    pub fn subscribe(&self) -> watch::Receiver<WatchStatus> {
        self.status.clone()
    }

    /// Queue a rebuild as if a file had changed. Returns false if one is already queued.
    pub fn trigger_rebuild(&self) -> bool {
        self.rebuild_tx.try_send(()).is_ok()
    }
}

struct Controller {
    config: WatchConfig,
    factory: Arc<dyn CommandFactory>,
    groups: Arc<dyn ProcessGroupController>,
    filter: Arc<WatchFilter>,
    fs: FileWatcher,
    debouncer: Debouncer,
    status_tx: watch::Sender<WatchStatus>,
    exit_tx: mpsc::UnboundedSender<ExitNotice>,
    stop: CancellationToken,
    current: Option<Generation>,
    /// Process group of a generation whose leader exited on its own
    lingering: Option<u32>,
    generation: u64,
    log_sink: Option<File>,
}

impl Controller {
    async fn run(
        mut self,
        mut fs_events: FsEvents,
        mut rebuild_rx: mpsc::Receiver<()>,
        mut exit_rx: mpsc::UnboundedReceiver<ExitNotice>,
    ) {
        let stop = self.stop.clone();
        loop {
            tokio::select! {
                biased;

                _ = stop.cancelled() => break,
                Some(event) = fs_events.recv() => match event {
                    Ok(event) => self.on_fs_event(event),
                    Err(e) => warn!("Watch error: {}", e),
                },
                Some(()) = rebuild_rx.recv() => self.rebuild().await,
                Some(notice) = exit_rx.recv() => self.on_exit(notice),
            }
        }

        self.debouncer.cancel();
        self.terminate_current().await;
        self.log_sink = None;
        self.publish(WatchState::Stopped);
        info!("Watch mode stopped for {}", self.config.agent_name);
    }

    fn publish(&self, state: WatchState) {
        let pid = self.current.map(|g| g.pid);
        self.status_tx.send_replace(WatchStatus { state, pid });
    }

    fn state(&self) -> WatchState {
        self.status_tx.borrow().state
    }

    fn on_fs_event(&mut self, event: notify::Event) {
        if self.fs.track_new_dirs(&event) {
            return;
        }
        if self.filter.should_watch(&event) {
            debug!("Change detected: {:?}", event.paths);
            self.debouncer.poke();
        }
    }

    fn on_exit(&mut self, notice: ExitNotice) {
        match self.current {
            Some(current) if current.id == notice.generation => {
                match notice.status {
                    Ok(status) => info!(
                        "Agent {} exited ({}, PID: {}); waiting for changes",
                        self.config.agent_name, status, current.pid
                    ),
                    Err(e) => warn!("Lost track of agent {}: {}", self.config.agent_name, e),
                }
                self.current = None;
                self.lingering = Some(current.pid);
                self.log_sink = None;
                let state = self.state();
                self.publish(state);
            }
            _ => debug!("Ignoring exit of generation {}", notice.generation),
        }
    }

    async fn rebuild(&mut self) {
        self.publish(WatchState::Restarting);

        if let Some(check) = self.config.pre_restart_check.clone() {
            info!("Running pre-restart check for {}", self.config.agent_name);
            let failure = match tokio::task::spawn_blocking(move || check.check()).await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(SupervisorError::Validation(format!("{e:#}"))),
                Err(e) => Some(SupervisorError::Validation(e.to_string())),
            };
            if let Some(e) = failure {
                warn!("{}; keeping current agent running", e);
                self.publish(WatchState::Running);
                return;
            }
        }

        info!("Restarting agent {}", self.config.agent_name);
        self.terminate_current().await;
        self.log_sink = None;

        tokio::select! {
            _ = tokio::time::sleep(self.config.port_delay) => {}
            _ = self.stop.cancelled() => return,
        }

        if let Err(e) = self.spawn_generation() {
            error!("Failed to restart agent {}: {}", self.config.agent_name, e);
        }
        self.publish(WatchState::Running);
    }

    /// Spawn the next process generation with an OS-assigned HTTP port
    fn spawn_generation(&mut self) -> Result<()> {
        let launch = self.factory.command().env("MCP_MESH_HTTP_PORT", "0");
        let mut cmd = launch.to_command();

        if let Some(factory) = &self.config.log_sink {
            let sink = factory
                .create_sink()
                .and_then(|file| Ok((file.try_clone()?, file.try_clone()?, file)));
            match sink {
                Ok((stdout, stderr, file)) => {
                    cmd.stdout(stdout).stderr(stderr);
                    self.log_sink = Some(file);
                }
                Err(e) => warn!(
                    "Failed to create log file for {}: {}",
                    self.config.agent_name, e
                ),
            }
        }

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            name: self.config.agent_name.clone(),
            source,
        })?;
        let Some(pid) = child.id() else {
            return Err(SupervisorError::Spawn {
                name: self.config.agent_name.clone(),
                source: std::io::Error::other("process exited before its PID was read"),
            });
        };

        self.generation += 1;
        let generation = self.generation;
        let exit_tx = self.exit_tx.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            let _ = exit_tx.send(ExitNotice { generation, status });
        });

        self.current = Some(Generation { id: generation, pid });
        info!("Agent {} started (PID: {})", self.config.agent_name, pid);
        Ok(())
    }

    async fn terminate_current(&mut self) {
        if let Some(pgid) = self.lingering.take() {
            self.reclaim_group(pgid).await;
        }
        let Some(current) = self.current.take() else {
            return;
        };
        match self.groups.terminate(current.pid, self.config.stop_timeout).await {
            Ok(Termination::Killed) => warn!(
                "Agent {} ignored SIGTERM for {:?} and was killed (PID: {})",
                self.config.agent_name, self.config.stop_timeout, current.pid
            ),
            Ok(_) => info!("Agent {} stopped (PID: {})", self.config.agent_name, current.pid),
            Err(e) => warn!("Could not terminate agent {}: {}", self.config.agent_name, e),
        }
    }

    /// Terminate whatever an exited agent left running in its process group
    async fn reclaim_group(&self, pgid: u32) {
        if !self.groups.is_group_alive(pgid) {
            return;
        }
        info!(
            "Terminating leftover processes of agent {} (group {})",
            self.config.agent_name, pgid
        );
        match self.groups.terminate(pgid, self.config.stop_timeout).await {
            Ok(Termination::Killed) => warn!(
                "Leftover processes of agent {} were killed (group {})",
                self.config.agent_name, pgid
            ),
            Ok(_) => {}
            Err(e) => warn!(
                "Could not terminate process group {} of agent {}: {}",
                pgid, self.config.agent_name, e
            ),
        }
    }
}

/// Run a watch session until it is stopped or the user presses Ctrl-C
pub async fn run_watch_session(config: WatchConfig, factory: Arc<dyn CommandFactory>) -> Result<()> {
    let handle = AgentWatcher::new(config, factory).start().await?;

    tokio::select! {
        _ = handle.wait() => {}
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => {
                    info!("Interrupted, stopping watch mode");
                    handle.stop();
                }
                Err(e) => warn!("Could not listen for Ctrl-C: {}", e),
            }
            handle.wait().await;
        }
    }
    Ok(())
}
