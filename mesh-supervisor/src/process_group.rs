//! Process-group termination with graceful-then-forced escalation
//!
//! Every supervised process is spawned as the leader of its own process group
//! (PGID == PID), so signalling the group also reaches anything the agent
//! spawned itself. The rest of the crate only relies on
//! [`ProcessGroupController::terminate`] and the small signal primitives below.

use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Interval between "is the group still there" probes
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How a termination request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Nothing was left to signal
    AlreadyExited,
    /// The group exited after the graceful signal
    Graceful,
    /// The group outlived the timeout and was force-killed
    Killed,
}

/// Platform-specific control over a process and its group
#[async_trait]
pub trait ProcessGroupController: Send + Sync {
    /// Ask the group led by `pid` to shut down. Returns false if nothing was there.
    fn signal_graceful(&self, pid: u32) -> Result<bool>;

    /// Kill the group led by `pid` outright. Returns false if nothing was there.
    fn force_kill(&self, pid: u32) -> Result<bool>;

    /// Whether the single process `pid` exists
    fn is_alive(&self, pid: u32) -> bool;

    /// Whether any member of the group led by `pid` exists
    fn is_group_alive(&self, pid: u32) -> bool;

    /// Graceful signal, poll until the group is gone, force-kill after `timeout`
    async fn terminate(&self, pid: u32, timeout: Duration) -> Result<Termination> {
        if !self.signal_graceful(pid)? {
            debug!("Process group {} already gone", pid);
            return Ok(Termination::AlreadyExited);
        }

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if !self.is_group_alive(pid) && !self.is_alive(pid) {
                return Ok(Termination::Graceful);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        warn!("Process group {} still alive after {:?}, sending SIGKILL", pid, timeout);
        self.force_kill(pid)?;
        Ok(Termination::Killed)
    }
}

/// Controller for the platform this binary was built for
pub fn platform_controller() -> Arc<dyn ProcessGroupController> {
    #[cfg(unix)]
    {
        Arc::new(unix::SignalGroupController)
    }
    #[cfg(windows)]
    {
        Arc::new(windows::TaskkillGroupController)
    }
}

#[cfg(unix)]
pub use unix::SignalGroupController;

#[cfg(unix)]
mod unix {
    use super::ProcessGroupController;
    use crate::error::Result;
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill, killpg};
    use nix::unistd::Pid;

    /// POSIX signals delivered to the whole process group
    #[derive(Debug, Default, Clone, Copy)]
    pub struct SignalGroupController;

    impl SignalGroupController {
        fn deliver(&self, pid: u32, signal: Signal) -> Result<bool> {
            let pid = Pid::from_raw(pid as i32);
            match killpg(pid, signal) {
                Ok(()) => Ok(true),
                // Not a group leader (adopted from an older state file); fall back to the process
                Err(Errno::ESRCH) => match kill(pid, signal) {
                    Ok(()) => Ok(true),
                    Err(Errno::ESRCH) => Ok(false),
                    Err(e) => Err(e.into()),
                },
                Err(e) => Err(e.into()),
            }
        }
    }

    fn probe(result: nix::Result<()>) -> bool {
        matches!(result, Ok(()) | Err(Errno::EPERM))
    }

    impl ProcessGroupController for SignalGroupController {
        fn signal_graceful(&self, pid: u32) -> Result<bool> {
            self.deliver(pid, Signal::SIGTERM)
        }

        fn force_kill(&self, pid: u32) -> Result<bool> {
            self.deliver(pid, Signal::SIGKILL)
        }

        fn is_alive(&self, pid: u32) -> bool {
            probe(kill(Pid::from_raw(pid as i32), None))
        }

        fn is_group_alive(&self, pid: u32) -> bool {
            probe(killpg(Pid::from_raw(pid as i32), None))
        }
    }
}

#[cfg(windows)]
mod windows {
    use super::ProcessGroupController;
    use crate::error::Result;
    use std::process::{Command, Stdio};

    /// Tree termination through `taskkill /T`
    #[derive(Debug, Default, Clone, Copy)]
    pub struct TaskkillGroupController;

    impl TaskkillGroupController {
        fn taskkill(&self, pid: u32, force: bool) -> Result<bool> {
            if !self.is_alive(pid) {
                return Ok(false);
            }
            let mut cmd = Command::new("taskkill");
            cmd.args(["/PID", &pid.to_string(), "/T"]);
            if force {
                cmd.arg("/F");
            }
            let status = cmd.stdout(Stdio::null()).stderr(Stdio::null()).status()?;
            Ok(status.success())
        }
    }

    impl ProcessGroupController for TaskkillGroupController {
        fn signal_graceful(&self, pid: u32) -> Result<bool> {
            self.taskkill(pid, false)
        }

        fn force_kill(&self, pid: u32) -> Result<bool> {
            self.taskkill(pid, true)
        }

        fn is_alive(&self, pid: u32) -> bool {
            Command::new("tasklist")
                .args(["/FI", &format!("PID eq {pid}"), "/NH"])
                .output()
                .map(|out| String::from_utf8_lossy(&out.stdout).contains(&pid.to_string()))
                .unwrap_or(false)
        }

        fn is_group_alive(&self, pid: u32) -> bool {
            self.is_alive(pid)
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    fn spawn_group(script: &str) -> tokio::process::Child {
        Command::new("sh")
            .args(["-c", script])
            .stdout(Stdio::null())
            .process_group(0)
            .spawn()
            .expect("spawn sh")
    }

    #[tokio::test]
    async fn test_terminate_graceful() {
        let mut child = spawn_group("exec sleep 30");
        let pid = child.id().unwrap();
        let reaper = tokio::spawn(async move { child.wait().await });

        let controller = SignalGroupController;
        let outcome = controller.terminate(pid, Duration::from_secs(3)).await.unwrap();
        assert_eq!(outcome, Termination::Graceful);
        assert!(reaper.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        let mut child = spawn_group("trap '' TERM; sleep 30 & wait");
        let pid = child.id().unwrap();
        let reaper = tokio::spawn(async move { child.wait().await });

        let controller = SignalGroupController;
        let started = std::time::Instant::now();
        let outcome = controller.terminate(pid, Duration::from_millis(300)).await.unwrap();
        assert_eq!(outcome, Termination::Killed);
        assert!(started.elapsed() < Duration::from_secs(2));

        assert!(reaper.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_terminate_missing_process() {
        let mut child = spawn_group("exit 0");
        let pid = child.id().unwrap();
        child.wait().await.unwrap();

        let outcome = SignalGroupController
            .terminate(pid, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(outcome, Termination::AlreadyExited);
    }
}
