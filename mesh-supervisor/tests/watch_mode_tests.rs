//! Watch-mode controller tests with real files and processes
#![cfg(unix)]

mod common;

use common::{assert_group_gone, group_has_live_members};
use mesh_supervisor::watch::{AgentWatcher, CommandFactory, WatchConfig, WatchHandle, WatchState};
use mesh_supervisor::{LaunchCommand, LogManager, ProcessGroupController, SignalGroupController};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tempfile::TempDir;

const SLEEPER: &str = "exec sleep 30";
const STUBBORN: &str = "trap '' TERM; sleep 60 & wait";

fn counting_factory(script: &'static str) -> (Arc<dyn CommandFactory>, Arc<AtomicUsize>) {
    let starts = Arc::new(AtomicUsize::new(0));
    let counter = starts.clone();
    let factory: Arc<dyn CommandFactory> = Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        LaunchCommand::new("sh").args(["-c", script])
    });
    (factory, starts)
}

fn watch_config(dir: &Path) -> WatchConfig {
    WatchConfig {
        extensions: vec![".py".to_string()],
        exclude_dirs: vec!["__pycache__".to_string()],
        debounce_delay: Duration::from_millis(500),
        port_delay: Duration::from_millis(50),
        stop_timeout: Duration::from_secs(2),
        ..WatchConfig::new("test-agent", dir)
    }
}

async fn wait_for_new_pid(handle: &WatchHandle, old: Option<u32>) -> Option<u32> {
    let mut status = handle.subscribe();
    let changed = tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|s| s.pid.is_some() && s.pid != old && s.state == WatchState::Running),
    )
    .await
    .expect("timed out waiting for a new process")
    .expect("watch session ended")
    .pid;
    changed
}

async fn stop_within(handle: &WatchHandle, limit: Duration) {
    let started = Instant::now();
    handle.stop();
    handle.stop();
    tokio::time::timeout(limit, handle.wait())
        .await
        .expect("watch session did not stop in time");
    assert!(started.elapsed() < limit);
    assert!(handle.is_done());
    assert_eq!(handle.state(), WatchState::Stopped);
    assert_eq!(handle.pid(), None);
}

async fn assert_gone(pid: u32) {
    for _ in 0..40 {
        if !SignalGroupController.is_alive(pid) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("process {pid} is still alive");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_python_change_restarts_once_and_cache_is_ignored() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    std::fs::create_dir_all(dir.path().join("__pycache__")).unwrap();
    std::fs::write(dir.path().join("agent.py"), "v = 1\n").unwrap();

    let (factory, starts) = counting_factory(SLEEPER);
    let config = watch_config(dir.path());
    let stop_timeout = config.stop_timeout;
    let handle = AgentWatcher::new(config, factory).start().await.unwrap();
    let first = handle.pid().expect("initial process");
    assert_eq!(handle.state(), WatchState::Running);

    std::fs::write(dir.path().join("__pycache__/agent.py"), "cached\n").unwrap();
    std::fs::write(dir.path().join("notes.txt"), "ignored\n").unwrap();
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(starts.load(Ordering::SeqCst), 1);
    assert_eq!(handle.pid(), Some(first));

    let written = Instant::now();
    std::fs::write(dir.path().join("agent.py"), "v = 2\n").unwrap();
    let second = wait_for_new_pid(&handle, Some(first)).await.unwrap();
    assert!(written.elapsed() >= Duration::from_millis(450));
    assert_ne!(second, first);
    assert_gone(first).await;

    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(starts.load(Ordering::SeqCst), 2);

    stop_within(&handle, stop_timeout + Duration::from_secs(1)).await;
    assert_gone(second).await;
    assert_group_gone(second).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_precheck_keeps_process() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let (factory, starts) = counting_factory(SLEEPER);

    let checks = Arc::new(AtomicUsize::new(0));
    let counter = checks.clone();
    let config = WatchConfig {
        pre_restart_check: Some(Arc::new(move || -> anyhow::Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("SyntaxError: invalid syntax")
        })),
        ..watch_config(dir.path())
    };
    let handle = AgentWatcher::new(config, factory).start().await.unwrap();
    let first = handle.pid();

    let mut status = handle.subscribe();
    assert!(handle.trigger_rebuild());
    tokio::time::timeout(Duration::from_secs(5), async {
        while checks.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        status
            .wait_for(|s| s.state == WatchState::Running)
            .await
            .unwrap();
    })
    .await
    .expect("rebuild cycle did not finish");

    assert_eq!(handle.pid(), first);
    assert_eq!(starts.load(Ordering::SeqCst), 1);
    assert!(SignalGroupController.is_alive(first.unwrap()));

    stop_within(&handle, Duration::from_secs(3)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_passing_precheck_yields_new_pid() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let (factory, starts) = counting_factory(SLEEPER);
    let config = WatchConfig {
        pre_restart_check: Some(Arc::new(|| -> anyhow::Result<()> { Ok(()) })),
        ..watch_config(dir.path())
    };
    let handle = AgentWatcher::new(config, factory).start().await.unwrap();
    let first = handle.pid();

    assert!(handle.trigger_rebuild());
    let second = wait_for_new_pid(&handle, first).await;
    assert_ne!(second, first);
    assert_eq!(starts.load(Ordering::SeqCst), 2);

    stop_within(&handle, Duration::from_secs(3)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_exit_is_not_restarted_until_change() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let (factory, starts) = counting_factory("sleep 0.2");
    let handle = AgentWatcher::new(watch_config(dir.path()), factory)
        .start()
        .await
        .unwrap();

    let mut status = handle.subscribe();
    tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| s.pid.is_none()))
        .await
        .expect("process did not exit")
        .unwrap();

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(starts.load(Ordering::SeqCst), 1);
    assert_eq!(handle.state(), WatchState::Running);
    assert_eq!(handle.pid(), None);

    assert!(handle.trigger_rebuild());
    wait_for_new_pid(&handle, None).await;
    assert_eq!(starts.load(Ordering::SeqCst), 2);

    stop_within(&handle, Duration::from_secs(3)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_output_goes_to_rotated_log() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let logs = LogManager::with_dir(dir.path().join("logs")).unwrap();
    let (factory, _starts) =
        counting_factory("echo \"port=$MCP_MESH_HTTP_PORT\"; exec sleep 30");
    let watched = dir.path().join("src");
    std::fs::create_dir_all(&watched).unwrap();

    let config = WatchConfig {
        log_sink: Some(logs.sink_factory("test-agent")),
        ..watch_config(&watched)
    };
    let handle = AgentWatcher::new(config, factory).start().await.unwrap();
    let first = handle.pid();

    let current = logs.log_path("test-agent");
    let mut contents = String::new();
    for _ in 0..100 {
        contents = std::fs::read_to_string(&current).unwrap_or_default();
        if !contents.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(contents.trim(), "port=0");

    assert!(handle.trigger_rebuild());
    wait_for_new_pid(&handle, first).await;

    let previous = logs.previous_log_path("test-agent", 1).unwrap();
    assert_eq!(std::fs::read_to_string(previous).unwrap().trim(), "port=0");

    stop_within(&handle, Duration::from_secs(3)).await;
}

#[tokio::test]
async fn test_initial_spawn_failure_ends_session() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let factory: Arc<dyn CommandFactory> =
        Arc::new(|| LaunchCommand::new("/definitely/not/a/binary"));

    let result = AgentWatcher::new(watch_config(dir.path()), factory)
        .start()
        .await;
    assert!(matches!(
        result,
        Err(mesh_supervisor::SupervisorError::Spawn { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_reclaims_group_of_exited_agent() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let (factory, _starts) = counting_factory("sleep 60 & exit 0");
    let handle = AgentWatcher::new(watch_config(dir.path()), factory)
        .start()
        .await
        .unwrap();
    let pgid = handle.pid().expect("initial process");

    let mut status = handle.subscribe();
    tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| s.pid.is_none()))
        .await
        .expect("leader did not exit")
        .unwrap();
    // The backgrounded sleep outlives its leader
    assert!(group_has_live_members(pgid));

    // Unreaped orphans can hold the group until the SIGKILL escalation
    stop_within(&handle, Duration::from_secs(4)).await;
    assert_group_gone(pgid).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rebuild_reclaims_group_of_exited_agent() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let (factory, _starts) = counting_factory("sleep 60 & exit 0");
    let handle = AgentWatcher::new(watch_config(dir.path()), factory)
        .start()
        .await
        .unwrap();
    let pgid = handle.pid().expect("initial process");

    let mut status = handle.subscribe();
    tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| s.pid.is_none()))
        .await
        .expect("leader did not exit")
        .unwrap();

    assert!(handle.trigger_rebuild());
    let next = wait_for_new_pid(&handle, Some(pgid)).await;
    assert_group_gone(pgid).await;

    stop_within(&handle, Duration::from_secs(3)).await;
    if let Some(next) = next {
        assert_group_gone(next).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_respawn_keeps_session_recoverable() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let starts = Arc::new(AtomicUsize::new(0));
    let counter = starts.clone();
    let factory: Arc<dyn CommandFactory> = Arc::new(move || {
        if counter.fetch_add(1, Ordering::SeqCst) == 1 {
            LaunchCommand::new("/definitely/not/a/binary")
        } else {
            LaunchCommand::new("sh").args(["-c", SLEEPER])
        }
    });
    let handle = AgentWatcher::new(watch_config(dir.path()), factory)
        .start()
        .await
        .unwrap();
    let first = handle.pid().expect("initial process");

    let mut status = handle.subscribe();
    assert!(handle.trigger_rebuild());
    tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|s| s.state == WatchState::Running && s.pid.is_none()),
    )
    .await
    .expect("failed respawn was not reported")
    .unwrap();
    assert_eq!(starts.load(Ordering::SeqCst), 2);
    assert!(!handle.is_done());
    assert_gone(first).await;

    assert!(handle.trigger_rebuild());
    let recovered = wait_for_new_pid(&handle, None).await;
    assert!(recovered.is_some());
    assert_eq!(starts.load(Ordering::SeqCst), 3);

    stop_within(&handle, Duration::from_secs(3)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_kills_group_that_ignores_sigterm() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let (factory, _starts) = counting_factory(STUBBORN);
    let config = watch_config(dir.path());
    let stop_timeout = config.stop_timeout;
    let handle = AgentWatcher::new(config, factory).start().await.unwrap();
    let pgid = handle.pid().expect("initial process");
    // Let the shell install its trap and fork the child
    tokio::time::sleep(Duration::from_millis(200)).await;

    stop_within(&handle, stop_timeout + Duration::from_secs(2)).await;
    assert_group_gone(pgid).await;
}
