//! meshctl - start, stop and watch MCP Mesh agents and the registry locally

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mesh_supervisor::watch::{CommandFactory, PreRestartCheck, WatchConfig, run_watch_session};
use mesh_supervisor::{
    AgentLauncher, DefaultLauncher, HealthMonitor, LogManager, MeshConfig, Metadata,
    MonitoringPolicy, ProcessRecord, ProcessSupervisor, RegistryOptions, RestartOptions,
    Supervisor, WatchTunables, base_process_name,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "meshctl")]
#[command(about = "Local process control for MCP Mesh agents", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an agent in the background
    Start {
        /// Agent source file
        agent_file: PathBuf,
    },
    /// Start the registry service
    Registry {
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        db_path: Option<String>,
    },
    /// Stop a process gracefully
    Stop {
        name: String,
        /// Seconds before escalating to SIGKILL
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Stop every agent, then the registry
    StopAll {
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Kill a process immediately
    Terminate {
        name: String,
        #[arg(long, default_value_t = 5)]
        timeout: u64,
    },
    /// Restart a process
    Restart {
        name: String,
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Show one process
    Status {
        name: String,
        #[arg(long)]
        json: bool,
    },
    /// List tracked processes
    List {
        #[arg(long)]
        json: bool,
    },
    /// Forget a process that is no longer running
    Remove { name: String },
    /// Mark processes that died on their own as stopped
    Cleanup,
    /// Run health checks until interrupted, restarting crashed processes
    Monitor {
        /// Seconds between sweeps
        #[arg(long, default_value_t = 30)]
        interval: u64,
        #[arg(long)]
        no_restart: bool,
    },
    /// Run an agent in watch mode, restarting it when sources change
    Watch {
        agent_file: PathBuf,
        /// Directory to watch; defaults to the agent file's directory
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Extra extensions to watch besides .py
        #[arg(long = "ext")]
        extensions: Vec<String>,
        /// Write output to ~/.mcp-mesh/logs instead of the terminal
        #[arg(long)]
        log_to_file: bool,
    },
    /// List agents with log files, or remove one agent's logs
    Logs {
        agent: Option<String>,
        #[arg(long, requires = "agent")]
        clean: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = MeshConfig::load().context("Failed to load configuration")?;
    let shutdown = |secs: Option<u64>| {
        secs.map(Duration::from_secs)
            .unwrap_or(config.shutdown_timeout)
    };
    let supervisor = || ProcessSupervisor::new(config.clone());

    match cli.command {
        Commands::Watch {
            agent_file,
            dir,
            extensions,
            log_to_file,
        } => watch(&config, agent_file, dir, extensions, log_to_file).await?,
        Commands::Logs { agent, clean } => {
            let logs = LogManager::new()?;
            match agent {
                Some(agent) if clean => {
                    logs.clean(&agent)?;
                    println!("Removed logs for {}", agent);
                }
                Some(agent) => println!("{}", logs.log_path(&agent).display()),
                None => {
                    for agent in logs.list_agents()? {
                        println!("{}", agent);
                    }
                }
            }
        }
        Commands::Start { agent_file } => {
            let record = supervisor()?.start_agent(&agent_file, Metadata::new()).await?;
            print_record(&record);
        }
        Commands::Registry { port, db_path } => {
            let record = supervisor()?
                .start_registry(RegistryOptions {
                    port,
                    db_path,
                    ..Default::default()
                })
                .await?;
            print_record(&record);
        }
        Commands::Stop { name, timeout } => {
            supervisor()?.stop(&name, shutdown(timeout)).await?;
            println!("Stopped {}", name);
        }
        Commands::StopAll { timeout } => {
            let errors = supervisor()?.stop_all(shutdown(timeout)).await;
            for e in &errors {
                eprintln!("{}", e);
            }
            if !errors.is_empty() {
                anyhow::bail!("{} processes failed to stop", errors.len());
            }
        }
        Commands::Terminate { name, timeout } => {
            supervisor()?.terminate(&name, Duration::from_secs(timeout)).await?;
            println!("Killed {}", name);
        }
        Commands::Restart { name, timeout } => {
            let record = supervisor()?
                .restart(
                    &name,
                    RestartOptions {
                        timeout: shutdown(timeout),
                        ..Default::default()
                    },
                )
                .await?;
            print_record(&record);
        }
        Commands::Status { name, json } => {
            let report = supervisor()?.status(&name).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_record(&report.record);
                if let Some(uptime) = report.uptime_secs {
                    println!("  uptime:   {}s", uptime);
                }
                if let Some(view) = report.registry {
                    match view.error {
                        Some(error) => println!("  registry: unreachable ({})", error),
                        None if view.registered => println!(
                            "  registry: {} (last heartbeat {:?})",
                            view.registry_status.unwrap_or_default(),
                            view.last_heartbeat
                        ),
                        None => println!("  registry: not registered"),
                    }
                }
            }
        }
        Commands::List { json } => {
            let records = supervisor()?.list().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No processes tracked");
            } else {
                for record in &records {
                    print_record(record);
                }
            }
        }
        Commands::Remove { name } => {
            if supervisor()?.remove(&name).await? {
                println!("Removed {}", name);
            } else {
                println!("{} is not tracked", name);
            }
        }
        Commands::Cleanup => {
            for name in supervisor()?.cleanup_dead().await {
                println!("{} is no longer running", name);
            }
        }
        Commands::Monitor {
            interval,
            no_restart,
        } => {
            let policy = MonitoringPolicy {
                check_interval: Duration::from_secs(interval.max(1)),
                restart_on_failure: !no_restart,
                ..Default::default()
            };
            let monitor = HealthMonitor::spawn(Arc::new(supervisor()?), policy);
            tokio::signal::ctrl_c().await?;
            monitor.stop().await;
        }
    }

    Ok(())
}

fn print_record(record: &ProcessRecord) {
    let pid = record
        .pid
        .map(|pid| pid.to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{:<24} {:<9} {:<8} pid {:<8} restarts {}",
        record.name,
        record.service_type.to_string(),
        record.status.to_string(),
        pid,
        record.restarts
    );
}

async fn watch(
    config: &MeshConfig,
    agent_file: PathBuf,
    dir: Option<PathBuf>,
    extensions: Vec<String>,
    log_to_file: bool,
) -> Result<()> {
    if !agent_file.exists() {
        anyhow::bail!("agent file {} does not exist", agent_file.display());
    }
    let name = base_process_name(&agent_file.to_string_lossy());
    let watch_dir = dir.unwrap_or_else(|| {
        agent_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    });

    let launcher = DefaultLauncher::default();
    let mut command = launcher.command_for(&agent_file)?;
    for (key, value) in config.agent_environment() {
        command = command.env(key, value);
    }
    let factory: Arc<dyn CommandFactory> = Arc::new(move || command.clone());
    tracing::info!(agent = %name, dir = %watch_dir.display(), "Watching for changes");

    let mut watch_config = WatchConfig::new(&name, watch_dir);
    watch_config.project_root = std::env::current_dir()?;
    watch_config.extensions.extend(extensions);
    if log_to_file {
        watch_config.log_sink = Some(LogManager::new()?.sink_factory(&name));
    }
    if agent_file.extension().is_some_and(|ext| ext == "py") {
        watch_config.pre_restart_check = Some(py_compile_check(launcher.python, agent_file));
    }
    let watch_config = watch_config.with_tunables(WatchTunables::from_env());

    run_watch_session(watch_config, factory).await?;
    Ok(())
}

/// Byte-compile the agent before replacing the running one
fn py_compile_check(python: String, agent_file: PathBuf) -> Arc<dyn PreRestartCheck> {
    Arc::new(move || -> Result<()> {
        let output = std::process::Command::new(&python)
            .args(["-m", "py_compile"])
            .arg(&agent_file)
            .output()
            .with_context(|| format!("Failed to run {}", python))?;
        if !output.status.success() {
            anyhow::bail!("{}", String::from_utf8_lossy(&output.stderr).trim());
        }
        Ok(())
    })
}
