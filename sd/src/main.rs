//! syncd - state sync, task trees and locks for multi-client daemons
//!
//! CLI entry point for running the daemon and talking to it.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{CommandFactory, FromArgMatches};
use colored::Colorize;
use eyre::{Context, Result};
use tracing::{debug, info};

use syncd::cli::{Cli, Command, LocksCommand, OutputFormat, StateCommand, TasksCommand, generate_after_help};
use syncd::config::Config;
use syncd::daemon::{Daemon, shutdown_signal};
use syncd::ipc::{self, Connection, DaemonClient};
use syncd::state::{
    ClientReplica, MutationEnvelope, ReplicaDriver, SETTINGS_SERVICE, SettingsState, StateModel, SyncSource,
};
use syncd::task::{TaskMirror, TaskNode, TaskOperation, TaskState};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Note: Can't log params here since logging isn't initialized yet
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("syncd")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Determine log level with priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(log_dir.join("syncd.log")).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Build command with dynamic after_help that shows daemon status
    let cmd = Cli::command().after_help(generate_after_help());
    let cli = Cli::from_arg_matches(&cmd.get_matches())?;

    // Load log level from config file early (before full config load)
    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Some(Command::Daemon { demo }) => cmd_daemon(&config, demo).await,
        Some(Command::Ping) => cmd_ping(&config).await,
        Some(Command::State { command }) => cmd_state(&config, command).await,
        Some(Command::Tasks { command }) => cmd_tasks(&config, command).await,
        Some(Command::Locks { command }) => cmd_locks(&config, command).await,
        None => {
            let mut cmd = Cli::command().after_help(generate_after_help());
            cmd.print_help()?;
            Ok(())
        }
    }
}

async fn cmd_daemon(config: &Config, demo: bool) -> Result<()> {
    debug!(demo, "cmd_daemon: called");
    let daemon = Daemon::new(config)?;
    println!(
        "{} listening on {} (Ctrl+C to stop)",
        "syncd".green().bold(),
        daemon.socket_path().display()
    );
    daemon.run(demo, shutdown_signal()).await?;
    println!("syncd stopped");
    Ok(())
}

async fn connect(config: &Config) -> Result<(Connection, tokio::sync::mpsc::UnboundedReceiver<ipc::Push>)> {
    let client = DaemonClient::from_config(&config.ipc);
    if !client.socket_exists() {
        return Err(eyre::eyre!(
            "syncd is not running (no socket at {})",
            client.socket_path().display()
        ));
    }
    client.connect().await
}

/// Ping the daemon via IPC to check if it's alive and responsive
async fn cmd_ping(config: &Config) -> Result<()> {
    debug!("cmd_ping: called");
    let client = DaemonClient::from_config(&config.ipc);
    if !client.socket_exists() {
        println!("{}", "syncd is not running".red());
        return Ok(());
    }

    match client.ping().await {
        Ok(version) => {
            println!("{}", "Daemon is alive and responsive".green());
            println!("Version: {}", version);
        }
        Err(e) => {
            println!("{}", "Socket exists but the daemon is not responding".yellow());
            println!("Error: {}", e);
        }
    }
    Ok(())
}

async fn cmd_state(config: &Config, command: StateCommand) -> Result<()> {
    debug!(?command, "cmd_state: called");
    let (connection, pushes) = connect(config).await?;

    match command {
        StateCommand::List { format } => {
            let services = connection.services().await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&services)?),
                OutputFormat::Text => {
                    for service in services {
                        let checkpoint = match service.checkpoint {
                            Some(c) => c.to_string(),
                            None => "reserved".yellow().to_string(),
                        };
                        println!("{:<24} {}", service.name.bold(), checkpoint);
                    }
                }
            }
        }
        StateCommand::Sync { service, checkpoint } => match connection.sync(&service, checkpoint).await? {
            Some(snapshot) => println!("{}", serde_json::to_string_pretty(&snapshot)?),
            None => println!("{}", format!("Service '{}' is not syncable", service).yellow()),
        },
        StateCommand::Commit { service, mutation } => {
            let envelope: MutationEnvelope =
                serde_json::from_str(&mutation).context("Mutation must be JSON like {\"type\": ..., \"payload\": ...}")?;
            match connection.commit(&service, envelope).await? {
                Some(checkpoint) => println!("Committed at checkpoint {}", checkpoint.to_string().green()),
                None => println!("{}", "Commit ignored by the daemon (see its log)".yellow()),
            }
        }
        StateCommand::Watch { service } => {
            let connection: Arc<dyn SyncSource> = Arc::new(connection);
            match service.as_str() {
                SETTINGS_SERVICE => watch::<SettingsState>(service.clone(), connection, pushes).await?,
                other => return Err(eyre::eyre!("No local state model for service '{}'", other)),
            }
        }
    }
    Ok(())
}

/// Follow one service with a [`ClientReplica`] until interrupted or disconnected
async fn watch<S: StateModel + std::fmt::Debug>(
    service: String,
    source: Arc<dyn SyncSource>,
    pushes: tokio::sync::mpsc::UnboundedReceiver<ipc::Push>,
) -> Result<()> {
    let mut replica = ClientReplica::<S>::new(service.clone());
    replica.on_mutation(|mutation, checkpoint| {
        println!("{} {:?}", format!("[{}]", checkpoint).cyan(), mutation);
    });
    println!("Watching {} (Ctrl+C to stop)", service.bold());

    let driver = ReplicaDriver::new(replica, source);
    tokio::select! {
        result = driver.run(ipc::commits_only(pushes)) => {
            let replica = result?;
            println!("{}", "Daemon closed the connection".yellow());
            if let Some(state) = replica.state() {
                println!("Last state at checkpoint {}: {:?}", replica.last_applied(), state);
            }
        }
        _ = tokio::signal::ctrl_c() => {}
    }
    Ok(())
}

async fn cmd_tasks(config: &Config, command: TasksCommand) -> Result<()> {
    debug!(?command, "cmd_tasks: called");
    let (connection, mut pushes) = connect(config).await?;

    let (operation, id) = match command {
        TasksCommand::List { format } => {
            let tasks = connection.task_subscribe().await?;
            connection.task_unsubscribe().await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&tasks)?),
                OutputFormat::Text => {
                    let mut mirror = TaskMirror::new(config.tasks.visible_children);
                    mirror.reset(tasks);
                    print_runs(&mirror.view());
                }
            }
            return Ok(());
        }
        TasksCommand::Watch => {
            let mut mirror = TaskMirror::new(config.tasks.visible_children);
            mirror.reset(connection.task_subscribe().await?);
            print_runs(&mirror.view());
            loop {
                tokio::select! {
                    push = pushes.recv() => match push {
                        Some(ipc::Push::TaskUpdate(batch)) => {
                            mirror.apply(&batch);
                            println!("{}", "---".dimmed());
                            print_runs(&mirror.view());
                        }
                        Some(_) => {}
                        None => {
                            println!("{}", "Daemon closed the connection".yellow());
                            return Ok(());
                        }
                    },
                    _ = tokio::signal::ctrl_c() => return Ok(()),
                }
            }
        }
        TasksCommand::Pause { id } => (TaskOperation::Pause, id),
        TasksCommand::Resume { id } => (TaskOperation::Resume, id),
        TasksCommand::Cancel { id } => (TaskOperation::Cancel, id),
    };

    if connection.task_operation(operation, id).await? {
        println!("{:?} sent to {}", operation, id);
    } else {
        println!("{}", format!("No active run with id {}", id).yellow());
    }
    Ok(())
}

fn print_runs(runs: &[TaskNode]) {
    if runs.is_empty() {
        println!("No active tasks");
        return;
    }
    for run in runs {
        print_node(run, 0);
    }
}

fn print_node(node: &TaskNode, depth: usize) {
    let info = &node.info;
    let state = match info.state {
        TaskState::Pending => info.state.to_string().normal(),
        TaskState::Running => info.state.to_string().blue(),
        TaskState::Paused => info.state.to_string().yellow(),
        TaskState::Succeed => info.state.to_string().green(),
        TaskState::Failed | TaskState::Cancelled => info.state.to_string().red(),
    };
    let progress = if info.total > 0 {
        format!(" {}/{}", info.progress, info.total)
    } else {
        String::new()
    };
    let id = if depth == 0 {
        format!(" {}", info.uuid.to_string().dimmed())
    } else {
        String::new()
    };
    println!("{}{} [{}]{}{}", "  ".repeat(depth), info.title, state, progress, id);
    if let Some(error) = &info.error {
        println!("{}  {}", "  ".repeat(depth), error.red());
    }
    for child in &node.children {
        print_node(child, depth + 1);
    }
}

async fn cmd_locks(config: &Config, command: LocksCommand) -> Result<()> {
    debug!(?command, "cmd_locks: called");
    let (connection, _pushes) = connect(config).await?;

    match command {
        LocksCommand::List { format } => {
            let counts = connection.semaphore().await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&counts)?),
                OutputFormat::Text => {
                    if counts.is_empty() {
                        println!("No lock keys");
                    }
                    for (key, count) in counts {
                        let count = if count > 0 {
                            count.to_string().yellow()
                        } else {
                            count.to_string().normal()
                        };
                        println!("{:<40} {}", key, count);
                    }
                }
            }
        }
        LocksCommand::Abort { key } => {
            let previous = connection.semaphore_abort(&key).await?;
            println!("Aborted {} (count was {})", key.bold(), previous);
        }
    }
    Ok(())
}
