//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;
use uuid::Uuid;

/// syncd - state sync, task trees and locks for multi-client daemons
#[derive(Parser)]
#[command(
    name = "syncd",
    about = "State synchronization, hierarchical tasks and refcounted locks over a local socket",
    version = env!("GIT_DESCRIBE"),
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the daemon in the foreground
    Daemon {
        /// Submit a sample task tree that holds a lock while it runs
        #[arg(long)]
        demo: bool,
    },

    /// Ping the daemon to check if it's alive and responsive
    Ping,

    /// Inspect and mutate service state
    State {
        #[command(subcommand)]
        command: StateCommand,
    },

    /// Inspect and control running tasks
    Tasks {
        #[command(subcommand)]
        command: TasksCommand,
    },

    /// Inspect and abort lock keys
    Locks {
        #[command(subcommand)]
        command: LocksCommand,
    },
}

/// Service state subcommands
#[derive(Debug, Subcommand)]
pub enum StateCommand {
    /// List registered services and their checkpoints
    List {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Print the current snapshot of a service
    Sync {
        /// Service name
        service: String,

        /// Last checkpoint the caller has applied
        #[arg(short = 'k', long, default_value = "0")]
        checkpoint: u64,
    },

    /// Apply a mutation, given as JSON `{"type": ..., "payload": ...}`
    Commit {
        /// Service name
        service: String,

        /// Mutation JSON
        mutation: String,
    },

    /// Follow a service with a local replica, printing every change
    Watch {
        /// Service name
        service: String,
    },
}

/// Task subcommands
#[derive(Debug, Subcommand)]
pub enum TasksCommand {
    /// Print every active run as a tree
    List {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Follow task updates until interrupted
    Watch,

    /// Pause a run
    Pause {
        /// Run id
        id: Uuid,
    },

    /// Resume a paused run
    Resume {
        /// Run id
        id: Uuid,
    },

    /// Cancel a run
    Cancel {
        /// Run id
        id: Uuid,
    },
}

/// Lock subcommands
#[derive(Debug, Subcommand)]
pub enum LocksCommand {
    /// Print every lock key and its count
    List {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Force a lock key back to zero
    Abort {
        /// Lock key
        key: String,
    },
}

/// Get the log file path
pub fn get_log_path() -> PathBuf {
    debug!("get_log_path: called");
    let path = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("syncd")
        .join("logs")
        .join("syncd.log");
    debug!(?path, "get_log_path: returning path");
    path
}

/// Generate the after_help text with daemon status and log location
pub fn generate_after_help() -> String {
    debug!("generate_after_help: called");
    let socket_path = crate::ipc::get_socket_path();
    let daemon_running = socket_path.exists();

    let mut help = String::new();
    help.push_str("Daemon:\n");
    let daemon_icon = if daemon_running { "\u{2705}" } else { "\u{274C}" };
    let daemon_status = if daemon_running { "running" } else { "stopped" };
    help.push_str(&format!("  {} {} ({})\n", daemon_icon, daemon_status, socket_path.display()));

    help.push('\n');
    help.push_str(&format!("Logs are written to: {}\n", get_log_path().display()));
    help
}

/// Output format for list commands
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: text or json", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}
