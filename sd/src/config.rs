//! syncd configuration types and loading

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main syncd configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    /// Socket transport
    pub ipc: IpcConfig,

    /// Task execution and push batching
    pub tasks: TasksConfig,

    /// Lock table
    pub locks: LocksConfig,

    /// Service state store
    pub state: StateConfig,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .syncd.yml
        let local_config = PathBuf::from(".syncd.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/syncd/syncd.yml
        if let Some(user_config) = user_config_path()
            && user_config.exists()
        {
            match Self::load_from_file(&user_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read only `log-level`, before logging is set up
    ///
    /// Any failure yields `None`; the full load reports it later.
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        let candidates = match config_path {
            Some(path) => vec![path.clone()],
            None => [Some(PathBuf::from(".syncd.yml")), user_config_path()]
                .into_iter()
                .flatten()
                .collect(),
        };
        candidates
            .iter()
            .find(|p| p.exists())
            .and_then(|p| fs::read_to_string(p).ok())
            .and_then(|content| serde_yaml::from_str::<Config>(&content).ok())
            .and_then(|config| config.log_level)
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("syncd").join("syncd.yml"))
}

/// Socket transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    /// Socket path; defaults to `$XDG_RUNTIME_DIR/syncd/syncd.sock`
    #[serde(rename = "socket-path")]
    pub socket_path: Option<PathBuf>,

    /// Client request timeout in milliseconds
    #[serde(rename = "request-timeout-ms")]
    pub request_timeout_ms: u64,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            request_timeout_ms: 5000,
        }
    }
}

impl IpcConfig {
    pub fn socket_path(&self) -> PathBuf {
        self.socket_path.clone().unwrap_or_else(crate::ipc::get_socket_path)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Task execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TasksConfig {
    /// Interval between task-update pushes, in milliseconds
    #[serde(rename = "push-interval-ms")]
    pub push_interval_ms: u64,

    /// Maximum records in one task-update push
    #[serde(rename = "max-batch-size")]
    pub max_batch_size: usize,

    /// Children shown per parent
    #[serde(rename = "visible-children")]
    pub visible_children: usize,

    /// Task event bus capacity
    #[serde(rename = "event-capacity")]
    pub event_capacity: usize,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            push_interval_ms: 500,
            max_batch_size: 30,
            visible_children: 10,
            event_capacity: 1024,
        }
    }
}

impl TasksConfig {
    pub fn push_interval(&self) -> Duration {
        Duration::from_millis(self.push_interval_ms.max(1))
    }
}

/// Lock table configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocksConfig {
    /// Lock change broadcast capacity
    #[serde(rename = "event-capacity")]
    pub event_capacity: usize,
}

impl Default for LocksConfig {
    fn default() -> Self {
        Self { event_capacity: 256 }
    }
}

/// State store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Commit broadcast capacity
    #[serde(rename = "event-capacity")]
    pub event_capacity: usize,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self { event_capacity: 1024 }
    }
}
