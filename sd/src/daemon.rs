//! Daemon lifecycle
//!
//! Builds the [`Hub`], registers the built-in services, serves the socket
//! until a shutdown signal and removes the socket afterwards.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use eyre::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::hub::Hub;
use crate::ipc;
use crate::lock::ReadWriteLock;
use crate::state::{SETTINGS_SERVICE, SettingsState, StateHandle};
use crate::task::{TaskContext, TaskError};

/// Lock key the demo run holds while it works
pub const DEMO_LOCK_KEY: &str = "instance:/demo";

pub struct Daemon {
    hub: Arc<Hub>,
    socket_path: PathBuf,
    settings: StateHandle<SettingsState>,
}

impl Daemon {
    pub fn new(config: &Config) -> Result<Self> {
        debug!("Daemon::new: called");
        let hub = Arc::new(Hub::new(config));
        let settings = hub
            .state()
            .register(SETTINGS_SERVICE, SettingsState::default())
            .context("Failed to register settings service")?;
        settings.subscribe_all(|mutation| info!(?mutation, "Settings changed"));

        Ok(Self {
            hub,
            socket_path: config.ipc.socket_path(),
            settings,
        })
    }

    pub fn hub(&self) -> Arc<Hub> {
        self.hub.clone()
    }

    pub fn settings(&self) -> &StateHandle<SettingsState> {
        &self.settings
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    /// Serve clients until `shutdown` resolves
    pub async fn run<F>(self, demo: bool, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let (listener, socket_path) = ipc::create_listener_at(&self.socket_path)?;
        info!(?socket_path, "IPC socket listening");

        let demo_handle = demo.then(|| spawn_demo(self.hub.clone()));
        if demo_handle.is_some() {
            info!("Demo tasks enabled");
        }

        let result = ipc::serve(listener, self.hub.clone(), shutdown).await;

        if let Some(handle) = demo_handle {
            debug!("Daemon::run: stopping demo");
            handle.abort();
        }
        debug!("Daemon::run: cleaning up IPC socket");
        ipc::cleanup_socket(&socket_path);
        result
    }
}

/// Resolves on SIGINT or SIGTERM
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => warn!("SIGINT received"),
                    _ = sigterm.recv() => warn!("SIGTERM received"),
                }
            }
            _ => {
                warn!("Failed to install signal handlers, falling back to ctrl_c");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Submit a sample install run over and over until aborted
pub fn spawn_demo(hub: Arc<Hub>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let lock = ReadWriteLock::new(hub.locks().clone(), DEMO_LOCK_KEY);
            let handle = hub.tasks().submit("Install demo instance", move |ctx| async move {
                let _guard = lock.acquire_write().await;
                ctx.set_endpoints(Some("https://example.invalid/demo".to_string()), Some("/games/demo".to_string()));

                let assets = ctx.spawn("Download assets", |ctx| step(ctx, 40, 150));
                let libraries = ctx.spawn("Link libraries", |ctx| step(ctx, 12, 300));
                let total = assets.await? + libraries.await?;
                ctx.update(total, total);
                Ok::<_, eyre::Report>(total)
            });

            match handle.await {
                Ok(total) => info!(total, "Demo run finished"),
                Err(TaskError::Cancelled) => info!("Demo run cancelled"),
                Err(e) => warn!(error = %e, "Demo run failed"),
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    })
}

async fn step(ctx: TaskContext, steps: u64, delay_ms: u64) -> Result<u64> {
    for done in 1..=steps {
        ctx.checkpoint().await?;
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        ctx.update_chunk(done, steps, 1);
    }
    Ok(steps)
}
