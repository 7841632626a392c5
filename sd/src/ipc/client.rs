//! IPC client for communicating with the daemon
//!
//! [`DaemonClient`] holds the socket path and timeout; [`DaemonClient::connect`]
//! opens a long-lived [`Connection`] that correlates responses by id and hands
//! pushes to an mpsc receiver.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use eyre::{Context, Result};
use tokio::io::BufReader;
use tokio::net::UnixStream;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::messages::{ClientFrame, MAX_FRAME_SIZE, MAX_SERVER_FRAME_SIZE, Push, Request, Response, ServerFrame};
use super::{get_socket_path, read_frame, write_frame};
use crate::config::IpcConfig;
use crate::state::{Commit, MutationEnvelope, ServiceInfo, Snapshot, SyncSource};
use crate::task::{TaskNode, TaskOperation};

/// Default timeout for IPC operations
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>;

/// Client for communicating with the daemon via IPC
#[derive(Debug, Clone)]
pub struct DaemonClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl Default for DaemonClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonClient {
    /// Create a new client with the default socket path
    pub fn new() -> Self {
        Self {
            socket_path: get_socket_path(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Create a client with a custom socket path
    pub fn with_socket_path(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Socket path and timeout from the `ipc` config section
    pub fn from_config(config: &IpcConfig) -> Self {
        Self::with_socket_path(config.socket_path()).with_timeout(config.request_timeout())
    }

    /// Set a custom timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    /// Check if the daemon socket exists
    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    /// Open a connection; pushes arrive on the returned receiver
    pub async fn connect(&self) -> Result<(Connection, mpsc::UnboundedReceiver<Push>)> {
        debug!(?self.socket_path, "DaemonClient: connecting");
        let stream = tokio::time::timeout(self.timeout, UnixStream::connect(&self.socket_path))
            .await
            .context("Connection timeout")?
            .context("Failed to connect to daemon socket")?;

        let (read_half, write_half) = stream.into_split();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (push_tx, push_rx) = mpsc::unbounded_channel();

        let reader_pending = pending.clone();
        let reader = tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            loop {
                let line = match read_frame(&mut reader, MAX_SERVER_FRAME_SIZE).await {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        debug!("Connection: daemon closed the socket");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Connection: read failed");
                        break;
                    }
                };
                match serde_json::from_str::<ServerFrame>(line.trim()) {
                    Ok(ServerFrame::Response { id, response }) => {
                        let waiter = reader_pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
                        match waiter {
                            Some(waiter) => {
                                let _ = waiter.send(response);
                            }
                            None => debug!(id, "Connection: response for unknown request"),
                        }
                    }
                    Ok(ServerFrame::Push { push }) => {
                        // Responses still need routing after the push receiver is dropped
                        let _ = push_tx.send(push);
                    }
                    Err(e) => warn!(error = %e, "Connection: failed to parse frame"),
                }
            }
            // Fail every outstanding request
            reader_pending.lock().unwrap_or_else(|e| e.into_inner()).clear();
        });

        let connection = Connection {
            writer: tokio::sync::Mutex::new(write_half),
            pending,
            next_id: AtomicU64::new(1),
            timeout: self.timeout,
            reader,
        };
        Ok((connection, push_rx))
    }

    /// Check if daemon is alive and get its version
    pub async fn ping(&self) -> Result<String> {
        debug!("DaemonClient: pinging daemon");
        let (connection, _pushes) = self.connect().await?;
        connection.ping().await
    }
}

/// One open connection to the daemon
pub struct Connection {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Pending,
    next_id: AtomicU64,
    timeout: Duration,
    reader: JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn unexpected(response: Response) -> eyre::Report {
    match response {
        Response::Error { message } => eyre::eyre!("Daemon error: {}", message),
        other => eyre::eyre!("Unexpected response: {:?}", other),
    }
}

impl Connection {
    /// Send a request and wait for its response
    pub async fn request(&self, request: Request) -> Result<Response> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        debug!(id, ?request, "Connection: sending request");

        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).insert(id, tx);

        let frame = ClientFrame { id, request };
        let result = tokio::time::timeout(self.timeout, async {
            {
                let mut writer = self.writer.lock().await;
                write_frame(&mut *writer, &frame, MAX_FRAME_SIZE).await?;
            }
            rx.await.map_err(|_| eyre::eyre!("Connection closed"))
        })
        .await
        .unwrap_or_else(|_| Err(eyre::eyre!("Request timeout")));

        match result {
            Ok(response) => {
                debug!(id, ?response, "Connection: received response");
                Ok(response)
            }
            Err(e) => {
                self.pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
                Err(e)
            }
        }
    }

    pub async fn ping(&self) -> Result<String> {
        match self.request(Request::Ping).await? {
            Response::Pong { version } => Ok(version),
            other => Err(unexpected(other)),
        }
    }

    /// Apply a mutation; `None` when the daemon ignored it
    pub async fn commit(&self, service: &str, mutation: MutationEnvelope) -> Result<Option<u64>> {
        let request = Request::Commit {
            service: service.to_string(),
            mutation,
        };
        match self.request(request).await? {
            Response::Committed { checkpoint } => Ok(checkpoint),
            other => Err(unexpected(other)),
        }
    }

    pub async fn services(&self) -> Result<Vec<ServiceInfo>> {
        match self.request(Request::Services).await? {
            Response::Services { services } => Ok(services),
            other => Err(unexpected(other)),
        }
    }

    /// Start task-update pushes and get the current trees
    pub async fn task_subscribe(&self) -> Result<Vec<TaskNode>> {
        match self.request(Request::TaskSubscribe).await? {
            Response::Tasks { tasks } => Ok(tasks),
            other => Err(unexpected(other)),
        }
    }

    pub async fn task_unsubscribe(&self) -> Result<()> {
        match self.request(Request::TaskUnsubscribe).await? {
            Response::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Returns false when the daemon does not know the run
    pub async fn task_operation(&self, operation: TaskOperation, id: Uuid) -> Result<bool> {
        match self.request(Request::TaskOperation { operation, id }).await? {
            Response::TaskOperation { found } => Ok(found),
            other => Err(unexpected(other)),
        }
    }

    pub async fn semaphore(&self) -> Result<BTreeMap<String, usize>> {
        match self.request(Request::Semaphore).await? {
            Response::Semaphores { counts } => Ok(counts),
            other => Err(unexpected(other)),
        }
    }

    pub async fn semaphore_abort(&self, key: &str) -> Result<usize> {
        let request = Request::SemaphoreAbort { key: key.to_string() };
        match self.request(request).await? {
            Response::Aborted { previous } => Ok(previous),
            other => Err(unexpected(other)),
        }
    }
}

#[async_trait]
impl SyncSource for Connection {
    async fn sync(&self, service: &str, last_checkpoint: u64) -> Result<Option<Snapshot>> {
        let request = Request::Sync {
            service: service.to_string(),
            checkpoint: last_checkpoint,
        };
        match self.request(request).await? {
            Response::Snapshot { snapshot } => Ok(snapshot),
            other => Err(unexpected(other)),
        }
    }
}

/// Keep only the commit pushes, in order
///
/// The returned stream closes when `pushes` does.
pub fn commits_only(mut pushes: mpsc::UnboundedReceiver<Push>) -> mpsc::Receiver<Commit> {
    let (tx, rx) = mpsc::channel(256);
    tokio::spawn(async move {
        while let Some(push) = pushes.recv().await {
            if let Push::Commit(commit) = push
                && tx.send(commit).await.is_err()
            {
                break;
            }
        }
    });
    rx
}
