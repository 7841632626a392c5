//! IPC server for the daemon side
//!
//! Binds the socket, accepts clients and bridges each connection to the [`Hub`].

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use eyre::{Context, Result};
use tokio::io::{AsyncWrite, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::messages::{ClientFrame, MAX_FRAME_SIZE, MAX_SERVER_FRAME_SIZE, Push, Response, ServerFrame};
use super::{encode_frame, get_socket_path, read_frame, write_line};
use crate::hub::{Hub, PushSink};

/// Create and bind a Unix Domain Socket listener for the daemon
///
/// Handles cleanup of stale socket files from previous runs.
pub fn create_listener() -> Result<(UnixListener, PathBuf)> {
    let socket_path = get_socket_path();
    create_listener_at(&socket_path)
}

/// Create a listener at a specific path
pub fn create_listener_at(socket_path: &PathBuf) -> Result<(UnixListener, PathBuf)> {
    debug!(?socket_path, "create_listener: creating IPC socket");

    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create socket directory")?;
    }

    if socket_path.exists() {
        debug!(?socket_path, "create_listener: removing stale socket");
        std::fs::remove_file(socket_path).context("Failed to remove stale socket")?;
    }

    let listener = UnixListener::bind(socket_path).context("Failed to bind IPC socket")?;
    debug!(?socket_path, "create_listener: socket bound successfully");

    Ok((listener, socket_path.clone()))
}

/// Remove the socket file on shutdown
pub fn cleanup_socket(socket_path: &PathBuf) {
    if socket_path.exists() {
        debug!(?socket_path, "cleanup_socket: removing socket file");
        if let Err(e) = std::fs::remove_file(socket_path) {
            warn!(?socket_path, error = %e, "Failed to remove socket file");
        }
    }
}

/// Accept clients until `shutdown` resolves
pub async fn serve<F>(listener: UnixListener, hub: Arc<Hub>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send,
{
    info!("IPC server accepting connections");
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("IPC server shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, _) = accepted.context("Failed to accept IPC connection")?;
                let hub = hub.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, hub).await {
                        warn!(error = %e, "IPC connection ended with error");
                    }
                });
            }
        }
    }
}

/// Pushes for one connection, queued to its writer task
struct ChannelSink {
    tx: mpsc::UnboundedSender<ServerFrame>,
}

impl PushSink for ChannelSink {
    fn push(&self, push: Push) -> Result<()> {
        self.tx
            .send(ServerFrame::Push { push })
            .map_err(|_| eyre::eyre!("Connection writer closed"))
    }
}

/// Drain queued frames into `writer` until the queue closes or a write fails
///
/// A response too large to send is replaced by an error for the same request
/// id; a push too large to send is dropped. The connection stays up either way.
async fn write_frames<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<ServerFrame>,
    limit: usize,
) {
    while let Some(frame) = rx.recv().await {
        let json = match encode_frame(&frame, limit) {
            Ok(json) => json,
            Err(e) => match frame {
                ServerFrame::Response { id, .. } => {
                    warn!(id, error = %e, "Response cannot be sent, replying with an error");
                    let fallback = ServerFrame::Response {
                        id,
                        response: Response::Error { message: e.to_string() },
                    };
                    match encode_frame(&fallback, limit) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!(id, error = %e, "Failed to encode error response");
                            continue;
                        }
                    }
                }
                ServerFrame::Push { .. } => {
                    warn!(error = %e, "Push cannot be sent, dropped");
                    continue;
                }
            },
        };
        if let Err(e) = write_line(&mut writer, &json).await {
            debug!(error = %e, "write_frames: writer stopped");
            break;
        }
    }
}

/// Serve one client until it disconnects
///
/// Responses and pushes share one writer task so frames never interleave.
pub async fn handle_connection(stream: UnixStream, hub: Arc<Hub>) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel::<ServerFrame>();
    let writer = tokio::spawn(write_frames(write_half, rx, MAX_SERVER_FRAME_SIZE));

    let client = hub.connect(Arc::new(ChannelSink { tx: tx.clone() }));
    let mut reader = BufReader::new(read_half);

    let result = loop {
        let line = match read_frame(&mut reader, MAX_FRAME_SIZE).await {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        };

        let (id, response) = match serde_json::from_str::<ClientFrame>(line.trim()) {
            Ok(frame) => (frame.id, hub.handle(client, frame.request)),
            Err(e) => {
                warn!(client, error = %e, "Failed to parse IPC frame");
                let id = serde_json::from_str::<serde_json::Value>(line.trim())
                    .ok()
                    .and_then(|v| v.get("id").and_then(|id| id.as_u64()))
                    .unwrap_or(0);
                (
                    id,
                    Response::Error {
                        message: format!("Invalid request: {e}"),
                    },
                )
            }
        };

        if tx.send(ServerFrame::Response { id, response }).is_err() {
            break Ok(());
        }
    };

    hub.disconnect(client);
    drop(tx);
    let _ = writer.await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::ipc::messages::Request;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_create_listener_creates_parent_dir() {
        let temp = TempDir::new().unwrap();
        let socket_path = temp.path().join("subdir").join("syncd.sock");

        let (_, path) = create_listener_at(&socket_path).unwrap();
        assert_eq!(path, socket_path);
        assert!(socket_path.exists());
    }

    #[tokio::test]
    async fn test_create_listener_removes_stale_socket() {
        let temp = TempDir::new().unwrap();
        let socket_path = temp.path().join("syncd.sock");
        std::fs::write(&socket_path, "stale").unwrap();

        assert!(create_listener_at(&socket_path).is_ok());
    }

    #[test]
    fn test_cleanup_socket_removes_file() {
        let temp = TempDir::new().unwrap();
        let socket_path = temp.path().join("syncd.sock");
        std::fs::write(&socket_path, "test").unwrap();

        cleanup_socket(&socket_path);
        assert!(!socket_path.exists());
    }

    #[test]
    fn test_cleanup_socket_handles_missing_file() {
        let temp = TempDir::new().unwrap();
        cleanup_socket(&temp.path().join("nonexistent.sock"));
    }

    #[tokio::test]
    async fn test_raw_ping_and_invalid_frame() {
        let temp = TempDir::new().unwrap();
        let socket_path = temp.path().join("test.sock");
        let (listener, _) = create_listener_at(&socket_path).unwrap();
        let hub = Arc::new(Hub::new(&Config::default()));
        let server = tokio::spawn(serve(listener, hub.clone(), std::future::pending()));

        let stream = UnixStream::connect(&socket_path).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let ping = serde_json::to_string(&ClientFrame {
            id: 1,
            request: Request::Ping,
        })
        .unwrap();
        write_half.write_all(format!("{ping}\n").as_bytes()).await.unwrap();
        let line = lines.next_line().await.unwrap().unwrap();
        let frame: ServerFrame = serde_json::from_str(&line).unwrap();
        assert!(matches!(
            frame,
            ServerFrame::Response {
                id: 1,
                response: Response::Pong { .. }
            }
        ));

        write_half
            .write_all(b"{\"id\":9,\"request\":{\"type\":\"shutdown\"}}\n")
            .await
            .unwrap();
        let line = lines.next_line().await.unwrap().unwrap();
        let frame: ServerFrame = serde_json::from_str(&line).unwrap();
        assert!(matches!(
            frame,
            ServerFrame::Response {
                id: 9,
                response: Response::Error { .. }
            }
        ));

        drop(write_half);
        drop(lines);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hub.client_count(), 0);
        server.abort();
    }

    #[tokio::test]
    async fn test_oversized_response_becomes_error_and_writer_continues() {
        let (tx, rx) = mpsc::unbounded_channel();
        let big = Response::Error {
            message: "x".repeat(512),
        };
        tx.send(ServerFrame::Response { id: 4, response: big }).unwrap();
        tx.send(ServerFrame::Push {
            push: Push::Semaphore(crate::lock::LockChange {
                key: "k".repeat(512),
                count: 1,
            }),
        })
        .unwrap();
        tx.send(ServerFrame::Response {
            id: 5,
            response: Response::Ok,
        })
        .unwrap();
        drop(tx);

        let mut out = Vec::new();
        write_frames(&mut out, rx, 256).await;

        let frames: Vec<ServerFrame> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(frames.len(), 2);
        match &frames[0] {
            ServerFrame::Response {
                id: 4,
                response: Response::Error { message },
            } => assert!(message.contains("Frame too large")),
            other => panic!("Expected error response, got {other:?}"),
        }
        assert!(matches!(
            frames[1],
            ServerFrame::Response {
                id: 5,
                response: Response::Ok
            }
        ));
    }
}
