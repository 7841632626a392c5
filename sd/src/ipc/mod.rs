//! Inter-Process Communication between clients and the daemon
//!
//! Unix Domain Socket, one long-lived connection per client, newline-delimited
//! JSON frames. Requests are answered in order of arrival; pushes (commits,
//! task updates, lock changes) are interleaved with responses.

use std::path::PathBuf;

use eyre::{Context, Result};
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub mod client;
pub mod messages;
pub mod server;

pub use client::{Connection, DaemonClient, commits_only};
pub use messages::{ClientFrame, MAX_FRAME_SIZE, MAX_SERVER_FRAME_SIZE, Push, Request, Response, ServerFrame};
pub use server::{cleanup_socket, create_listener, create_listener_at, serve};

/// Get the socket path for daemon IPC
pub fn get_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("syncd")
        .join("syncd.sock")
}

/// Read one frame of at most `limit` payload bytes; `None` at end of stream
pub(crate) async fn read_frame<R: AsyncBufRead + Unpin>(reader: &mut R, limit: usize) -> Result<Option<String>> {
    let mut line = String::new();
    let bytes_read = reader
        .take(limit as u64 + 1)
        .read_line(&mut line)
        .await
        .context("Failed to read IPC frame")?;

    if bytes_read == 0 {
        return Ok(None);
    }
    let payload = line.strip_suffix('\n').unwrap_or(&line).len();
    if payload > limit {
        return Err(eyre::eyre!("Frame too large: more than {} bytes", limit));
    }
    Ok(Some(line))
}

/// Serialize one frame, refusing payloads over `limit` bytes
pub(crate) fn encode_frame<T: Serialize>(frame: &T, limit: usize) -> Result<String> {
    let json = serde_json::to_string(frame).context("Failed to serialize frame")?;
    if json.len() > limit {
        return Err(eyre::eyre!("Frame too large: {} bytes (limit {})", json.len(), limit));
    }
    Ok(json)
}

/// Write an encoded frame followed by `\n`
pub(crate) async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, json: &str) -> Result<()> {
    writer.write_all(json.as_bytes()).await.context("Failed to write frame")?;
    writer.write_all(b"\n").await.context("Failed to write newline")?;
    writer.flush().await.context("Failed to flush frame")?;
    Ok(())
}

/// Serialize and write one frame followed by `\n`
pub(crate) async fn write_frame<W: AsyncWrite + Unpin, T: Serialize>(
    writer: &mut W,
    frame: &T,
    limit: usize,
) -> Result<()> {
    let json = encode_frame(frame, limit)?;
    write_line(writer, &json).await
}
