//! syncd - state synchronization, hierarchical tasks and refcounted locks
//!
//! A daemon owns authoritative state and long-running work; any number of
//! clients mirror it over a local socket.
//!
//! # Modules
//!
//! - [`state`] - checkpointed service state, commit fan-out and client replicas
//! - [`task`] - task trees with progress, pause/resume/cancel and batched pushes
//! - [`lock`] - named refcounts with change broadcast and a read/write lock
//! - [`hub`] - server-side owner of the managers and per-client forwarding
//! - [`ipc`] - Unix socket transport
//! - [`daemon`] - daemon lifecycle
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod config;
pub mod daemon;
pub mod hub;
pub mod ipc;
pub mod lock;
pub mod state;
pub mod task;

// Re-export commonly used types
pub use config::Config;
pub use daemon::Daemon;
pub use hub::{ClientId, Hub, PushSink};
pub use ipc::{Connection, DaemonClient, Push, Request, Response};
pub use lock::{LockChange, LockGuard, LockTable, ReadWriteLock};
pub use state::{
    ClientReplica, Commit, MutationEnvelope, ReplicaDriver, Snapshot, StateError, StateHandle, StateModel,
    StateStore, SyncSource,
};
pub use task::{TaskContext, TaskError, TaskHandle, TaskManager, TaskMirror, TaskNode, TaskState};
