//! IPC message types for daemon communication
//!
//! JSON-over-newline protocol. Each frame is a single line of JSON followed by `\n`.
//! Clients send [`ClientFrame`]s; the daemon answers each with a
//! [`ServerFrame::Response`] carrying the same id and interleaves
//! [`ServerFrame::Push`] frames at any time.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::lock::LockChange;
use crate::state::{Commit, MutationEnvelope, ServiceInfo, Snapshot};
use crate::task::{TaskBatch, TaskNode, TaskOperation};

/// Maximum payload of a client frame, newline excluded
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Maximum payload of a daemon frame, newline excluded
///
/// Sync replies carry whole snapshots, so the daemon side gets more room.
pub const MAX_SERVER_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Requests from a client to the daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Request {
    /// Check the daemon is alive
    Ping,

    /// Full snapshot of a service; `checkpoint` is the caller's last applied one
    Sync { service: String, checkpoint: u64 },

    /// Apply a mutation to a service
    Commit { service: String, mutation: MutationEnvelope },

    /// Registered services and their checkpoints
    Services,

    /// Start task-update pushes; replies with the full task trees
    TaskSubscribe,

    TaskUnsubscribe,

    /// Pause, resume or cancel a run
    TaskOperation { operation: TaskOperation, id: Uuid },

    /// Current lock counts
    Semaphore,

    /// Force a lock key back to zero
    SemaphoreAbort { key: String },
}

/// Responses from the daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Response {
    Pong { version: String },

    /// `None` while the service is unknown or not installed
    Snapshot { snapshot: Option<Snapshot> },

    /// `None` when the commit was ignored
    Committed { checkpoint: Option<u64> },

    Services { services: Vec<ServiceInfo> },

    Tasks { tasks: Vec<TaskNode> },

    /// Acknowledgment
    Ok,

    TaskOperation { found: bool },

    Semaphores { counts: BTreeMap<String, usize> },

    Aborted { previous: usize },

    Error { message: String },
}

/// Unsolicited frames from the daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum Push {
    Commit(Commit),
    TaskUpdate(TaskBatch),
    Semaphore(LockChange),
}

/// Request envelope with its correlation id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    pub id: u64,
    pub request: Request,
}

/// Anything the daemon writes to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ServerFrame {
    Response { id: u64, response: Response },
    Push { push: Push },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sync_request_serialize() {
        let frame = ClientFrame {
            id: 7,
            request: Request::Sync {
                service: "settings".to_string(),
                checkpoint: 3,
            },
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            json,
            json!({"id": 7, "request": {"type": "sync", "service": "settings", "checkpoint": 3}})
        );
    }

    #[test]
    fn test_task_operation_deserialize() {
        let id = Uuid::now_v7();
        let json = format!(r#"{{"type":"task-operation","operation":"cancel","id":"{id}"}}"#);
        let request: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(
            request,
            Request::TaskOperation {
                operation: TaskOperation::Cancel,
                id
            }
        );
    }

    #[test]
    fn test_ping_serialize() {
        let json = serde_json::to_string(&Request::Ping).unwrap();
        assert_eq!(json, r#"{"type":"ping"}"#);
    }

    #[test]
    fn test_null_snapshot_response() {
        let frame = ServerFrame::Response {
            id: 1,
            response: Response::Snapshot { snapshot: None },
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            json,
            json!({"kind": "response", "id": 1, "response": {"type": "snapshot", "snapshot": null}})
        );
    }

    #[test]
    fn test_commit_push_wire_format() {
        let frame = ServerFrame::Push {
            push: Push::Commit(Commit {
                service_name: "settings".to_string(),
                mutation: MutationEnvelope::new("themeSet", json!("dark")),
                checkpoint: 4,
            }),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            json,
            json!({
                "kind": "push",
                "push": {
                    "type": "commit",
                    "data": {"serviceName": "settings", "mutation": {"type": "themeSet", "payload": "dark"}, "checkpoint": 4}
                }
            })
        );
    }

    #[test]
    fn test_semaphore_push_parse() {
        let line = r#"{"kind":"push","push":{"type":"semaphore","data":{"key":"instance:/a","count":2}}}"#;
        let frame: ServerFrame = serde_json::from_str(line).unwrap();
        assert_eq!(
            frame,
            ServerFrame::Push {
                push: Push::Semaphore(LockChange {
                    key: "instance:/a".to_string(),
                    count: 2
                })
            }
        );
    }

    #[test]
    fn test_unknown_request_type_fails() {
        assert!(serde_json::from_str::<Request>(r#"{"type":"shutdown"}"#).is_err());
    }
}
