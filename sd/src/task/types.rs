//! Task data model
//!
//! A run is one submitted root task plus every child it spawns. Nodes are
//! addressed by `(uuid, id)`: the run's UUID and a sequence number inside the
//! run, the root being 0.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Why a task did not produce a value
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("{0}")]
    Failed(String),

    #[error("Task cancelled")]
    Cancelled,

    #[error("Task panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    /// Normalize an error returned by a unit of work
    ///
    /// A `TaskError` propagated from a child keeps its kind; anything else
    /// becomes `Failed` with the full error chain as message.
    pub fn from_report(report: eyre::Report) -> Self {
        match report.downcast_ref::<TaskError>() {
            Some(e) => e.clone(),
            None => TaskError::Failed(format!("{report:#}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Paused,
    Cancelled,
    Succeed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Cancelled | TaskState::Succeed | TaskState::Failed)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Paused => "paused",
            TaskState::Cancelled => "cancelled",
            TaskState::Succeed => "succeed",
            TaskState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Operator request forwarded to a run's control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskOperation {
    Pause,
    Resume,
    Cancel,
}

/// Milliseconds since the Unix epoch
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// One node without its children
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub uuid: Uuid,
    pub id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<u32>,
    pub title: String,
    pub state: TaskState,
    pub progress: u64,
    pub total: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Last change, ms since epoch
    pub time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskInfo {
    pub fn key(&self) -> (Uuid, u32) {
        (self.uuid, self.id)
    }
}

/// A node and its children, as returned by `task-subscribe`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    #[serde(flatten)]
    pub info: TaskInfo,
    #[serde(default)]
    pub children: Vec<TaskNode>,
}

impl TaskNode {
    /// Depth-first search for a node in this subtree
    pub fn find(&self, id: u32) -> Option<&TaskNode> {
        if self.info.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(id))
    }

    /// Number of nodes in this subtree
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(TaskNode::count).sum::<usize>()
    }
}

/// A node appeared
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAddRecord {
    pub uuid: Uuid,
    pub id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<u32>,
    pub title: String,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    pub time: i64,
}

impl From<&TaskInfo> for TaskAddRecord {
    fn from(info: &TaskInfo) -> Self {
        Self {
            uuid: info.uuid,
            id: info.id,
            parent_id: info.parent_id,
            title: info.title.clone(),
            state: info.state,
            from: info.from.clone(),
            to: info.to.clone(),
            time: info.time,
        }
    }
}

/// Coalesced changes to one node; absent fields did not change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdateRecord {
    pub uuid: Uuid,
    pub id: u32,
    pub time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<TaskState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Bytes or units processed since the previous record for this node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskUpdateRecord {
    pub fn new(uuid: Uuid, id: u32) -> Self {
        Self {
            uuid,
            id,
            time: now_ms(),
            state: None,
            progress: None,
            total: None,
            from: None,
            to: None,
            chunk_size: None,
            error: None,
        }
    }

    pub fn key(&self) -> (Uuid, u32) {
        (self.uuid, self.id)
    }

    /// Write the present fields onto `info`
    pub fn apply_to(&self, info: &mut TaskInfo) {
        info.time = self.time;
        if let Some(state) = self.state {
            info.state = state;
        }
        if let Some(progress) = self.progress {
            info.progress = progress;
        }
        if let Some(total) = self.total {
            info.total = total;
        }
        if self.from.is_some() {
            info.from = self.from.clone();
        }
        if self.to.is_some() {
            info.to = self.to.clone();
        }
        if self.error.is_some() {
            info.error = self.error.clone();
        }
    }
}

/// One `task-update` push
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskBatch {
    pub adds: Vec<TaskAddRecord>,
    pub updates: Vec<TaskUpdateRecord>,
}

impl TaskBatch {
    pub fn len(&self) -> usize {
        self.adds.len() + self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.updates.is_empty()
    }
}

/// What happened to a node
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEventKind {
    Start,
    Update { chunk_size: Option<u64> },
    Pause,
    Resume,
    Cancel,
    Success,
    Fail { error: String },
}

impl TaskEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            TaskEventKind::Start => "start",
            TaskEventKind::Update { .. } => "update",
            TaskEventKind::Pause => "pause",
            TaskEventKind::Resume => "resume",
            TaskEventKind::Cancel => "cancel",
            TaskEventKind::Success => "success",
            TaskEventKind::Fail { .. } => "fail",
        }
    }
}

/// Event on the task bus, carrying the node as it is after the change
#[derive(Debug, Clone, PartialEq)]
pub struct TaskEvent {
    pub kind: TaskEventKind,
    pub task: TaskInfo,
}
