//! Hierarchical task execution
//!
//! [`TaskManager::submit`] runs a unit of work as the root of a run; the work
//! gets a [`TaskContext`] to report progress, spawn children and observe
//! pause/cancel. Every node change goes out on the [`EventBus`], which
//! [`TaskPusher`]s batch per client and [`TaskMirror`] reassembles on the
//! other side.

mod bus;
mod context;
mod manager;
mod mirror;
mod pusher;
mod tree;
mod types;

pub use bus::{DEFAULT_EVENT_CAPACITY, EventBus, EventEmitter};
pub use context::{RunControl, TaskContext, TaskHandle};
pub use manager::TaskManager;
pub use mirror::TaskMirror;
pub use pusher::{DEFAULT_MAX_BATCH, DEFAULT_PUSH_INTERVAL, TaskMonitor, TaskPusher, TaskSubscriptions};
pub use tree::{DEFAULT_VISIBLE_CHILDREN, RunTree, visible_children};
pub use types::{
    TaskAddRecord, TaskBatch, TaskError, TaskEvent, TaskEventKind, TaskInfo, TaskNode, TaskOperation, TaskState,
    TaskUpdateRecord, now_ms,
};
