//! Event Bus - pub/sub for task lifecycle events
//!
//! Every node change is emitted right after it is recorded. Pushers, the CLI
//! watcher and tests subscribe.

use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use super::types::{TaskEvent, TaskEventKind, TaskInfo};

/// Default channel capacity (events)
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Broadcast bus for [`TaskEvent`]s
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TaskEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        debug!(capacity, "EventBus::new: creating event bus");
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Emit an event to all subscribers
    ///
    /// Fire-and-forget: with no subscribers the event is dropped.
    pub fn emit(&self, event: TaskEvent) {
        debug!(
            event_type = event.kind.name(),
            uuid = %event.task.uuid,
            id = event.task.id,
            "EventBus::emit"
        );
        let _ = self.tx.send(event);
    }

    /// Receive every event emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        debug!("EventBus::subscribe: new subscriber");
        self.tx.subscribe()
    }

    /// Emitter bound to one run
    pub fn emitter_for(&self, run: Uuid) -> EventEmitter {
        EventEmitter { bus: self.clone(), run }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

/// Per-run handle with one method per event kind
#[derive(Clone)]
pub struct EventEmitter {
    bus: EventBus,
    run: Uuid,
}

impl EventEmitter {
    pub fn run(&self) -> Uuid {
        self.run
    }

    fn emit(&self, kind: TaskEventKind, task: &TaskInfo) {
        debug_assert_eq!(task.uuid, self.run);
        self.bus.emit(TaskEvent {
            kind,
            task: task.clone(),
        });
    }

    pub fn start(&self, task: &TaskInfo) {
        self.emit(TaskEventKind::Start, task);
    }

    pub fn update(&self, task: &TaskInfo, chunk_size: Option<u64>) {
        self.emit(TaskEventKind::Update { chunk_size }, task);
    }

    pub fn pause(&self, task: &TaskInfo) {
        self.emit(TaskEventKind::Pause, task);
    }

    pub fn resume(&self, task: &TaskInfo) {
        self.emit(TaskEventKind::Resume, task);
    }

    pub fn cancel(&self, task: &TaskInfo) {
        self.emit(TaskEventKind::Cancel, task);
    }

    pub fn success(&self, task: &TaskInfo) {
        self.emit(TaskEventKind::Success, task);
    }

    pub fn fail(&self, task: &TaskInfo, error: &str) {
        self.emit(
            TaskEventKind::Fail {
                error: error.to_string(),
            },
            task,
        );
    }
}
