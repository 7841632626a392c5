//! TaskPusher - per-client batching of task events
//!
//! A [`TaskMonitor`] folds bus events into pending adds and per-node merged
//! updates. A [`TaskPusher`] drains it on a fixed interval into at most one
//! `task-update` push per tick, capped at `max_batch` records. Records over the
//! cap carry to the next tick. Adds always go first and updates are held back
//! while adds remain, so a client never sees an update for a node it has not
//! been told about.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::manager::TaskManager;
use super::types::{TaskAddRecord, TaskBatch, TaskEvent, TaskEventKind, TaskNode, TaskUpdateRecord};
use crate::hub::{ClientId, PushSink};
use crate::ipc::Push;

/// Default flush interval
pub const DEFAULT_PUSH_INTERVAL: Duration = Duration::from_millis(500);

/// Default cap on records per push
pub const DEFAULT_MAX_BATCH: usize = 30;

/// Pending changes not yet pushed
#[derive(Debug, Default)]
pub struct TaskMonitor {
    adds: Vec<TaskAddRecord>,
    updates: Vec<TaskUpdateRecord>,
    index: HashMap<(Uuid, u32), usize>,
}

impl TaskMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records waiting
    pub fn pending(&self) -> usize {
        self.adds.len() + self.updates.len()
    }

    fn update_for(&mut self, uuid: Uuid, id: u32) -> &mut TaskUpdateRecord {
        let slot = match self.index.get(&(uuid, id)) {
            Some(slot) => *slot,
            None => {
                self.updates.push(TaskUpdateRecord::new(uuid, id));
                self.index.insert((uuid, id), self.updates.len() - 1);
                self.updates.len() - 1
            }
        };
        &mut self.updates[slot]
    }

    /// Fold one event into the pending records
    pub fn record(&mut self, event: &TaskEvent) {
        let task = &event.task;
        if let TaskEventKind::Start = event.kind {
            self.adds.push(TaskAddRecord::from(task));
            return;
        }

        let update = self.update_for(task.uuid, task.id);
        update.time = task.time;
        match &event.kind {
            TaskEventKind::Update { chunk_size } => {
                update.progress = Some(task.progress);
                update.total = Some(task.total);
                if task.from.is_some() {
                    update.from = task.from.clone();
                }
                if task.to.is_some() {
                    update.to = task.to.clone();
                }
                if let Some(size) = chunk_size {
                    update.chunk_size = Some(update.chunk_size.unwrap_or(0) + size);
                }
            }
            TaskEventKind::Fail { error } => {
                update.state = Some(task.state);
                update.error = Some(error.clone());
            }
            TaskEventKind::Pause | TaskEventKind::Resume | TaskEventKind::Cancel | TaskEventKind::Success => {
                update.state = Some(task.state);
            }
            TaskEventKind::Start => {}
        }
    }

    /// Take up to `max` records, adds first
    pub fn take_batch(&mut self, max: usize) -> TaskBatch {
        let max = max.max(1);
        let add_count = self.adds.len().min(max);
        let adds: Vec<TaskAddRecord> = self.adds.drain(..add_count).collect();

        let mut updates = Vec::new();
        if self.adds.is_empty() {
            let update_count = self.updates.len().min(max - adds.len());
            updates = self.updates.drain(..update_count).collect();
            self.index = self
                .updates
                .iter()
                .enumerate()
                .map(|(i, u)| (u.key(), i))
                .collect();
        }

        TaskBatch { adds, updates }
    }
}

/// Background task draining a [`TaskMonitor`] into a client's sink
///
/// Aborted on drop.
pub struct TaskPusher {
    handle: JoinHandle<()>,
}

impl TaskPusher {
    pub fn spawn(
        mut events: broadcast::Receiver<TaskEvent>,
        interval: Duration,
        max_batch: usize,
        sink: Arc<dyn PushSink>,
    ) -> Self {
        debug!(?interval, max_batch, "TaskPusher::spawn: called");
        let handle = tokio::spawn(async move {
            let mut monitor = TaskMonitor::new();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => monitor.record(&event),
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed, "TaskPusher: task events lagged, client view may be stale");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = ticker.tick() => {
                        if monitor.pending() == 0 {
                            continue;
                        }
                        let batch = monitor.take_batch(max_batch);
                        debug!(adds = batch.adds.len(), updates = batch.updates.len(), "TaskPusher: flush");
                        if let Err(e) = sink.push(Push::TaskUpdate(batch)) {
                            debug!(error = %e, "TaskPusher: sink closed");
                            break;
                        }
                    }
                }
            }
            debug!("TaskPusher: stopped");
        });
        Self { handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for TaskPusher {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Pushers keyed by client
pub struct TaskSubscriptions {
    manager: TaskManager,
    interval: Duration,
    max_batch: usize,
    pushers: Mutex<HashMap<ClientId, TaskPusher>>,
}

impl TaskSubscriptions {
    pub fn new(manager: TaskManager, interval: Duration, max_batch: usize) -> Self {
        Self {
            manager,
            interval,
            max_batch,
            pushers: Mutex::new(HashMap::new()),
        }
    }

    fn pushers(&self) -> MutexGuard<'_, HashMap<ClientId, TaskPusher>> {
        self.pushers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start pushing task updates to `client`, returning the full current tree
    ///
    /// Replaces any pusher the client already had. Events are subscribed before
    /// the tree is read, so nothing between the two is lost.
    pub fn subscribe(&self, client: ClientId, sink: Arc<dyn PushSink>) -> Vec<TaskNode> {
        debug!(client, "TaskSubscriptions::subscribe: called");
        let events = self.manager.subscribe();
        let tree = self.manager.snapshot();
        let pusher = TaskPusher::spawn(events, self.interval, self.max_batch, sink);
        if self.pushers().insert(client, pusher).is_some() {
            info!(client, "Replaced task pusher");
        } else {
            info!(client, "Task pusher created");
        }
        tree
    }

    /// Stop pushing to `client`; false if it had no pusher
    pub fn unsubscribe(&self, client: ClientId) -> bool {
        let removed = self.pushers().remove(&client).is_some();
        if removed {
            info!(client, "Destroy task pusher");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.pushers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pushers().is_empty()
    }
}
