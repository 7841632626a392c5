//! TaskManager - runs units of work as observable task trees
//!
//! `submit` registers a run, starts its root node on the tokio runtime and
//! drops the registry entry once the root, and with it every child, has
//! settled. Pause, resume and cancel only flip the run's control channel and
//! node states; the work notices at its own checkpoints.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::bus::{DEFAULT_EVENT_CAPACITY, EventBus, EventEmitter};
use super::context::{RunControl, TaskContext, TaskHandle, spawn_node};
use super::tree::RunTree;
use super::types::{TaskError, TaskEvent, TaskInfo, TaskNode, TaskOperation, TaskState};

/// One submitted root task and its descendants
pub(crate) struct Run {
    id: Uuid,
    tree: Mutex<RunTree>,
    emitter: EventEmitter,
    control: watch::Sender<RunControl>,
}

impl Run {
    fn new(id: Uuid, title: String, emitter: EventEmitter) -> Self {
        let (control, _) = watch::channel(RunControl::Running);
        Self {
            id,
            tree: Mutex::new(RunTree::new(id, title, TaskState::Running)),
            emitter,
            control,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RunTree> {
        self.tree.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn control(&self) -> watch::Receiver<RunControl> {
        self.control.subscribe()
    }

    pub(crate) fn info(&self, id: u32) -> Option<TaskInfo> {
        self.lock().get(id).cloned()
    }

    fn snapshot(&self) -> TaskNode {
        self.lock().root()
    }

    fn announce_root(&self) {
        let tree = self.lock();
        if let Some(root) = tree.get(0) {
            self.emitter.start(root);
        }
    }

    /// Add a child node and emit its start event, returning its id
    pub(crate) fn add_child(&self, parent: u32, title: String) -> u32 {
        let state = match *self.control.borrow() {
            RunControl::Running => TaskState::Running,
            RunControl::Paused => TaskState::Paused,
            RunControl::Cancelled => TaskState::Cancelled,
        };
        let mut tree = self.lock();
        let id = tree.add_child(parent, title, state);
        if let Some(info) = tree.get(id) {
            self.emitter.start(info);
        }
        id
    }

    pub(crate) fn update(&self, id: u32, progress: u64, total: u64, chunk_size: Option<u64>) {
        let mut tree = self.lock();
        let Some(info) = tree.live_mut(id) else {
            debug!(uuid = %self.id, id, "update: node is terminal, dropped");
            return;
        };
        info.progress = progress;
        info.total = total;
        self.emitter.update(info, chunk_size);
    }

    pub(crate) fn set_endpoints(&self, id: u32, from: Option<String>, to: Option<String>) {
        let mut tree = self.lock();
        let Some(info) = tree.live_mut(id) else {
            return;
        };
        info.from = from;
        info.to = to;
        self.emitter.update(info, None);
    }

    /// Move every live node from `from` to `to`, emitting one event per node
    fn transition(&self, from: &[TaskState], to: TaskState) {
        let mut tree = self.lock();
        for id in tree.live_ids() {
            let Some(info) = tree.live_mut(id) else {
                continue;
            };
            if !from.contains(&info.state) {
                continue;
            }
            info.state = to;
            match to {
                TaskState::Paused => self.emitter.pause(info),
                TaskState::Running => self.emitter.resume(info),
                TaskState::Cancelled => self.emitter.cancel(info),
                _ => self.emitter.update(info, None),
            }
        }
    }

    fn operate(&self, op: TaskOperation) {
        let current = *self.control.borrow();
        match (op, current) {
            (TaskOperation::Pause, RunControl::Running) => {
                self.control.send_replace(RunControl::Paused);
                self.transition(&[TaskState::Running, TaskState::Pending], TaskState::Paused);
            }
            (TaskOperation::Resume, RunControl::Paused) => {
                self.control.send_replace(RunControl::Running);
                self.transition(&[TaskState::Paused], TaskState::Running);
            }
            (TaskOperation::Cancel, RunControl::Running | RunControl::Paused) => {
                self.control.send_replace(RunControl::Cancelled);
                self.transition(
                    &[TaskState::Pending, TaskState::Running, TaskState::Paused],
                    TaskState::Cancelled,
                );
            }
            _ => debug!(uuid = %self.id, ?op, ?current, "operate: no-op in current state"),
        }
    }

    /// Record the outcome of node `id` and emit its terminal event
    ///
    /// A node already cancelled keeps that state and its handle reports
    /// `Cancelled`, whatever the work returned.
    pub(crate) fn settle<T>(&self, id: u32, result: Result<T, TaskError>) -> Result<T, TaskError> {
        let mut tree = self.lock();
        let Some(info) = tree.live_mut(id) else {
            let state = tree.get(id).map(|i| i.state);
            debug!(uuid = %self.id, id, ?state, "settle: node already terminal");
            return match state {
                Some(TaskState::Cancelled) => Err(TaskError::Cancelled),
                _ => result,
            };
        };

        match &result {
            Ok(_) => {
                info.state = TaskState::Succeed;
                self.emitter.success(info);
            }
            Err(TaskError::Cancelled) => {
                info.state = TaskState::Cancelled;
                self.emitter.cancel(info);
            }
            Err(e) => {
                let error = e.to_string();
                info.state = TaskState::Failed;
                info.error = Some(error.clone());
                self.emitter.fail(info, &error);
            }
        }
        result
    }
}

struct ManagerInner {
    bus: EventBus,
    /// Active runs in submission order
    runs: Mutex<Vec<Arc<Run>>>,
}

impl ManagerInner {
    fn runs(&self) -> MutexGuard<'_, Vec<Arc<Run>>> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn find(&self, id: Uuid) -> Option<Arc<Run>> {
        self.runs().iter().find(|r| r.id == id).cloned()
    }

    fn remove(&self, id: Uuid) {
        self.runs().retain(|r| r.id != id);
        debug!(%id, "TaskManager: run removed from registry");
    }
}

/// Registry of active runs and owner of the task event bus
///
/// Cheap to clone; clones share runs and bus.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<ManagerInner>,
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl TaskManager {
    pub fn new(event_capacity: usize) -> Self {
        debug!(event_capacity, "TaskManager::new: called");
        Self {
            inner: Arc::new(ManagerInner {
                bus: EventBus::new(event_capacity),
                runs: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Receive every task event emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.bus.subscribe()
    }

    /// Start `work` as the root of a new run
    ///
    /// Must be called from inside a tokio runtime.
    pub fn submit<T, F, Fut>(&self, title: impl Into<String>, work: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = eyre::Result<T>> + Send + 'static,
    {
        let id = Uuid::now_v7();
        let title = title.into();
        debug!(%id, %title, "TaskManager::submit: called");

        let run = Arc::new(Run::new(id, title.clone(), self.inner.bus.emitter_for(id)));
        self.inner.runs().push(run.clone());
        run.announce_root();
        info!(%id, %title, "Task submitted");

        let inner = self.inner.clone();
        spawn_node(run, 0, work, move || inner.remove(id))
    }

    /// Forward pause, resume or cancel to a run
    ///
    /// Returns false, with a warning, when no active run has this id.
    pub fn task_operation(&self, op: TaskOperation, id: Uuid) -> bool {
        debug!(?op, %id, "TaskManager::task_operation: called");
        match self.inner.find(id) {
            Some(run) => {
                run.operate(op);
                info!(?op, %id, "Task operation applied");
                true
            }
            None => {
                warn!(?op, %id, "Cannot find task to operate on");
                false
            }
        }
    }

    /// Every active run as a nested tree, in submission order
    pub fn snapshot(&self) -> Vec<TaskNode> {
        let runs: Vec<Arc<Run>> = self.inner.runs().clone();
        runs.iter().map(|r| r.snapshot()).collect()
    }

    /// The most recently submitted run that is still active
    pub fn active_task(&self) -> Option<TaskNode> {
        let run = self.inner.runs().last().cloned();
        run.map(|r| r.snapshot())
    }

    pub fn is_active(&self, id: Uuid) -> bool {
        self.inner.find(id).is_some()
    }

    pub fn active_count(&self) -> usize {
        self.inner.runs().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::types::TaskEventKind;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn drain(rx: &mut broadcast::Receiver<TaskEvent>) -> Vec<TaskEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn lifecycle(events: &[TaskEvent]) -> Vec<(String, &'static str)> {
        events
            .iter()
            .filter(|e| !matches!(e.kind, TaskEventKind::Update { .. }))
            .map(|e| (e.task.title.clone(), e.kind.name()))
            .collect()
    }

    #[tokio::test]
    async fn test_submit_returns_value_and_leaves_registry() {
        let manager = TaskManager::default();
        let handle = manager.submit("answer", |_ctx| async { Ok(42) });
        let run = handle.run_id();

        assert_eq!(handle.await.unwrap(), 42);
        assert!(!manager.is_active(run));
        assert!(manager.snapshot().iter().all(|n| n.info.uuid != run));
    }

    #[tokio::test]
    async fn test_failed_task_leaves_registry() {
        let manager = TaskManager::default();
        let handle = manager.submit("broken", |_ctx| async { Err::<(), _>(eyre::eyre!("no network")) });
        let run = handle.run_id();

        assert_eq!(handle.await, Err(TaskError::Failed("no network".to_string())));
        assert!(!manager.is_active(run));
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_panicking_task_leaves_registry() {
        let manager = TaskManager::default();
        let handle = manager.submit("panics", |_ctx| async {
            if true {
                panic!("bad state");
            }
            Ok(())
        });
        let run = handle.run_id();

        assert_eq!(handle.await, Err(TaskError::Panicked("bad state".to_string())));
        assert!(!manager.is_active(run));
    }

    #[tokio::test]
    async fn test_child_panicking_before_its_future_settles_parent() {
        let manager = TaskManager::default();
        let items: Vec<u64> = Vec::new();
        let handle = manager.submit("R", move |ctx| async move {
            let child = ctx.spawn("C", move |_ctx| {
                let first = items[0];
                async move { Ok(first) }
            });
            child.await?;
            Ok::<_, eyre::Report>(())
        });
        let run = handle.run_id();

        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("parent should settle");
        assert!(matches!(result, Err(TaskError::Panicked(_))));
        assert!(!manager.is_active(run));
    }

    #[tokio::test]
    async fn test_root_panicking_before_its_future_leaves_registry() {
        let manager = TaskManager::default();
        let handle = manager.submit("R", |_ctx| -> std::future::Ready<eyre::Result<()>> { panic!("no future") });
        let run = handle.run_id();

        assert_eq!(handle.await, Err(TaskError::Panicked("no future".to_string())));
        assert!(!manager.is_active(run));
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_active_run_visible_in_snapshot() {
        let manager = TaskManager::default();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let handle = manager.submit("waiting", |ctx| async move {
            ctx.update(1, 4);
            let _ = release_rx.await;
            Ok(())
        });
        tokio::task::yield_now().await;

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].info.uuid, handle.run_id());
        assert_eq!(manager.active_task().unwrap().info.title, "waiting");

        release_tx.send(()).unwrap();
        handle.await.unwrap();
        assert!(manager.snapshot().is_empty());
        assert!(manager.active_task().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_failure_propagated_fails_parent() {
        let manager = TaskManager::default();
        let mut rx = manager.subscribe();

        let handle = manager.submit("R", |ctx| async move {
            let c1 = ctx.spawn("C1", |_| async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err::<(), _>(eyre::eyre!("checksum mismatch"))
            });
            let c2 = ctx.spawn("C2", |_| async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(())
            });
            c1.await?;
            c2.await?;
            Ok::<_, eyre::Report>(())
        });

        assert_eq!(handle.await, Err(TaskError::Failed("checksum mismatch".to_string())));
        assert_eq!(
            lifecycle(&drain(&mut rx)),
            vec![
                ("R".to_string(), "start"),
                ("C1".to_string(), "start"),
                ("C2".to_string(), "start"),
                ("C1".to_string(), "fail"),
                ("C2".to_string(), "success"),
                ("R".to_string(), "fail"),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_failure_ignored_parent_succeeds() {
        let manager = TaskManager::default();
        let mut rx = manager.subscribe();

        let handle = manager.submit("R", |ctx| async move {
            let c1 = ctx.spawn("C1", |_| async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err::<(), _>(eyre::eyre!("mirror offline"))
            });
            let c2 = ctx.spawn("C2", |_| async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(())
            });
            let _ = c1.await;
            c2.await?;
            Ok::<_, eyre::Report>(())
        });

        assert_eq!(handle.await, Ok(()));
        let events = drain(&mut rx);
        assert_eq!(
            lifecycle(&events),
            vec![
                ("R".to_string(), "start"),
                ("C1".to_string(), "start"),
                ("C2".to_string(), "start"),
                ("C1".to_string(), "fail"),
                ("C2".to_string(), "success"),
                ("R".to_string(), "success"),
            ]
        );
        let failed = events.iter().find(|e| e.task.title == "C1" && e.kind.name() == "fail").unwrap();
        assert_eq!(failed.task.error.as_deref(), Some("mirror offline"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_waits_for_unawaited_children() {
        let manager = TaskManager::default();
        let mut rx = manager.subscribe();

        let handle = manager.submit("R", |ctx| async move {
            // Child handle dropped without awaiting
            let _ = ctx.spawn("background", |_| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(())
            });
            Ok(())
        });

        handle.await.unwrap();
        let events = lifecycle(&drain(&mut rx));
        assert_eq!(events.last().unwrap(), &("R".to_string(), "success"));
        assert!(events.contains(&("background".to_string(), "success")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_resume_cancel_are_cooperative() {
        let manager = TaskManager::default();
        let mut rx = manager.subscribe();

        let handle = manager.submit("download", |ctx| async move {
            for chunk in 1..=100u64 {
                ctx.checkpoint().await?;
                ctx.update_chunk(chunk, 100, 1);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Ok::<_, eyre::Report>(())
        });
        let run = handle.run_id();

        tokio::time::sleep(Duration::from_millis(35)).await;
        assert!(manager.task_operation(TaskOperation::Pause, run));
        let paused_at = manager.active_task().unwrap().info.progress;
        assert_eq!(manager.active_task().unwrap().info.state, TaskState::Paused);

        tokio::time::sleep(Duration::from_millis(200)).await;
        // At most the chunk in flight lands after the pause
        assert!(manager.active_task().unwrap().info.progress <= paused_at + 1);

        assert!(manager.task_operation(TaskOperation::Resume, run));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(manager.task_operation(TaskOperation::Cancel, run));

        assert_eq!(handle.await, Err(TaskError::Cancelled));
        assert!(!manager.is_active(run));

        let kinds: Vec<&str> = drain(&mut rx)
            .iter()
            .filter(|e| !matches!(e.kind, TaskEventKind::Update { .. }))
            .map(|e| e.kind.name())
            .collect();
        assert_eq!(kinds, vec!["start", "pause", "resume", "cancel"]);
    }

    #[tokio::test]
    async fn test_updates_after_terminal_state_are_dropped() {
        let manager = TaskManager::default();
        let mut rx = manager.subscribe();
        let (go_tx, go_rx) = oneshot::channel::<()>();

        let handle = manager.submit("ignores cancel", |ctx| async move {
            let _ = go_rx.await;
            ctx.update(5, 10);
            Ok(())
        });
        let run = handle.run_id();
        manager.task_operation(TaskOperation::Cancel, run);
        go_tx.send(()).unwrap();

        assert_eq!(handle.await, Err(TaskError::Cancelled));
        let events = drain(&mut rx);
        assert!(events.iter().all(|e| !matches!(e.kind, TaskEventKind::Update { .. })));
        assert_eq!(events.last().unwrap().kind, TaskEventKind::Cancel);
    }

    #[tokio::test]
    async fn test_unknown_run_operation_is_rejected() {
        let manager = TaskManager::default();
        assert!(!manager.task_operation(TaskOperation::Pause, Uuid::now_v7()));
    }
}
