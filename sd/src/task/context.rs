//! TaskContext - what a unit of work sees of its own node
//!
//! Work is any `FnOnce(TaskContext) -> impl Future<Output = eyre::Result<T>>`.
//! It reports progress, spawns children, and observes pause and cancel at its
//! own yield points. Nothing here ever aborts a running future.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};

use futures::FutureExt;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use super::manager::Run;
use super::types::{TaskError, TaskInfo};

/// Control signal shared by every node of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunControl {
    Running,
    Paused,
    Cancelled,
}

/// Counts children still running so a parent can wait for them
#[derive(Default)]
pub(crate) struct ChildTracker {
    active: AtomicUsize,
    idle: Notify,
}

impl ChildTracker {
    fn enter(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    fn leave(&self) {
        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Handle given to a unit of work
#[derive(Clone)]
pub struct TaskContext {
    run: Arc<Run>,
    id: u32,
    children: Arc<ChildTracker>,
    control: watch::Receiver<RunControl>,
}

impl TaskContext {
    pub fn run_id(&self) -> Uuid {
        self.run.id()
    }

    /// Sequence id of this node inside its run
    pub fn task_id(&self) -> u32 {
        self.id
    }

    /// Current view of this node
    pub fn info(&self) -> Option<TaskInfo> {
        self.run.info(self.id)
    }

    /// Report absolute progress
    pub fn update(&self, progress: u64, total: u64) {
        self.run.update(self.id, progress, total, None);
    }

    /// Report absolute progress plus the size of the chunk just processed
    pub fn update_chunk(&self, progress: u64, total: u64, chunk_size: u64) {
        self.run.update(self.id, progress, total, Some(chunk_size));
    }

    /// Record where this node reads from and writes to
    pub fn set_endpoints(&self, from: Option<String>, to: Option<String>) {
        self.run.set_endpoints(self.id, from, to);
    }

    pub fn is_paused(&self) -> bool {
        *self.control.borrow() == RunControl::Paused
    }

    pub fn is_cancelled(&self) -> bool {
        *self.control.borrow() == RunControl::Cancelled
    }

    /// Yield point: waits while the run is paused, fails once it is cancelled
    pub async fn checkpoint(&self) -> Result<(), TaskError> {
        let mut control = self.control.clone();
        loop {
            let signal = *control.borrow_and_update();
            match signal {
                RunControl::Running => return Ok(()),
                RunControl::Cancelled => return Err(TaskError::Cancelled),
                RunControl::Paused => {}
            }
            if control.changed().await.is_err() {
                return Err(TaskError::Cancelled);
            }
        }
    }

    /// Start a child node running `work`
    ///
    /// This node does not settle before every child it spawned has settled.
    pub fn spawn<T, F, Fut>(&self, title: impl Into<String>, work: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = eyre::Result<T>> + Send + 'static,
    {
        let id = self.run.add_child(self.id, title.into());
        self.children.enter();
        let parent = self.children.clone();
        spawn_node(self.run.clone(), id, work, move || parent.leave())
    }
}

/// Resolves to the result of a submitted or spawned unit of work
///
/// Dropping the handle detaches it; the work keeps running.
pub struct TaskHandle<T> {
    run: Uuid,
    id: u32,
    inner: JoinHandle<Result<T, TaskError>>,
}

impl<T> TaskHandle<T> {
    pub fn run_id(&self) -> Uuid {
        self.run
    }

    pub fn task_id(&self) -> u32 {
        self.id
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.inner).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(e)) => Poll::Ready(Err(TaskError::Panicked(e.to_string()))),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run `work` as node `id` of `run` on the tokio runtime
///
/// `on_settled` runs after the node's terminal state is recorded and before
/// the handle resolves.
pub(crate) fn spawn_node<T, F, Fut>(
    run: Arc<Run>,
    id: u32,
    work: F,
    on_settled: impl FnOnce() + Send + 'static,
) -> TaskHandle<T>
where
    T: Send + 'static,
    F: FnOnce(TaskContext) -> Fut,
    Fut: Future<Output = eyre::Result<T>> + Send + 'static,
{
    let children = Arc::new(ChildTracker::default());
    let ctx = TaskContext {
        run: run.clone(),
        id,
        children: children.clone(),
        control: run.control(),
    };
    let run_id = run.id();
    // A closure that panics before returning its future still settles the node
    let fut = std::panic::catch_unwind(AssertUnwindSafe(|| work(ctx)));

    let inner = tokio::spawn(async move {
        let outcome = match fut {
            Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
            Err(panic) => Err(panic),
        };
        children.wait_idle().await;

        let result = match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(report)) => Err(TaskError::from_report(report)),
            Err(panic) => Err(TaskError::Panicked(panic_message(panic))),
        };
        debug!(uuid = %run.id(), id, ok = result.is_ok(), "spawn_node: work settled");

        let result = run.settle(id, result);
        on_settled();
        result
    });

    TaskHandle {
        run: run_id,
        id,
        inner,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_child_tracker_waits_for_every_child() {
        let tracker = Arc::new(ChildTracker::default());
        tracker.enter();
        tracker.enter();

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_idle().await })
        };

        tracker.leave();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        tracker.leave();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_child_tracker_idle_when_empty() {
        let tracker = ChildTracker::default();
        tokio::time::timeout(Duration::from_millis(50), tracker.wait_idle())
            .await
            .unwrap();
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new("owned".to_string())), "owned");
        assert_eq!(panic_message(Box::new(7u8)), "unknown panic");
    }
}
