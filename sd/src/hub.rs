//! Hub - server-side owner of every manager
//!
//! A transport registers each client with [`Hub::connect`], handing it a
//! [`PushSink`], and feeds its requests to [`Hub::handle`]. The hub forwards
//! commits and lock changes to every connected client and task batches to the
//! ones that subscribed. [`Hub::disconnect`] tears all of it down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::ipc::{Push, Request, Response};
use crate::lock::LockTable;
use crate::state::StateStore;
use crate::task::{TaskManager, TaskSubscriptions};

/// Connection-scoped client id
pub type ClientId = u64;

/// Where pushes for one client go
///
/// An error means the client is gone; the caller stops pushing to it.
pub trait PushSink: Send + Sync + 'static {
    fn push(&self, push: Push) -> eyre::Result<()>;
}

struct Client {
    sink: Arc<dyn PushSink>,
    forwarders: Vec<JoinHandle<()>>,
}

impl Drop for Client {
    fn drop(&mut self) {
        for forwarder in &self.forwarders {
            forwarder.abort();
        }
    }
}

/// Forward every item of `rx` to `sink` until either side closes
///
/// A lagged receiver skips what it missed. For commits the client sees the
/// checkpoint gap and resyncs.
fn forward<T, F>(mut rx: broadcast::Receiver<T>, sink: Arc<dyn PushSink>, client: ClientId, wrap: F) -> JoinHandle<()>
where
    T: Clone + Send + 'static,
    F: Fn(T) -> Push + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(item) => {
                    if sink.push(wrap(item)).is_err() {
                        debug!(client, "forward: sink closed");
                        break;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(client, missed, "forward: client lagged, pushes dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

pub struct Hub {
    state: StateStore,
    tasks: TaskManager,
    locks: LockTable,
    subscriptions: TaskSubscriptions,
    clients: Mutex<HashMap<ClientId, Client>>,
    next_client: AtomicU64,
    version: String,
}

impl Hub {
    pub fn new(config: &Config) -> Self {
        debug!("Hub::new: called");
        let tasks = TaskManager::new(config.tasks.event_capacity);
        let subscriptions =
            TaskSubscriptions::new(tasks.clone(), config.tasks.push_interval(), config.tasks.max_batch_size);
        Self {
            state: StateStore::new(config.state.event_capacity),
            tasks,
            locks: LockTable::new(config.locks.event_capacity),
            subscriptions,
            clients: Mutex::new(HashMap::new()),
            next_client: AtomicU64::new(1),
            version: env!("GIT_DESCRIBE").to_string(),
        }
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn tasks(&self) -> &TaskManager {
        &self.tasks
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    fn clients(&self) -> MutexGuard<'_, HashMap<ClientId, Client>> {
        self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn client_count(&self) -> usize {
        self.clients().len()
    }

    /// Register a client; commits and lock changes flow to `sink` from now on
    pub fn connect(&self, sink: Arc<dyn PushSink>) -> ClientId {
        let id = self.next_client.fetch_add(1, Ordering::SeqCst);
        // Subscribe before returning so nothing committed after connect is missed
        let forwarders = vec![
            forward(self.state.subscribe_commits(), sink.clone(), id, Push::Commit),
            forward(self.locks.subscribe(), sink.clone(), id, Push::Semaphore),
        ];
        self.clients().insert(id, Client { sink, forwarders });
        info!(client = id, "Client connected");
        id
    }

    /// Drop every forwarder and the task pusher of `client`
    pub fn disconnect(&self, client: ClientId) {
        self.subscriptions.unsubscribe(client);
        if self.clients().remove(&client).is_some() {
            info!(client, "Client disconnected");
        }
    }

    /// Answer one request from `client`
    pub fn handle(&self, client: ClientId, request: Request) -> Response {
        debug!(client, ?request, "Hub::handle: called");
        match request {
            Request::Ping => Response::Pong {
                version: self.version.clone(),
            },
            Request::Sync { service, checkpoint } => Response::Snapshot {
                snapshot: self.state.take_snapshot(&service, checkpoint),
            },
            Request::Commit { service, mutation } => Response::Committed {
                checkpoint: self.state.commit(&service, &mutation),
            },
            Request::Services => Response::Services {
                services: self.state.services(),
            },
            Request::TaskSubscribe => {
                let sink = self.clients().get(&client).map(|c| c.sink.clone());
                match sink {
                    Some(sink) => Response::Tasks {
                        tasks: self.subscriptions.subscribe(client, sink),
                    },
                    None => Response::Error {
                        message: format!("Unknown client: {client}"),
                    },
                }
            }
            Request::TaskUnsubscribe => {
                self.subscriptions.unsubscribe(client);
                Response::Ok
            }
            Request::TaskOperation { operation, id } => Response::TaskOperation {
                found: self.tasks.task_operation(operation, id),
            },
            Request::Semaphore => Response::Semaphores {
                counts: self.locks.counts(),
            },
            Request::SemaphoreAbort { key } => Response::Aborted {
                previous: self.locks.abort(&key),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockChange;
    use crate::state::{MutationEnvelope, SETTINGS_SERVICE, SettingsState};
    use crate::task::TaskOperation;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    struct ChannelSink(mpsc::UnboundedSender<Push>);

    impl PushSink for ChannelSink {
        fn push(&self, push: Push) -> eyre::Result<()> {
            self.0.send(push).map_err(|_| eyre::eyre!("closed"))
        }
    }

    fn hub_with_client() -> (Hub, ClientId, mpsc::UnboundedReceiver<Push>) {
        let hub = Hub::new(&Config::default());
        hub.state().register(SETTINGS_SERVICE, SettingsState::default()).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let client = hub.connect(Arc::new(ChannelSink(tx)));
        (hub, client, rx)
    }

    async fn next_push(rx: &mut mpsc::UnboundedReceiver<Push>) -> Push {
        tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_commit_request_is_pushed_back() {
        let (hub, client, mut rx) = hub_with_client();
        let response = hub.handle(
            client,
            Request::Commit {
                service: SETTINGS_SERVICE.to_string(),
                mutation: MutationEnvelope::new("themeSet", json!("dark")),
            },
        );
        assert_eq!(response, Response::Committed { checkpoint: Some(1) });

        match next_push(&mut rx).await {
            Push::Commit(commit) => assert_eq!(commit.checkpoint, 1),
            other => panic!("Expected commit push, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sync_unknown_service_is_null() {
        let (hub, client, _rx) = hub_with_client();
        let response = hub.handle(
            client,
            Request::Sync {
                service: "instances".to_string(),
                checkpoint: 0,
            },
        );
        assert_eq!(response, Response::Snapshot { snapshot: None });
    }

    #[tokio::test]
    async fn test_lock_changes_are_pushed() {
        let (hub, client, mut rx) = hub_with_client();
        hub.locks().acquire("instance:/games/a");

        match next_push(&mut rx).await {
            Push::Semaphore(change) => assert_eq!(
                change,
                LockChange {
                    key: "instance:/games/a".to_string(),
                    count: 1
                }
            ),
            other => panic!("Expected semaphore push, got {other:?}"),
        }

        let response = hub.handle(
            client,
            Request::SemaphoreAbort {
                key: "instance:/games/a".to_string(),
            },
        );
        assert_eq!(response, Response::Aborted { previous: 1 });
    }

    #[tokio::test]
    async fn test_task_operation_unknown_id() {
        let (hub, client, _rx) = hub_with_client();
        let response = hub.handle(
            client,
            Request::TaskOperation {
                operation: TaskOperation::Cancel,
                id: Uuid::now_v7(),
            },
        );
        assert_eq!(response, Response::TaskOperation { found: false });
    }

    #[tokio::test]
    async fn test_disconnect_stops_pushes() {
        let (hub, client, mut rx) = hub_with_client();
        assert!(matches!(hub.handle(client, Request::TaskSubscribe), Response::Tasks { .. }));
        hub.disconnect(client);
        assert_eq!(hub.client_count(), 0);

        hub.locks().acquire("x");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }
}
