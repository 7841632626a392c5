//! ClientReplica - remote mirror of one service state
//!
//! The replica is a plain state machine: it is fed commits and sync replies and
//! says when a resync is needed. [`ReplicaDriver`] wires it to a
//! [`SyncSource`] and a commit stream.
//!
//! Protocol:
//! - `begin_sync` marks the replica as syncing; commits arriving meanwhile are
//!   buffered, never applied.
//! - A sync reply installs the full snapshot, then replays buffered commits
//!   newer than the snapshot's checkpoint.
//! - A live commit whose checkpoint is not `last_applied + 1` is dropped and a
//!   resync is requested. Gaps are never patched or reordered.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::messages::{Commit, Snapshot, StateError, StateResponse};
use super::model::StateModel;

/// Anything that can answer `sync(service, last_checkpoint)`
#[async_trait]
pub trait SyncSource: Send + Sync {
    /// `Ok(None)` means the service is not syncable yet
    async fn sync(&self, service: &str, last_checkpoint: u64) -> eyre::Result<Option<Snapshot>>;
}

/// What the replica did with a live commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Applied; carries the new checkpoint
    Applied(u64),
    /// Held until the outstanding sync reply arrives
    Buffered,
    /// Already covered by the current state
    Stale,
    /// Dropped; the caller must start a sync
    Resync,
    /// Addressed to another service
    Ignored,
}

/// What the replica did with a sync reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Snapshot installed and `replayed` buffered commits applied on top
    Synced { checkpoint: u64, replayed: usize },
    /// The server cannot serve this service yet
    NotSyncable,
    /// The buffered commits had a gap; the caller must start another sync
    Resync,
}

type MutationListener<M> = Box<dyn Fn(&M, u64) + Send>;

/// Local mirror of a remote service state
pub struct ClientReplica<S: StateModel> {
    service: String,
    state: Option<S>,
    last_applied: u64,
    syncing: bool,
    buffered: BTreeMap<u64, Commit>,
    resyncs: u64,
    listeners: Vec<MutationListener<S::Mutation>>,
}

impl<S: StateModel> ClientReplica<S> {
    pub fn new(service: impl Into<String>) -> Self {
        let service = service.into();
        debug!(%service, "ClientReplica::new: called");
        Self {
            service,
            state: None,
            last_applied: 0,
            syncing: false,
            buffered: BTreeMap::new(),
            resyncs: 0,
            listeners: Vec::new(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// The mirrored state, once a snapshot has been installed
    pub fn state(&self) -> Option<&S> {
        self.state.as_ref()
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing
    }

    /// Number of resyncs triggered by gaps or undecodable commits
    pub fn resync_count(&self) -> u64 {
        self.resyncs
    }

    /// Call `listener(mutation, checkpoint)` for every commit applied on top of a snapshot
    pub fn on_mutation(&mut self, listener: impl Fn(&S::Mutation, u64) + Send + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// Mark a sync as outstanding, returning the checkpoint to send with it
    pub fn begin_sync(&mut self) -> u64 {
        debug!(service = %self.service, last_applied = self.last_applied, "ClientReplica::begin_sync");
        self.syncing = true;
        self.last_applied
    }

    fn request_resync(&mut self, reason: &str) -> CommitOutcome {
        self.resyncs += 1;
        self.syncing = true;
        self.buffered.clear();
        debug!(service = %self.service, reason, resyncs = self.resyncs, "ClientReplica: resync required");
        CommitOutcome::Resync
    }

    /// Feed one live commit
    pub fn on_commit(&mut self, commit: Commit) -> CommitOutcome {
        if commit.service_name != self.service {
            return CommitOutcome::Ignored;
        }
        if self.syncing {
            debug!(service = %self.service, checkpoint = commit.checkpoint, "on_commit: buffered while syncing");
            self.buffered.insert(commit.checkpoint, commit);
            return CommitOutcome::Buffered;
        }
        if self.state.is_none() {
            return self.request_resync("commit before any snapshot");
        }
        if commit.checkpoint <= self.last_applied {
            debug!(service = %self.service, checkpoint = commit.checkpoint, "on_commit: stale");
            return CommitOutcome::Stale;
        }
        if commit.checkpoint != self.last_applied + 1 {
            info!(
                service = %self.service,
                last_applied = self.last_applied,
                received = commit.checkpoint,
                "Sync conflict, dropping commit and resyncing"
            );
            return self.request_resync("checkpoint gap");
        }
        self.apply(&commit)
    }

    fn apply(&mut self, commit: &Commit) -> CommitOutcome {
        let mutation: S::Mutation = match commit.mutation.decode() {
            Ok(m) => m,
            Err(e) => {
                warn!(service = %self.service, mutation = %commit.mutation.r#type, error = %e, "Cannot decode commit");
                return self.request_resync("undecodable commit");
            }
        };
        let Some(state) = self.state.as_mut() else {
            return self.request_resync("commit before any snapshot");
        };
        state.apply(&mutation);
        self.last_applied = commit.checkpoint;
        for listener in &self.listeners {
            listener(&mutation, commit.checkpoint);
        }
        CommitOutcome::Applied(commit.checkpoint)
    }

    /// Feed the reply to the outstanding sync
    pub fn on_sync_reply(&mut self, reply: Option<Snapshot>) -> StateResponse<SyncOutcome> {
        self.syncing = false;
        let Some(snapshot) = reply else {
            info!(service = %self.service, "Service is not syncable");
            self.buffered.clear();
            return Ok(SyncOutcome::NotSyncable);
        };

        let state: S = serde_json::from_value(snapshot.state).map_err(|e| {
            self.buffered.clear();
            StateError::Serialization(e.to_string())
        })?;
        self.state = Some(state);
        self.last_applied = snapshot.checkpoint;

        let buffered = std::mem::take(&mut self.buffered);
        let mut replayed = 0;
        for (checkpoint, commit) in buffered {
            if checkpoint <= self.last_applied {
                continue;
            }
            if checkpoint != self.last_applied + 1 {
                self.request_resync("gap in buffered commits");
                return Ok(SyncOutcome::Resync);
            }
            match self.apply(&commit) {
                CommitOutcome::Applied(_) => replayed += 1,
                _ => return Ok(SyncOutcome::Resync),
            }
        }

        info!(service = %self.service, checkpoint = self.last_applied, replayed, "Synced");
        Ok(SyncOutcome::Synced {
            checkpoint: self.last_applied,
            replayed,
        })
    }
}

/// Drives a [`ClientReplica`] from a commit stream and a [`SyncSource`]
pub struct ReplicaDriver<S: StateModel> {
    replica: ClientReplica<S>,
    source: Arc<dyn SyncSource>,
}

impl<S: StateModel> ReplicaDriver<S> {
    pub fn new(replica: ClientReplica<S>, source: Arc<dyn SyncSource>) -> Self {
        Self { replica, source }
    }

    fn start_sync(&mut self) -> BoxFuture<'static, eyre::Result<Option<Snapshot>>> {
        let last = self.replica.begin_sync();
        let source = self.source.clone();
        let service = self.replica.service().to_string();
        Box::pin(async move { source.sync(&service, last).await })
    }

    /// Sync, then follow `commits` until the stream closes
    ///
    /// At most one sync is outstanding at a time. Returns the replica so the
    /// caller can inspect the final state.
    pub async fn run(mut self, mut commits: mpsc::Receiver<Commit>) -> eyre::Result<ClientReplica<S>> {
        debug!(service = %self.replica.service(), "ReplicaDriver::run: called");
        let mut pending = Some(self.start_sync());

        loop {
            tokio::select! {
                reply = async {
                    match pending.as_mut() {
                        Some(sync) => sync.await,
                        None => std::future::pending().await,
                    }
                }, if pending.is_some() => {
                    pending = None;
                    if self.replica.on_sync_reply(reply?)? == SyncOutcome::Resync {
                        pending = Some(self.start_sync());
                    }
                }
                commit = commits.recv() => {
                    let Some(commit) = commit else {
                        debug!(service = %self.replica.service(), "ReplicaDriver::run: commit stream closed");
                        break;
                    };
                    if self.replica.on_commit(commit) == CommitOutcome::Resync && pending.is_none() {
                        pending = Some(self.start_sync());
                    }
                }
            }
        }

        // Let an in-flight sync land so the returned replica is consistent
        while let Some(sync) = pending.take() {
            if self.replica.on_sync_reply(sync.await?)? == SyncOutcome::Resync {
                pending = Some(self.start_sync());
            }
        }
        Ok(self.replica)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::settings::{SettingsMutation, SettingsState};
    use crate::state::{MutationEnvelope, StateStore};
    use serde_json::json;
    use std::sync::Mutex;

    fn commit(checkpoint: u64, locale: &str) -> Commit {
        Commit {
            service_name: "settings".to_string(),
            mutation: MutationEnvelope::new("localeSet", json!(locale)),
            checkpoint,
        }
    }

    fn snapshot(checkpoint: u64, locale: &str) -> Snapshot {
        let state = SettingsState {
            locale: locale.to_string(),
            ..Default::default()
        };
        Snapshot {
            state: serde_json::to_value(state).unwrap(),
            checkpoint,
        }
    }

    fn synced_replica() -> ClientReplica<SettingsState> {
        let mut replica = ClientReplica::new("settings");
        replica.begin_sync();
        replica.on_sync_reply(Some(snapshot(0, "en"))).unwrap();
        replica
    }

    #[test]
    fn test_contiguous_commits_apply() {
        let mut replica = synced_replica();
        assert_eq!(replica.on_commit(commit(1, "de")), CommitOutcome::Applied(1));
        assert_eq!(replica.on_commit(commit(2, "fr")), CommitOutcome::Applied(2));
        assert_eq!(replica.state().unwrap().locale, "fr");
        assert_eq!(replica.resync_count(), 0);
    }

    #[test]
    fn test_gap_triggers_exactly_one_resync() {
        let mut replica = synced_replica();
        assert_eq!(replica.on_commit(commit(1, "de")), CommitOutcome::Applied(1));
        assert_eq!(replica.on_commit(commit(2, "fr")), CommitOutcome::Applied(2));
        assert_eq!(replica.on_commit(commit(4, "ja")), CommitOutcome::Resync);

        // Commit 4 was not applied atop 2
        assert_eq!(replica.last_applied(), 2);
        assert_eq!(replica.state().unwrap().locale, "fr");

        // Later commits wait for the sync instead of triggering more resyncs
        assert_eq!(replica.on_commit(commit(5, "ko")), CommitOutcome::Buffered);
        assert_eq!(replica.resync_count(), 1);

        let outcome = replica.on_sync_reply(Some(snapshot(4, "ja"))).unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Synced {
                checkpoint: 5,
                replayed: 1
            }
        );
        assert_eq!(replica.state().unwrap().locale, "ko");
        assert_eq!(replica.resync_count(), 1);
    }

    #[test]
    fn test_commits_buffered_during_initial_sync() {
        let mut replica: ClientReplica<SettingsState> = ClientReplica::new("settings");
        assert_eq!(replica.begin_sync(), 0);
        assert_eq!(replica.on_commit(commit(3, "de")), CommitOutcome::Buffered);
        assert_eq!(replica.on_commit(commit(4, "fr")), CommitOutcome::Buffered);
        assert!(replica.state().is_none());

        // Snapshot already includes 3; only 4 is replayed
        let outcome = replica.on_sync_reply(Some(snapshot(3, "de"))).unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Synced {
                checkpoint: 4,
                replayed: 1
            }
        );
        assert_eq!(replica.state().unwrap().locale, "fr");
    }

    #[test]
    fn test_snapshot_wins_over_buffered_commits() {
        let mut replica: ClientReplica<SettingsState> = ClientReplica::new("settings");
        replica.begin_sync();
        replica.on_commit(commit(1, "de"));
        replica.on_commit(commit(2, "fr"));

        let outcome = replica.on_sync_reply(Some(snapshot(5, "ja"))).unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Synced {
                checkpoint: 5,
                replayed: 0
            }
        );
        assert_eq!(replica.state().unwrap().locale, "ja");
    }

    #[test]
    fn test_gap_in_buffer_requests_another_sync() {
        let mut replica: ClientReplica<SettingsState> = ClientReplica::new("settings");
        replica.begin_sync();
        replica.on_commit(commit(7, "de"));

        let outcome = replica.on_sync_reply(Some(snapshot(5, "en"))).unwrap();
        assert_eq!(outcome, SyncOutcome::Resync);
        assert!(replica.is_syncing());
        assert_eq!(replica.last_applied(), 5);
    }

    #[test]
    fn test_stale_and_foreign_commits() {
        let mut replica = synced_replica();
        replica.on_commit(commit(1, "de"));
        assert_eq!(replica.on_commit(commit(1, "de")), CommitOutcome::Stale);

        let mut other = commit(2, "fr");
        other.service_name = "instances".to_string();
        assert_eq!(replica.on_commit(other), CommitOutcome::Ignored);
    }

    #[test]
    fn test_not_syncable_then_commit_requests_sync() {
        let mut replica: ClientReplica<SettingsState> = ClientReplica::new("settings");
        replica.begin_sync();
        assert_eq!(replica.on_sync_reply(None).unwrap(), SyncOutcome::NotSyncable);
        assert!(!replica.is_syncing());
        assert_eq!(replica.on_commit(commit(1, "de")), CommitOutcome::Resync);
    }

    #[test]
    fn test_undecodable_commit_forces_resync() {
        let mut replica = synced_replica();
        let bad = Commit {
            service_name: "settings".to_string(),
            mutation: MutationEnvelope::new("addedInNewerVersion", json!({})),
            checkpoint: 1,
        };
        assert_eq!(replica.on_commit(bad), CommitOutcome::Resync);
        assert_eq!(replica.last_applied(), 0);
    }

    #[test]
    fn test_listeners_see_applied_mutations() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut replica = synced_replica();
        let recorder = seen.clone();
        replica.on_mutation(move |m, cp| recorder.lock().unwrap().push((m.clone(), cp)));

        replica.on_commit(commit(1, "de"));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(SettingsMutation::LocaleSet("de".to_string()), 1)]
        );
    }

    #[tokio::test]
    async fn test_driver_converges_with_store() {
        let store = StateStore::default();
        let handle = store.register("settings", SettingsState::default()).unwrap();
        handle.commit(SettingsMutation::LocaleSet("de".to_string())).unwrap();

        let (tx, rx) = mpsc::channel(16);
        let driver = ReplicaDriver::new(ClientReplica::<SettingsState>::new("settings"), Arc::new(store.clone()));
        let task = tokio::spawn(driver.run(rx));

        let mut commits = store.subscribe_commits();
        handle.commit(SettingsMutation::MaxMemorySet(8192)).unwrap();
        handle.commit(SettingsMutation::ThemeSet("dark".to_string())).unwrap();
        // Drop checkpoint 2 on the way to force a gap
        let c2 = commits.recv().await.unwrap();
        let c3 = commits.recv().await.unwrap();
        assert_eq!(c2.checkpoint, 2);
        tx.send(c3).await.unwrap();
        drop(tx);

        let replica = task.await.unwrap().unwrap();
        let expected = handle.read(|s| s.clone());
        assert_eq!(replica.state(), Some(&expected));
        assert_eq!(replica.last_applied(), 3);
    }
}
