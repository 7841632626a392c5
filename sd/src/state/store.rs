//! StateStore - registry of checkpointed service states
//!
//! Each registered service owns its state behind a mutex. A commit applies the
//! mutation, bumps the checkpoint, notifies local listeners, and broadcasts the
//! commit without releasing the mutex in between, so commits leave the store in
//! checkpoint order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::messages::{Commit, MutationEnvelope, ServiceInfo, Snapshot, StateError, StateResponse};
use super::model::{Mutation, StateModel};
use super::replica::SyncSource;

/// Default broadcast capacity for the commit stream
pub const DEFAULT_COMMIT_CAPACITY: usize = 1024;

type Listener<M> = Arc<dyn Fn(&M) + Send + Sync>;

struct SlotInner<S: StateModel> {
    state: S,
    checkpoint: u64,
    listeners: Vec<(Option<String>, Listener<S::Mutation>)>,
}

/// One service's state and its commit path
struct Slot<S: StateModel> {
    name: String,
    inner: Mutex<SlotInner<S>>,
    tx: broadcast::Sender<Commit>,
}

impl<S: StateModel> Slot<S> {
    fn lock(&self) -> MutexGuard<'_, SlotInner<S>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn commit(&self, mutation: S::Mutation) -> StateResponse<u64> {
        // Encode first so a serialization failure leaves the state untouched
        let envelope = MutationEnvelope::encode(&mutation)?;
        let name = mutation.name();

        let mut inner = self.lock();
        inner.state.apply(&mutation);
        inner.checkpoint += 1;
        let checkpoint = inner.checkpoint;

        for (filter, listener) in &inner.listeners {
            if filter.as_deref().is_none_or(|f| f == name) {
                listener(&mutation);
            }
        }

        debug!(service = %self.name, mutation = name, checkpoint, "commit: applied");
        let _ = self.tx.send(Commit {
            service_name: self.name.clone(),
            mutation: envelope,
            checkpoint,
        });

        Ok(checkpoint)
    }
}

/// Type-erased access used by the store and the transport
trait ServiceCell: Send + Sync {
    fn snapshot(&self) -> StateResponse<Snapshot>;
    fn commit_envelope(&self, envelope: &MutationEnvelope) -> StateResponse<u64>;
    fn checkpoint(&self) -> u64;
}

impl<S: StateModel> ServiceCell for Slot<S> {
    fn snapshot(&self) -> StateResponse<Snapshot> {
        let inner = self.lock();
        Ok(Snapshot {
            state: serde_json::to_value(&inner.state)?,
            checkpoint: inner.checkpoint,
        })
    }

    fn commit_envelope(&self, envelope: &MutationEnvelope) -> StateResponse<u64> {
        let mutation: S::Mutation = envelope.decode().map_err(|_| StateError::MutationNotFound {
            service: self.name.clone(),
            mutation: envelope.r#type.clone(),
        })?;
        self.commit(mutation)
    }

    fn checkpoint(&self) -> u64 {
        self.lock().checkpoint
    }
}

enum ServiceEntry {
    /// Announced, state not installed yet
    Reserved,
    Ready(Arc<dyn ServiceCell>),
}

struct StoreInner {
    services: RwLock<HashMap<String, ServiceEntry>>,
    tx: broadcast::Sender<Commit>,
}

/// Registry of service states
///
/// Cheap to clone; all clones share the same services and commit stream.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<StoreInner>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(DEFAULT_COMMIT_CAPACITY)
    }
}

impl StateStore {
    pub fn new(capacity: usize) -> Self {
        debug!(capacity, "StateStore::new: called");
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(StoreInner {
                services: RwLock::new(HashMap::new()),
                tx,
            }),
        }
    }

    /// Subscribe to every commit across all services
    pub fn subscribe_commits(&self) -> broadcast::Receiver<Commit> {
        self.inner.tx.subscribe()
    }

    fn ready(&self, service: &str) -> StateResponse<Arc<dyn ServiceCell>> {
        let services = self.inner.services.read().unwrap_or_else(|e| e.into_inner());
        match services.get(service) {
            Some(ServiceEntry::Ready(cell)) => Ok(cell.clone()),
            Some(ServiceEntry::Reserved) => Err(StateError::NotReady(service.to_string())),
            None => Err(StateError::UnknownService(service.to_string())),
        }
    }

    /// Announce a service whose state is still being initialized
    ///
    /// Until [`StateStore::register`] installs the state, `sync` answers `None`.
    pub fn reserve(&self, name: &str) {
        debug!(%name, "StateStore::reserve: called");
        let mut services = self.inner.services.write().unwrap_or_else(|e| e.into_inner());
        services.entry(name.to_string()).or_insert(ServiceEntry::Reserved);
    }

    /// Register a service with its initial state, starting at checkpoint 0
    pub fn register<S: StateModel>(&self, name: &str, initial: S) -> StateResponse<StateHandle<S>> {
        debug!(%name, "StateStore::register: called");
        let mut services = self.inner.services.write().unwrap_or_else(|e| e.into_inner());
        if let Some(ServiceEntry::Ready(_)) = services.get(name) {
            return Err(StateError::AlreadyRegistered(name.to_string()));
        }

        let slot = Arc::new(Slot {
            name: name.to_string(),
            inner: Mutex::new(SlotInner {
                state: initial,
                checkpoint: 0,
                listeners: Vec::new(),
            }),
            tx: self.inner.tx.clone(),
        });
        services.insert(name.to_string(), ServiceEntry::Ready(slot.clone()));
        info!(%name, "Registered service state");

        Ok(StateHandle { slot })
    }

    /// Apply a mutation received from a client
    ///
    /// Unknown services, services still initializing, and mutation names the
    /// state does not declare are logged and ignored. Returns the new checkpoint
    /// when the mutation was applied.
    pub fn commit(&self, service: &str, envelope: &MutationEnvelope) -> Option<u64> {
        debug!(%service, mutation = %envelope.r#type, "StateStore::commit: called");
        let result = self.ready(service).and_then(|cell| cell.commit_envelope(envelope));
        match result {
            Ok(checkpoint) => Some(checkpoint),
            Err(e) => {
                warn!(%service, mutation = %envelope.r#type, error = %e, "Ignoring commit");
                None
            }
        }
    }

    /// Current full snapshot of a service
    ///
    /// Always the whole state, whatever `last_known` is. `None` when the service
    /// is unknown or not yet installed.
    pub fn take_snapshot(&self, service: &str, last_known: u64) -> Option<Snapshot> {
        debug!(%service, last_known, "StateStore::take_snapshot: called");
        let snapshot = self.ready(service).and_then(|cell| cell.snapshot());
        match snapshot {
            Ok(snapshot) => {
                debug!(%service, last_known, checkpoint = snapshot.checkpoint, "take_snapshot: full snapshot");
                Some(snapshot)
            }
            Err(e) => {
                debug!(%service, error = %e, "take_snapshot: not syncable");
                None
            }
        }
    }

    /// All known services with their checkpoints, sorted by name
    pub fn services(&self) -> Vec<ServiceInfo> {
        let services = self.inner.services.read().unwrap_or_else(|e| e.into_inner());
        let mut infos: Vec<ServiceInfo> = services
            .iter()
            .map(|(name, entry)| ServiceInfo {
                name: name.clone(),
                checkpoint: match entry {
                    ServiceEntry::Ready(cell) => Some(cell.checkpoint()),
                    ServiceEntry::Reserved => None,
                },
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }
}

#[async_trait]
impl SyncSource for StateStore {
    async fn sync(&self, service: &str, last_checkpoint: u64) -> eyre::Result<Option<Snapshot>> {
        Ok(self.take_snapshot(service, last_checkpoint))
    }
}

/// Typed handle to one registered service
#[derive(Clone)]
pub struct StateHandle<S: StateModel> {
    slot: Arc<Slot<S>>,
}

impl<S: StateModel> StateHandle<S> {
    pub fn name(&self) -> &str {
        &self.slot.name
    }

    /// Apply a mutation, returning the new checkpoint
    pub fn commit(&self, mutation: S::Mutation) -> StateResponse<u64> {
        self.slot.commit(mutation)
    }

    /// Current checkpoint
    pub fn checkpoint(&self) -> u64 {
        self.slot.lock().checkpoint
    }

    /// Read the state without copying it
    pub fn read<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&self.slot.lock().state)
    }

    /// Current full snapshot
    pub fn snapshot(&self) -> StateResponse<Snapshot> {
        ServiceCell::snapshot(self.slot.as_ref())
    }

    /// Call `listener` synchronously after every commit of the named mutation
    ///
    /// Listeners run while the service is locked. They must not call back
    /// into the same service through any handle: `commit`, `read`,
    /// `checkpoint`, `snapshot` and the store's `commit`/`take_snapshot` for
    /// this service all block on that lock and deadlock.
    pub fn subscribe(&self, mutation: &str, listener: impl Fn(&S::Mutation) + Send + Sync + 'static) {
        self.slot
            .lock()
            .listeners
            .push((Some(mutation.to_string()), Arc::new(listener)));
    }

    /// Call `listener` synchronously after every commit
    ///
    /// The same restrictions as [`StateHandle::subscribe`] apply.
    pub fn subscribe_all(&self, listener: impl Fn(&S::Mutation) + Send + Sync + 'static) {
        self.slot.lock().listeners.push((None, Arc::new(listener)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::settings::{SettingsMutation, SettingsState};
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn store_with_settings() -> (StateStore, StateHandle<SettingsState>) {
        let store = StateStore::default();
        let handle = store.register("settings", SettingsState::default()).unwrap();
        (store, handle)
    }

    #[test]
    fn test_checkpoint_increments_once_per_commit() {
        let (_store, handle) = store_with_settings();
        assert_eq!(handle.checkpoint(), 0);
        assert_eq!(handle.commit(SettingsMutation::LocaleSet("de".to_string())).unwrap(), 1);
        assert_eq!(handle.commit(SettingsMutation::MaxMemorySet(4096)).unwrap(), 2);
        assert_eq!(handle.checkpoint(), 2);
        handle.read(|s| {
            assert_eq!(s.locale, "de");
            assert_eq!(s.max_memory, 4096);
        });
    }

    #[test]
    fn test_register_twice_fails() {
        let (store, _handle) = store_with_settings();
        let result = store.register("settings", SettingsState::default());
        assert!(matches!(result, Err(StateError::AlreadyRegistered(_))));
    }

    #[test]
    fn test_commit_is_broadcast_in_order() {
        let (store, handle) = store_with_settings();
        let mut rx = store.subscribe_commits();

        handle.commit(SettingsMutation::ThemeSet("dark".to_string())).unwrap();
        handle.commit(SettingsMutation::JavaPathAdd("/usr/bin/java".to_string())).unwrap();

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.service_name, "settings");
        assert_eq!(first.checkpoint, 1);
        assert_eq!(first.mutation, MutationEnvelope::new("themeSet", json!("dark")));
        assert_eq!(second.checkpoint, 2);
    }

    #[test]
    fn test_local_listeners_filter_by_name() {
        let (_store, handle) = store_with_settings();
        let locale_calls = Arc::new(AtomicUsize::new(0));
        let all_calls = Arc::new(AtomicUsize::new(0));

        let counter = locale_calls.clone();
        handle.subscribe("localeSet", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = all_calls.clone();
        handle.subscribe_all(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        handle.commit(SettingsMutation::LocaleSet("fr".to_string())).unwrap();
        handle.commit(SettingsMutation::MaxMemorySet(2048)).unwrap();

        assert_eq!(locale_calls.load(Ordering::SeqCst), 1);
        assert_eq!(all_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_remote_commit_applies_known_mutation() {
        let (store, handle) = store_with_settings();
        let checkpoint = store.commit("settings", &MutationEnvelope::new("localeSet", json!("ja")));
        assert_eq!(checkpoint, Some(1));
        handle.read(|s| assert_eq!(s.locale, "ja"));
    }

    #[test]
    fn test_remote_commit_unknown_mutation_is_ignored() {
        let (store, handle) = store_with_settings();
        let mut rx = store.subscribe_commits();

        let result = store.commit("settings", &MutationEnvelope::new("removedMutation", json!(true)));
        assert_eq!(result, None);
        assert_eq!(handle.checkpoint(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_remote_commit_unknown_service_is_ignored() {
        let store = StateStore::default();
        assert_eq!(store.commit("missing", &MutationEnvelope::new("x", json!(null))), None);
    }

    #[test]
    fn test_snapshot_is_always_full() {
        let (store, handle) = store_with_settings();
        handle.commit(SettingsMutation::LocaleSet("es".to_string())).unwrap();
        handle.commit(SettingsMutation::MaxMemorySet(1024)).unwrap();

        let from_zero = store.take_snapshot("settings", 0).unwrap();
        let from_one = store.take_snapshot("settings", 1).unwrap();
        let up_to_date = store.take_snapshot("settings", 2).unwrap();

        assert_eq!(from_zero, from_one);
        assert_eq!(from_zero, up_to_date);
        assert_eq!(from_zero.checkpoint, 2);
        assert_eq!(from_zero.state["locale"], json!("es"));
        assert_eq!(from_zero, handle.snapshot().unwrap());
    }

    fn any_mutation() -> impl Strategy<Value = SettingsMutation> {
        prop_oneof![
            "[a-z]{2}".prop_map(SettingsMutation::LocaleSet),
            "(dark|light|system)".prop_map(SettingsMutation::ThemeSet),
            (256u32..16384).prop_map(SettingsMutation::MaxMemorySet),
            "/opt/jdk[0-9]{2}".prop_map(SettingsMutation::JavaPathAdd),
            "/opt/jdk[0-9]{2}".prop_map(SettingsMutation::JavaPathRemove),
            Just(SettingsMutation::Reset),
        ]
    }

    proptest! {
        #[test]
        fn test_checkpoint_counts_mutations(mutations in proptest::collection::vec(any_mutation(), 0..40)) {
            let (store, handle) = store_with_settings();
            let mut rx = store.subscribe_commits();
            let mut local = SettingsState::default();

            for (i, mutation) in mutations.iter().enumerate() {
                let checkpoint = handle.commit(mutation.clone()).unwrap();
                prop_assert_eq!(checkpoint, i as u64 + 1);
                local.apply(mutation);
                prop_assert_eq!(rx.try_recv().unwrap().checkpoint, checkpoint);
            }

            let snapshot = store.take_snapshot("settings", 0).unwrap();
            prop_assert_eq!(snapshot.checkpoint, mutations.len() as u64);
            prop_assert_eq!(&snapshot, &handle.snapshot().unwrap());
            prop_assert_eq!(snapshot.state, serde_json::to_value(&local).unwrap());
        }
    }

    #[test]
    fn test_reserved_service_is_not_syncable() {
        let store = StateStore::default();
        store.reserve("instances");
        assert!(store.take_snapshot("instances", 0).is_none());
        assert_eq!(
            store.services(),
            vec![ServiceInfo {
                name: "instances".to_string(),
                checkpoint: None
            }]
        );

        store.register("instances", SettingsState::default()).unwrap();
        assert_eq!(store.take_snapshot("instances", 0).unwrap().checkpoint, 0);
    }
}
